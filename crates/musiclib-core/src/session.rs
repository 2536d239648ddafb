use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A named, ordered track list that sat on the external device between
/// `activated_at` and `superseded_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaylistSession {
    /// Unique per activation, so a reused name never shares recovery work
    /// with an earlier session of the same name.
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub tracks: Vec<String>,
    pub activated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accounted_at: Option<DateTime<Utc>>,
}

impl PlaylistSession {
    pub fn new(name: impl Into<String>, tracks: Vec<String>, activated_at: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            tracks,
            activated_at,
            superseded_at: None,
            accounted_at: None,
        }
    }

    pub fn is_current(&self) -> bool {
        self.superseded_at.is_none()
    }

    /// End of the accounting window: the explicit override, else the moment
    /// this session was superseded, else `now`.
    pub fn window_end(
        &self,
        override_end: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        override_end.or(self.superseded_at).unwrap_or(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn window_end_prefers_override_then_supersede_time() {
        let start = Utc
            .with_ymd_and_hms(2026, 5, 1, 8, 0, 0)
            .single()
            .expect("start");
        let now = start + Duration::days(10);
        let mut session = PlaylistSession::new("workout", vec!["/m/a.mp3".into()], start);
        assert_eq!(session.window_end(None, now), now);

        let superseded = start + Duration::days(3);
        session.superseded_at = Some(superseded);
        assert!(!session.is_current());
        assert_eq!(session.window_end(None, now), superseded);

        let explicit = start + Duration::days(2);
        assert_eq!(session.window_end(Some(explicit), now), explicit);
    }
}
