use musiclib_core::DeferredOperation;
use serde::Serialize;
use std::time::Duration;

/// Result of a directly invoked operation that needs the store lock.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "kebab-case")]
pub enum Outcome<T> {
    Completed(T),
    /// The lock stayed busy past the timeout; the operation was queued.
    Deferred(DeferredOperation),
}

impl<T> Outcome<T> {
    pub fn completed(self) -> Option<T> {
        match self {
            Outcome::Completed(value) => Some(value),
            Outcome::Deferred(_) => None,
        }
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, Outcome::Deferred(_))
    }
}

/// One bounded attempt at the store lock.
#[derive(Debug)]
pub enum Attempt<T> {
    Completed(T),
    Contended { waited: Duration },
}

impl<T> Attempt<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Attempt<U> {
        match self {
            Attempt::Completed(value) => Attempt::Completed(f(value)),
            Attempt::Contended { waited } => Attempt::Contended { waited },
        }
    }
}
