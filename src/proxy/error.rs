//! Orchestrator error types.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::discovery::lister::ListError;
use crate::discovery::watcher::WatchError;
use crate::net::listener::{ListenerError, ListenerKey};

/// Coarse classification of a [`ProxyError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The backend is the proxy itself or lives in a reserved namespace.
    Reserved,
    /// No routing entry exists for the host key.
    NotFound,
    /// A listener for the pair already exists.
    AlreadyExists,
    /// The listener is already bound.
    AlreadyListening,
    /// Listener creation or teardown failed.
    Listener,
    /// A shutdown step was not acknowledged in time.
    Timeout,
    /// The backend-listing collaborator failed.
    Collaborator,
    /// One or more shutdown steps failed.
    Shutdown,
}

impl ErrorKind {
    /// Kinds that callers treat as success.
    pub fn is_idempotent(self) -> bool {
        matches!(self, ErrorKind::AlreadyExists | ErrorKind::AlreadyListening)
    }
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("backend {0} is reserved")]
    Reserved(String),

    #[error("no backend registered for host key {0:?}")]
    NotFound(String),

    #[error("listener {0} already exists")]
    AlreadyExists(ListenerKey),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error(transparent)]
    Watch(#[from] WatchError),

    #[error(transparent)]
    Collaborator(#[from] ListError),

    #[error("{task} task did not finish within {timeout:?}")]
    TaskTimeout {
        task: &'static str,
        timeout: Duration,
    },

    #[error("proxy is shutting down")]
    Stopped,

    #[error("shutdown failed: {}", Aggregate(.0))]
    Shutdown(Vec<ProxyError>),
}

impl ProxyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProxyError::Reserved(_) => ErrorKind::Reserved,
            ProxyError::NotFound(_) => ErrorKind::NotFound,
            ProxyError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            ProxyError::Listener(ListenerError::AlreadyListening(_)) => ErrorKind::AlreadyListening,
            ProxyError::Listener(ListenerError::CloseTimeout { .. }) => ErrorKind::Timeout,
            ProxyError::Listener(_) => ErrorKind::Listener,
            ProxyError::Watch(WatchError::StopTimeout(_)) => ErrorKind::Timeout,
            ProxyError::TaskTimeout { .. } => ErrorKind::Timeout,
            ProxyError::Watch(_) => ErrorKind::Collaborator,
            ProxyError::Collaborator(_) => ErrorKind::Collaborator,
            ProxyError::Stopped | ProxyError::Shutdown(_) => ErrorKind::Shutdown,
        }
    }

    pub fn is_idempotent(&self) -> bool {
        self.kind().is_idempotent()
    }
}

struct Aggregate<'a>(&'a [ProxyError]);

impl fmt::Display for Aggregate<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::backend::Protocol;

    #[test]
    fn listener_errors_are_classified() {
        let key = ListenerKey::new(Protocol::Tcp, 80);
        let already: ProxyError = ListenerError::AlreadyListening(key.clone()).into();
        assert_eq!(already.kind(), ErrorKind::AlreadyListening);
        assert!(already.is_idempotent());

        let timeout: ProxyError = ListenerError::CloseTimeout {
            key: key.clone(),
            timeout: Duration::from_secs(5),
        }
        .into();
        assert_eq!(timeout.kind(), ErrorKind::Timeout);
        assert!(!timeout.is_idempotent());

        assert!(ProxyError::AlreadyExists(key).is_idempotent());
        assert!(!ProxyError::NotFound("foo".into()).is_idempotent());
    }

    #[test]
    fn shutdown_lists_every_failure() {
        let err = ProxyError::Shutdown(vec![
            WatchError::StopTimeout(Duration::from_secs(5)).into(),
            ProxyError::NotFound("foo".into()),
        ]);
        assert_eq!(err.kind(), ErrorKind::Shutdown);
        let message = err.to_string();
        assert!(message.starts_with("shutdown failed: "));
        assert!(message.contains("; "));
    }
}
