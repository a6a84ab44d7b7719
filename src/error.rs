//! Error taxonomy shared by the browser layer, the intake pipeline and the chat transport.

use fantoccini::error::CmdError;
use thiserror::Error;

use crate::model::Site;

#[derive(Debug, Error)]
pub enum BotError {
    /// The vendor session is logged out and automated recovery did not restore it.
    #[error("{site} 세션 만료")]
    SessionExpired { site: Site },

    #[error("element not found: {0}")]
    ElementNotFound(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    /// A shared resource stayed locked past its wait budget.
    #[error("busy: {0}")]
    Busy(String),

    #[error("browser error: {0}")]
    Browser(String),

    #[error("telegram error: {0}")]
    Telegram(String),

    #[error("store error at {path}: {source}")]
    Store {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("{0}")]
    Unknown(String),
}

pub type Result<T> = std::result::Result<T, BotError>;

/// Coarse failure class used to pick a recovery policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    SessionExpired,
    ElementNotFound,
    Timeout,
    NetworkUnreachable,
    Unknown,
}

/// What the caller should do after a failed scrape or send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Leave everything as is; the next scheduled cycle tries again.
    RetryNextCycle,
    /// Tear the session down so the next cycle starts fresh.
    RecreateSession,
    /// Tear down and tell the operator; automation cannot fix it.
    NotifyOperator,
}

impl BotError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BotError::SessionExpired { .. } => ErrorKind::SessionExpired,
            BotError::ElementNotFound(_) => ErrorKind::ElementNotFound,
            BotError::Timeout(_) => ErrorKind::Timeout,
            BotError::NetworkUnreachable(_) => ErrorKind::NetworkUnreachable,
            BotError::Busy(_)
            | BotError::Browser(_)
            | BotError::Telegram(_)
            | BotError::Store { .. }
            | BotError::Config(_)
            | BotError::Io(_)
            | BotError::Json(_)
            | BotError::Csv(_)
            | BotError::Unknown(_) => ErrorKind::Unknown,
        }
    }

    pub fn recovery(&self) -> Recovery {
        match self {
            // Lock contention says nothing about the session itself.
            BotError::Busy(_) => Recovery::RetryNextCycle,
            BotError::Browser(_) => Recovery::RecreateSession,
            other => other.kind().recovery(),
        }
    }

    pub fn is_session_expired(&self) -> bool {
        self.kind() == ErrorKind::SessionExpired
    }

    pub fn session_expired(site: Site) -> Self {
        BotError::SessionExpired { site }
    }
}

impl ErrorKind {
    pub fn recovery(self) -> Recovery {
        match self {
            ErrorKind::SessionExpired => Recovery::NotifyOperator,
            ErrorKind::ElementNotFound | ErrorKind::Timeout => Recovery::RecreateSession,
            ErrorKind::NetworkUnreachable => Recovery::RetryNextCycle,
            ErrorKind::Unknown => Recovery::NotifyOperator,
        }
    }
}

impl From<CmdError> for BotError {
    fn from(e: CmdError) -> Self {
        match e {
            CmdError::NoSuchElement(ref inner) => BotError::ElementNotFound(inner.to_string()),
            CmdError::WaitTimeout => BotError::Timeout("waiting for element".to_string()),
            CmdError::Lost(ref inner) => BotError::NetworkUnreachable(inner.to_string()),
            other => BotError::Browser(other.to_string()),
        }
    }
}

impl From<fantoccini::error::NewSessionError> for BotError {
    fn from(e: fantoccini::error::NewSessionError) -> Self {
        BotError::Browser(format!("webdriver session: {e}"))
    }
}

impl From<teloxide::RequestError> for BotError {
    fn from(e: teloxide::RequestError) -> Self {
        match e {
            teloxide::RequestError::Network(ref inner)
                if inner.is_connect() || inner.is_timeout() =>
            {
                BotError::NetworkUnreachable(inner.to_string())
            }
            other => BotError::Telegram(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for BotError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() {
            BotError::NetworkUnreachable(e.to_string())
        } else {
            BotError::Unknown(e.to_string())
        }
    }
}

impl From<tokio::time::error::Elapsed> for BotError {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        BotError::Timeout(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_recovery() {
        assert_eq!(
            BotError::session_expired(Site::Sms).recovery(),
            Recovery::NotifyOperator
        );
        assert_eq!(
            BotError::ElementNotFound("frame".into()).recovery(),
            Recovery::RecreateSession
        );
        assert_eq!(
            BotError::Timeout("scrape".into()).recovery(),
            Recovery::RecreateSession
        );
        assert_eq!(
            BotError::NetworkUnreachable("dns".into()).recovery(),
            Recovery::RetryNextCycle
        );
        assert_eq!(
            BotError::Unknown("boom".into()).recovery(),
            Recovery::NotifyOperator
        );
    }

    #[test]
    fn busy_and_browser_errors_have_their_own_policy() {
        assert_eq!(BotError::Busy("poll".into()).kind(), ErrorKind::Unknown);
        assert_eq!(BotError::Busy("poll".into()).recovery(), Recovery::RetryNextCycle);
        assert_eq!(
            BotError::Browser("window closed".into()).recovery(),
            Recovery::RecreateSession
        );
    }

    #[test]
    fn wait_timeout_becomes_timeout() {
        let err: BotError = CmdError::WaitTimeout.into();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn session_expired_message_names_the_site() {
        let err = BotError::session_expired(Site::Storefront);
        assert!(err.is_session_expired());
        assert_eq!(err.to_string(), "스마트스토어 세션 만료");
    }
}
