use thiserror::Error;
use tracing::{error, warn};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[cfg(feature = "sqlite")]
    #[error("There was a problem with the connection to the sqlite database: {source}")]
    Sqlite {
        #[from]
        source: rusqlite::Error,
    },
    #[error("Could not reach an external service: {source}")]
    Http {
        #[from]
        source: reqwest::Error,
    },
    #[error("Could not (de)serialize a record: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },
    /// Missing or unusable credential/config. Fatal to the whole run.
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// Chain/authority mismatch or signer/delegate mismatch.
    #[error("Integrity error: {0}")]
    Integrity(String),
    /// A caveat enforcer rejected the redemption.
    #[error("Permission denied by {}: {reason}", .enforcer.as_deref().unwrap_or("an enforcer"))]
    PermissionDenied {
        enforcer: Option<String>,
        reason: String,
    },
    /// Quote or ledger call failed; retried on the schedule's next tick.
    #[error("Transient execution error: {0}")]
    TransientExecution(String),
    #[error("Schedule expired or exhausted: {0}")]
    ExpiredOrExhausted(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl Error {
    pub fn bad_config(message: impl Into<String>) -> Self {
        let message = message.into();
        error!("BadConfig: {}", message);
        Self::Configuration(message)
    }

    pub fn integrity(message: impl Into<String>) -> Self {
        let message = message.into();
        error!("Integrity: {}", message);
        Self::Integrity(message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        let message = message.into();
        warn!("Transient: {}", message);
        Self::TransientExecution(message)
    }

    pub fn denied(enforcer: Option<&str>, reason: impl Into<String>) -> Self {
        Self::PermissionDenied {
            enforcer: enforcer.map(ToOwned::to_owned),
            reason: reason.into(),
        }
    }

    /// Whether the failure belongs to the schedule and should be retried on a later tick.
    ///
    /// Everything except configuration errors is schedule-scoped.
    pub fn is_schedule_scoped(&self) -> bool {
        !matches!(self, Self::Configuration(_))
    }

    /// Network or ledger hiccups that the next tick may not hit again.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientExecution(_) | Self::Http { .. })
    }

    /// Stable identifier recorded in execution history.
    pub fn kind(&self) -> &'static str {
        match self {
            #[cfg(feature = "sqlite")]
            Self::Sqlite { .. } => "storage",
            Self::Http { .. } => "transient",
            Self::Serialization { .. } => "serialization",
            Self::Configuration(_) => "configuration",
            Self::Integrity(_) => "integrity",
            Self::PermissionDenied { .. } => "permission_denied",
            Self::TransientExecution(_) => "transient",
            Self::ExpiredOrExhausted(_) => "expired_or_exhausted",
            Self::NotFound(_) => "not_found",
            Self::InvalidParameter(_) => "invalid_parameter",
            Self::InvalidState(_) => "invalid_state",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_denied_names_the_enforcer() {
        let error = Error::denied(Some("AllowedTargets"), "target not allowed");
        assert_eq!(
            error.to_string(),
            "Permission denied by AllowedTargets: target not allowed"
        );

        let generic = Error::denied(None, "reverted");
        assert_eq!(generic.to_string(), "Permission denied by an enforcer: reverted");
    }

    #[test]
    fn configuration_errors_are_not_schedule_scoped() {
        assert!(!Error::bad_config("missing key").is_schedule_scoped());
        assert!(Error::transient("rate limited").is_schedule_scoped());
        assert_eq!(Error::transient("x").kind(), "transient");
        assert!(Error::transient("x").is_transient());
        assert!(!Error::denied(None, "reverted").is_transient());
    }
}
