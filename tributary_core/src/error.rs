use std::error::Error as StdError;
use std::time::Duration;

/// Common error type for `tributary_core`.
///
/// The pipeline-facing variants follow the sync error taxonomy: some are
/// retried where they occur, some are absorbed per entity or lineage, and the
/// rest fail the whole job. Use [`Error::class`] to get the classification.
///
/// Concrete backend implementations (SQLite, Postgres, HTTP) should preserve
/// the underlying error chain where possible via `Error::backend`.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("source credentials expired: {0}")]
    AuthExpired(String),

    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("transient network error: {0}")]
    TransientNetwork(String),

    #[error("schema violation for '{entity_type}': {message}")]
    SchemaViolation {
        entity_type: String,
        message: String,
    },

    #[error("stage '{stage}' failed: {message}")]
    StageFailure { stage: String, message: String },

    #[error("permanent source error: {0}")]
    PermanentSource(String),

    #[error("fatal destination error: {0}")]
    FatalDestination(String),

    #[error("concurrency limit exceeded: {0}")]
    ConcurrencyLimitExceeded(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("backend error: {context}")]
    Backend {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync + 'static>,
    },

    #[error("backend error: {0}")]
    BackendMessage(String),
}

/// Coarse classification used for retry decisions and job error summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Retried with backoff where it occurs.
    Transient,
    /// Retried once after a credential refresh.
    Auth,
    /// Absorbed: the offending entity is skipped.
    Entity,
    /// Absorbed: the offending lineage is dropped from the commit batch.
    Lineage,
    /// Fails the job; no automatic retry.
    Fatal,
    Cancelled,
}

impl Error {
    #[tracing::instrument(level = "debug", name = "tributary.error.backend", skip(source))]
    pub fn backend(
        context: impl Into<String> + std::fmt::Debug,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::Backend {
            context: context.into(),
            source: Box::new(source),
        }
    }

    pub fn schema(entity_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SchemaViolation {
            entity_type: entity_type.into(),
            message: message.into(),
        }
    }

    pub fn stage(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StageFailure {
            stage: stage.into(),
            message: message.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::RateLimited { .. } | Self::TransientNetwork(_) => ErrorClass::Transient,
            Self::AuthExpired(_) => ErrorClass::Auth,
            Self::SchemaViolation { .. } => ErrorClass::Entity,
            Self::StageFailure { .. } => ErrorClass::Lineage,
            Self::Cancelled(_) => ErrorClass::Cancelled,
            _ => ErrorClass::Fatal,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Whether this error ends the job once it escapes the point where it occurred.
    pub fn is_job_fatal(&self) -> bool {
        !matches!(self.class(), ErrorClass::Entity | ErrorClass::Lineage)
    }

    /// Server-provided wait hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Stable short name recorded in job error summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Unauthorized(_) => "unauthorized",
            Self::AuthExpired(_) => "auth_expired",
            Self::RateLimited { .. } => "rate_limited",
            Self::TransientNetwork(_) => "transient_network",
            Self::SchemaViolation { .. } => "schema_violation",
            Self::StageFailure { .. } => "stage_failure",
            Self::PermanentSource(_) => "permanent_source",
            Self::FatalDestination(_) => "fatal_destination",
            Self::ConcurrencyLimitExceeded(_) => "concurrency_limit_exceeded",
            Self::Cancelled(_) => "cancelled",
            Self::Backend { .. } | Self::BackendMessage(_) => "backend",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_taxonomy() {
        assert!(Error::TransientNetwork("reset".into()).is_transient());
        assert!(
            Error::RateLimited {
                message: "slow down".into(),
                retry_after: Some(Duration::from_secs(2)),
            }
            .is_transient()
        );
        assert_eq!(Error::schema("ticket", "x").class(), ErrorClass::Entity);
        assert_eq!(Error::stage("chunk", "x").class(), ErrorClass::Lineage);
        assert_eq!(
            Error::PermanentSource("gone".into()).class(),
            ErrorClass::Fatal
        );
        assert_eq!(
            Error::FatalDestination("bad dim".into()).class(),
            ErrorClass::Fatal
        );
        assert_eq!(Error::AuthExpired("token".into()).class(), ErrorClass::Auth);
    }

    #[test]
    fn retry_after_only_for_rate_limits() {
        let e = Error::RateLimited {
            message: "429".into(),
            retry_after: Some(Duration::from_millis(1500)),
        };
        assert_eq!(e.retry_after(), Some(Duration::from_millis(1500)));
        assert_eq!(Error::TransientNetwork("x".into()).retry_after(), None);
        assert_eq!(e.kind(), "rate_limited");
    }
}
