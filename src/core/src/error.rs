use thiserror::Error;

/// Refit error types
#[derive(Error, Debug)]
pub enum RefitError {
    /// Registry answered the base endpoint without a `WWW-Authenticate` header
    #[error("Registry {registry} returned {status} without an authentication challenge")]
    ChallengeNotFound { registry: String, status: u16 },

    /// Registry advertised an authentication scheme we cannot speak
    #[error("Registry {registry} requires unsupported authentication scheme '{scheme}'")]
    UnsupportedChallenge { registry: String, scheme: String },

    /// Token endpoint rejected the exchange
    #[error("Authentication failed: {realm} -> {status} - {message}")]
    AuthenticationFailed {
        realm: String,
        status: u16,
        message: String,
    },

    /// Manifest endpoint returned a non-200 status
    #[error("Manifest fetch failed: {reference} -> {status}{}", challenge_suffix(.www_authenticate))]
    ManifestFetchFailed {
        reference: String,
        status: u16,
        www_authenticate: Option<String>,
    },

    /// Transport-level failure talking to a registry
    #[error("Registry unreachable: {registry} - {message}")]
    RegistryUnreachable { registry: String, message: String },

    /// Manifest body could not be decoded
    #[error("Manifest decode error: {reference} - {message}")]
    ManifestDecode { reference: String, message: String },

    /// Image reference could not be parsed
    #[error("Invalid image reference: {0}")]
    InvalidReference(String),

    /// Container does not exist
    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    /// Container engine call failed
    #[error("Engine error: {operation} {target} - {message}")]
    Engine {
        operation: String,
        target: String,
        message: String,
    },

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Recreate failed and the host was returned to its original state
    #[error("{0}")]
    RecreateFailed(Box<RecreateFailure>),

    /// Recreate failed and the rollback failed too; operator attention required
    #[error("IRRECOVERABLE: {0}")]
    Irrecoverable(Box<RecreateFailure>),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl RefitError {
    /// Registry protocol errors: surfaced, never retried.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            RefitError::ChallengeNotFound { .. }
                | RefitError::UnsupportedChallenge { .. }
                | RefitError::AuthenticationFailed { .. }
                | RefitError::ManifestFetchFailed { .. }
                | RefitError::RegistryUnreachable { .. }
                | RefitError::ManifestDecode { .. }
        )
    }

    /// True when the host may be left without a working container.
    pub fn is_irrecoverable(&self) -> bool {
        matches!(self, RefitError::Irrecoverable(_))
    }

    /// Detailed report for a failed recreate, if this is one.
    pub fn recreate_failure(&self) -> Option<&RecreateFailure> {
        match self {
            RefitError::RecreateFailed(f) | RefitError::Irrecoverable(f) => Some(f),
            _ => None,
        }
    }
}

fn challenge_suffix(www_authenticate: &Option<String>) -> String {
    match www_authenticate {
        Some(value) => format!(" (WWW-Authenticate: {value})"),
        None => String::new(),
    }
}

impl From<serde_json::Error> for RefitError {
    fn from(err: serde_json::Error) -> Self {
        RefitError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for RefitError {
    fn from(err: serde_yaml::Error) -> Self {
        RefitError::Serialization(err.to_string())
    }
}

/// A compensating action attempted while unwinding a failed recreate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compensation {
    /// What was attempted, e.g. "remove clone" or "restart original"
    pub action: String,
    /// Container the action targeted
    pub container_id: String,
    /// `None` when the action succeeded
    pub error: Option<String>,
}

impl Compensation {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

impl std::fmt::Display for Compensation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.error {
            None => write!(f, "{} {}: ok", self.action, self.container_id),
            Some(e) => write!(f, "{} {}: failed: {}", self.action, self.container_id, e),
        }
    }
}

/// Report of a recreate that did not reach its target state.
#[derive(Debug)]
pub struct RecreateFailure {
    /// Container the recreate was started for
    pub container_id: String,
    /// Phase that failed (e.g. "start")
    pub phase: String,
    /// The error that aborted the forward sequence
    pub cause: Box<RefitError>,
    /// Compensating actions in the order they ran
    pub compensations: Vec<Compensation>,
}

impl RecreateFailure {
    /// Compensating actions that failed themselves.
    pub fn failed_compensations(&self) -> impl Iterator<Item = &Compensation> {
        self.compensations.iter().filter(|c| !c.succeeded())
    }
}

impl std::fmt::Display for RecreateFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Recreate of {} failed during {}: {}",
            self.container_id, self.phase, self.cause
        )?;
        if !self.compensations.is_empty() {
            let steps: Vec<String> = self.compensations.iter().map(|c| c.to_string()).collect();
            write!(f, " [compensations: {}]", steps.join("; "))?;
        }
        Ok(())
    }
}

/// Result type alias for refit operations
pub type Result<T> = std::result::Result<T, RefitError>;
