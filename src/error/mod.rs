//! Error taxonomy for the execution core.
//!
//! Every failure carries a stable [`ErrorCode`] so that retries, metrics
//! clustering, and the HTTP/CLI surfaces can reason about failures without
//! parsing messages.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dsl::validation::ValidationReport;

/// Stable error codes. The code string is part of the external contract:
/// it is persisted in run records and used for failure clustering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationFailed,
    SignatureInvalid,
    SignatureExpired,
    KeyUnknown,
    KeyRevoked,
    TrustTooLow,
    PolicyBlocked,
    ApprovalDenied,
    ApprovalTimeout,
    OsCapabilityMiss,
    WebElementNotFound,
    WebUploadFailed,
    DownloadTimeout,
    DownloadIncomplete,
    PdfParseError,
    FileNotFound,
    VerifierTimeout,
    VerifierFail,
    Timeout,
    QueueFull,
    Cancelled,
    Unsupported,
    Internal,
}

impl ErrorCode {
    /// Whether the retry policy may re-attempt a step that failed with
    /// this code. Recovery-once codes (element/file misses) are also
    /// retryable; the executor bounds them separately.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::WebElementNotFound
                | ErrorCode::WebUploadFailed
                | ErrorCode::DownloadTimeout
                | ErrorCode::DownloadIncomplete
                | ErrorCode::FileNotFound
                | ErrorCode::VerifierTimeout
                | ErrorCode::VerifierFail
                | ErrorCode::Timeout
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::ValidationFailed => "VALIDATION_FAILED",
            ErrorCode::SignatureInvalid => "SIGNATURE_INVALID",
            ErrorCode::SignatureExpired => "SIGNATURE_EXPIRED",
            ErrorCode::KeyUnknown => "KEY_UNKNOWN",
            ErrorCode::KeyRevoked => "KEY_REVOKED",
            ErrorCode::TrustTooLow => "TRUST_TOO_LOW",
            ErrorCode::PolicyBlocked => "POLICY_BLOCKED",
            ErrorCode::ApprovalDenied => "APPROVAL_DENIED",
            ErrorCode::ApprovalTimeout => "APPROVAL_TIMEOUT",
            ErrorCode::OsCapabilityMiss => "OS_CAPABILITY_MISS",
            ErrorCode::WebElementNotFound => "WEB_ELEMENT_NOT_FOUND",
            ErrorCode::WebUploadFailed => "WEB_UPLOAD_FAILED",
            ErrorCode::DownloadTimeout => "DOWNLOAD_TIMEOUT",
            ErrorCode::DownloadIncomplete => "DOWNLOAD_INCOMPLETE",
            ErrorCode::PdfParseError => "PDF_PARSE_ERROR",
            ErrorCode::FileNotFound => "FILE_NOT_FOUND",
            ErrorCode::VerifierTimeout => "VERIFIER_TIMEOUT",
            ErrorCode::VerifierFail => "VERIFIER_FAIL",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::QueueFull => "QUEUE_FULL",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::Unsupported => "UNSUPPORTED",
            ErrorCode::Internal => "INTERNAL",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The structured error object persisted with a failed step and shown as
/// the first-error card in user-facing output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorCard {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default)]
    pub hints: Vec<String>,
    #[serde(default)]
    pub step_index: Option<usize>,
}

impl ErrorCard {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        ErrorCard {
            code,
            message: message.into(),
            hints: Vec::new(),
            step_index: None,
        }
    }

    pub fn at_step(mut self, index: usize) -> Self {
        self.step_index = Some(index);
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hints.push(hint.into());
        self
    }
}

impl std::fmt::Display for ErrorCard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.step_index {
            Some(i) => write!(f, "{} at step {}: {}", self.code, i, self.message),
            None => write!(f, "{}: {}", self.code, self.message),
        }
    }
}

/// Failure of a single step. The card holds the taxonomy code; the
/// executor consults [`ErrorCode::is_retryable`] before re-attempting.
#[derive(Debug, Clone, Error)]
#[error("{card}")]
pub struct StepError {
    pub card: ErrorCard,
}

impl StepError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        StepError {
            card: ErrorCard::new(code, message),
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.card = self.card.with_hint(hint);
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.card.code
    }
}

/// Core-level errors covering everything outside one step's execution.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("plan parse error: {0}")]
    PlanParse(String),
    #[error("unsupported DSL version: {found}, supported: {supported}")]
    UnsupportedVersion { found: String, supported: String },
    #[error("validation failed")]
    ValidationFailed(Box<ValidationReport>),
    #[error("policy blocked: {reasons:?}")]
    PolicyBlocked { reasons: Vec<String> },
    #[error("signature check failed: {0}")]
    Signature(ErrorCode),
    #[error("queue '{queue}' is full")]
    QueueFull { queue: String },
    #[error("run not found: {0}")]
    RunNotFound(u64),
    #[error("approval denied")]
    ApprovalDenied,
    #[error("approval timed out")]
    ApprovalTimeout,
    #[error("step failed: {0}")]
    Step(#[from] StepError),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Map to the stable taxonomy code for persistence and clustering.
    pub fn code(&self) -> ErrorCode {
        match self {
            CoreError::PlanParse(_)
            | CoreError::UnsupportedVersion { .. }
            | CoreError::ValidationFailed(_) => ErrorCode::ValidationFailed,
            CoreError::PolicyBlocked { .. } => ErrorCode::PolicyBlocked,
            CoreError::Signature(code) => *code,
            CoreError::QueueFull { .. } => ErrorCode::QueueFull,
            CoreError::ApprovalDenied => ErrorCode::ApprovalDenied,
            CoreError::ApprovalTimeout => ErrorCode::ApprovalTimeout,
            CoreError::Step(e) => e.code(),
            CoreError::RunNotFound(_) | CoreError::Internal(_) => ErrorCode::Internal,
            CoreError::Storage(_) | CoreError::Io(_) => ErrorCode::Internal,
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
