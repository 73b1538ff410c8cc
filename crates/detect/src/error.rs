//! Error types for audio session detection.

use thiserror::Error;

/// Result type for detection operations.
pub type Result<T> = std::result::Result<T, DetectError>;

/// Errors that can occur while inspecting the audio subsystem.
///
/// Only the first two variants ever reach a caller of the query facade.
/// The rest are absorbed where they happen and degrade the result instead.
#[derive(Debug, Clone, Error)]
pub enum DetectError {
    /// The audio subsystem could not be initialized or reached.
    #[error("audio subsystem unavailable: {message}")]
    SubsystemUnavailable { code: Option<i32>, message: String },

    /// Active endpoints could not be enumerated.
    #[error("failed to enumerate audio endpoints: {message}")]
    EndpointEnumerationFailed { code: Option<i32>, message: String },

    /// A single session could not be inspected (it may have vanished).
    #[error("failed to inspect session on '{endpoint}': {message}")]
    PerSessionInspectionFailed { endpoint: String, message: String },

    /// A process id could not be mapped to an executable path.
    #[error("failed to resolve process {pid}")]
    ProcessResolutionFailed { pid: u32 },

    /// Session notifications could not be registered for an endpoint.
    #[error("failed to register session notifications on '{endpoint}': {message}")]
    RegistrationFailed { endpoint: String, message: String },

    /// Configuration file could not be read or parsed.
    #[error("configuration error: {0}")]
    Config(String),
}

impl DetectError {
    pub fn subsystem(message: impl Into<String>) -> Self {
        Self::SubsystemUnavailable {
            code: None,
            message: message.into(),
        }
    }

    pub fn enumeration(message: impl Into<String>) -> Self {
        Self::EndpointEnumerationFailed {
            code: None,
            message: message.into(),
        }
    }

    /// Stable numeric code for structured results.
    ///
    /// A native status code (HRESULT on Windows) is passed through when the
    /// backend supplied one.
    pub fn code(&self) -> i32 {
        match self {
            Self::SubsystemUnavailable { code, .. } => code.unwrap_or(1),
            Self::EndpointEnumerationFailed { code, .. } => code.unwrap_or(2),
            Self::PerSessionInspectionFailed { .. } => 3,
            Self::ProcessResolutionFailed { .. } => 4,
            Self::RegistrationFailed { .. } => 5,
            Self::Config(_) => 6,
        }
    }

    /// Whether the failure aborts a whole query rather than a single entry.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::SubsystemUnavailable { .. } | Self::EndpointEnumerationFailed { .. }
        )
    }
}
