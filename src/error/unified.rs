//! Error classification used to route recovery decisions.

/// Broad error category for routing recovery logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Authentication,
    Authorization,
    Network,
    Server,
    Api,
    Configuration,
    Serialization,
    Transport,
    Unknown,
}

/// Suggested recovery action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverySuggestion {
    /// Try again later; the failure is transient.
    RetryWithBackoff,
    /// Start an interactive login.
    SignInAgain,
    /// Fix the startup configuration and restart.
    CheckConfiguration,
    /// Report upstream; nothing the client can do.
    ContactSupport,
}
