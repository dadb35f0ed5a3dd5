//! Errors surfaced through a [`ResultChannel`](crate::ResultChannel)

/// Error reported into a result channel.
///
/// Cloneable so a resolved outcome can be handed to any number of waiters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    /// The requested name did not resolve to a callable script function
    #[error("'{name}' is not callable")]
    NotCallable {
        /// The name that failed to resolve
        name: String,
    },

    /// The host never became ready within the configured retry budget
    #[error("script host not ready after {attempts} attempts")]
    NotReady {
        /// Number of call attempts made
        attempts: u32,
    },

    /// The script raised or reported an error
    #[error("{message}")]
    Script {
        /// Error message
        message: String,
        /// Diagnostic trace lines, innermost last
        trace: Vec<String>,
    },
}

impl CallError {
    /// Create a not-callable error
    pub fn not_callable(name: impl Into<String>) -> Self {
        Self::NotCallable { name: name.into() }
    }

    /// Create a not-ready error
    pub fn not_ready(attempts: u32) -> Self {
        Self::NotReady { attempts }
    }

    /// Create a script error without a trace
    pub fn script(message: impl Into<String>) -> Self {
        Self::Script {
            message: message.into(),
            trace: Vec::new(),
        }
    }

    /// Create a script error with a diagnostic trace
    pub fn script_with_trace(message: impl Into<String>, trace: Vec<String>) -> Self {
        Self::Script {
            message: message.into(),
            trace,
        }
    }

    /// Diagnostic trace lines, if any
    pub fn trace(&self) -> &[String] {
        match self {
            Self::Script { trace, .. } => trace,
            _ => &[],
        }
    }
}
