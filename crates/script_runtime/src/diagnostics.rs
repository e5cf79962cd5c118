//! Error reporting
//!
//! Compile errors are handed to an [`ErrorSink`] as they are found. Hosts plug
//! in their own sink to show errors to users; the default logs them.

use parking_lot::Mutex;
use tracing::{error, warn};

use script_graph::ScriptError;

/// Receives script errors for display
pub trait ErrorSink: Send + Sync {
    fn report(&self, error: &ScriptError);
}

/// Logs every error as a warning
#[derive(Debug, Default)]
pub struct TracingSink;

impl ErrorSink for TracingSink {
    fn report(&self, error: &ScriptError) {
        warn!(
            kind = %error.kind,
            location = %error.location,
            "Script error: {}",
            error.message
        );
    }
}

/// Keeps every reported error
#[derive(Debug, Default)]
pub struct CollectingSink {
    errors: Mutex<Vec<ScriptError>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn errors(&self) -> Vec<ScriptError> {
        self.errors.lock().clone()
    }

    pub fn take(&self) -> Vec<ScriptError> {
        std::mem::take(&mut *self.errors.lock())
    }
}

impl ErrorSink for CollectingSink {
    fn report(&self, error: &ScriptError) {
        self.errors.lock().push(error.clone());
    }
}

/// Log and abort. Reserved for states the runtime cannot continue from.
pub fn fatal(message: &str) -> ! {
    error!("Fatal: {}", message);
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;
    use script_graph::ErrorKind;

    #[test]
    fn test_collecting_sink() {
        let sink = CollectingSink::new();
        sink.report(&ScriptError::new(ErrorKind::CompilerBug, "first"));
        sink.report(&ScriptError::new(ErrorKind::ValueWasNull, "second"));
        assert_eq!(sink.errors().len(), 2);
        assert_eq!(sink.take()[1].message, "second");
        assert!(sink.errors().is_empty());
    }
}
