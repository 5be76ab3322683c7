use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nbc_api::error::{CancellationError, ErrorKind, NbcError};

/// Shared flag set by a `SIGINT`/`SIGTERM` handler, polled at the suspension points named in
/// spec.md: before every major pipeline step, between extraction layers, and every 1,000 tar
/// entries within a layer.
#[derive(Clone)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    /// Installs a process-wide `ctrlc` handler that flips this token. Must be called at most
    /// once per process; a second call would replace the first handler, which `ctrlc` itself
    /// rejects with an error.
    pub fn install_signal_handler(&self) -> Result<(), anyhow::Error> {
        let flag = Arc::clone(&self.0);
        ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
            .map_err(anyhow::Error::from)
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Returns a `Cancellation` error naming `step` if the token has been tripped.
    pub fn check_before_step(&self, step: &'static str) -> Result<(), NbcError> {
        if self.is_cancelled() {
            return Err(NbcError::new(ErrorKind::Cancellation(
                CancellationError::CancelledBeforeStep { step },
            )));
        }
        Ok(())
    }

    /// Returns a `Cancellation` error naming the in-progress layer `index` if the token has been
    /// tripped.
    pub fn check_during_extraction(&self, index: usize) -> Result<(), NbcError> {
        if self.is_cancelled() {
            return Err(NbcError::new(ErrorKind::Cancellation(
                CancellationError::CancelledDuringExtraction { index },
            )));
        }
        Ok(())
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_before_step_passes_when_not_cancelled() {
        let token = CancellationToken::new();
        assert!(token.check_before_step("Partition").is_ok());
    }

    #[test]
    fn test_check_before_step_fails_once_cancelled() {
        let token = CancellationToken::new();
        token.0.store(true, Ordering::SeqCst);
        assert!(token.check_before_step("Partition").is_err());
    }

    #[test]
    fn test_check_during_extraction_fails_once_cancelled() {
        let token = CancellationToken::new();
        token.0.store(true, Ordering::SeqCst);
        let err = token.check_during_extraction(3).unwrap_err();
        assert!(err.to_string().contains('3'));
    }
}
