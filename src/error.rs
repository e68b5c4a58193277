//! Error types for feeding cycles.

use thiserror::Error;

/// Why a feeding cycle failed.
///
/// A fault fails the current cycle only; the task keeps running and the
/// orchestrator decides when to try again.
#[derive(Error, Debug)]
pub enum CycleFault {
    /// Entities could not be read from the broker.
    #[error("entity fetch failed: {0:#}")]
    Fetch(anyhow::Error),

    /// The task's subscription could not be (re)issued.
    #[error("subscription failed: {0:#}")]
    Subscribe(anyhow::Error),
}

pub type CycleResult<T> = std::result::Result<T, CycleFault>;

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_fault_messages_keep_cause_chain() {
        let fault = CycleFault::Fetch(anyhow!("connection refused").context("GET /v2/entities"));
        let msg = fault.to_string();
        assert!(msg.starts_with("entity fetch failed"));
        assert!(msg.contains("GET /v2/entities"));
        assert!(msg.contains("connection refused"));
    }
}
