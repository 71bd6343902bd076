//! External process engine contract.
//!
//! The engine is opaque: start, find, complete and signal. Every call made by
//! the lifecycle manager goes through [`with_timeout`], so a slow engine
//! surfaces as an ambiguous [`EngineError::Timeout`] rather than a hang.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use super::types::Variables;
use crate::error::EngineError;

/// Workflow-execution service exposing start/complete/signal.
#[async_trait]
pub trait ProcessEngine: Send + Sync {
    /// Start an instance of `process_key` and return its instance id.
    async fn start_instance(
        &self,
        process_key: &str,
        business_key: &str,
        variables: &Variables,
    ) -> Result<String, EngineError>;

    /// Active (not ended) instance for `business_key`, if any.
    async fn find_instance(&self, business_key: &str) -> Result<Option<String>, EngineError>;

    /// Open user task `task_key` for `business_key`, if any.
    async fn find_pending_task(
        &self,
        business_key: &str,
        task_key: &str,
    ) -> Result<Option<String>, EngineError>;

    async fn complete_task(&self, task_id: &str, variables: &Variables) -> Result<(), EngineError>;

    /// Variables of the most recently finished `task_key` task for
    /// `business_key`, if one has finished.
    async fn find_completed_task(
        &self,
        business_key: &str,
        task_key: &str,
    ) -> Result<Option<Variables>, EngineError>;

    async fn signal_instance(
        &self,
        instance_id: &str,
        signal_name: &str,
        variables: &Variables,
    ) -> Result<(), EngineError>;
}

/// Run an engine call under a deadline.
pub async fn with_timeout<T, F>(operation: &str, timeout: Duration, call: F) -> Result<T, EngineError>
where
    F: Future<Output = Result<T, EngineError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(EngineError::Timeout {
            operation: operation.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_elapses() {
        let result: Result<(), EngineError> = with_timeout("start", Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        let err = result.unwrap_err();
        assert!(err.is_ambiguous());
        assert!(matches!(err, EngineError::Timeout { timeout_ms: 50, .. }));
    }

    #[tokio::test]
    async fn test_with_timeout_passes_through() {
        let result = with_timeout("find", Duration::from_secs(1), async {
            Ok::<_, EngineError>(Some("pi-1".to_string()))
        })
        .await;
        assert_eq!(result.unwrap().as_deref(), Some("pi-1"));
    }
}
