use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use super::context::MessagingContext;
use super::errors::StepError;

/// Whether downstream steps should still run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    Continue,
    /// Legitimate early end of the pipeline, not a failure
    Stop,
}

impl StepResult {
    pub fn should_continue(&self) -> bool {
        matches!(self, Self::Continue)
    }
}

/// One unit of pipeline work
///
/// Steps that perform I/O must check `cancel` before starting it. Failures
/// propagate as typed [`StepError`]s; catching them is the exception
/// decorator's job.
#[async_trait]
pub trait Step: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(
        &self,
        context: &mut MessagingContext,
        cancel: &CancellationToken,
    ) -> Result<StepResult, StepError>;
}

/// Ordered chain of steps run strictly in sequence
#[derive(Clone)]
pub struct CompositeStep {
    name: &'static str,
    steps: Vec<Arc<dyn Step>>,
}

impl CompositeStep {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            steps: Vec::new(),
        }
    }

    pub fn then<S: Step + 'static>(mut self, step: S) -> Self {
        self.steps.push(Arc::new(step));
        self
    }

    pub fn then_shared(mut self, step: Arc<dyn Step>) -> Self {
        self.steps.push(step);
        self
    }

    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl std::fmt::Debug for CompositeStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeStep")
            .field("name", &self.name)
            .field("steps", &self.step_names())
            .finish()
    }
}

#[async_trait]
impl Step for CompositeStep {
    fn name(&self) -> &'static str {
        self.name
    }

    #[instrument(skip_all, fields(pipeline = self.name))]
    async fn execute(
        &self,
        context: &mut MessagingContext,
        cancel: &CancellationToken,
    ) -> Result<StepResult, StepError> {
        for step in &self.steps {
            if cancel.is_cancelled() {
                return Err(StepError::Cancelled);
            }
            let result = step.execute(context, cancel).await?;
            if !result.should_continue() {
                debug!(step = step.name(), "Step ended the pipeline early");
                return Ok(StepResult::Stop);
            }
        }
        Ok(StepResult::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Recording {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        result: Result<StepResult, StepError>,
    }

    #[async_trait]
    impl Step for Recording {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn execute(
            &self,
            _context: &mut MessagingContext,
            _cancel: &CancellationToken,
        ) -> Result<StepResult, StepError> {
            self.log.lock().push(self.name);
            self.result.clone()
        }
    }

    fn step(
        name: &'static str,
        log: &Arc<Mutex<Vec<&'static str>>>,
        result: Result<StepResult, StepError>,
    ) -> Recording {
        Recording {
            name,
            log: log.clone(),
            result,
        }
    }

    #[tokio::test]
    async fn test_runs_steps_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = CompositeStep::new("test")
            .then(step("a", &log, Ok(StepResult::Continue)))
            .then(step("b", &log, Ok(StepResult::Continue)));

        let result = pipeline
            .execute(&mut MessagingContext::default(), &CancellationToken::new())
            .await;
        assert_eq!(result, Ok(StepResult::Continue));
        assert_eq!(*log.lock(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_stop_is_not_a_failure() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = CompositeStep::new("test")
            .then(step("a", &log, Ok(StepResult::Stop)))
            .then(step("b", &log, Ok(StepResult::Continue)));

        let result = pipeline
            .execute(&mut MessagingContext::default(), &CancellationToken::new())
            .await;
        assert_eq!(result, Ok(StepResult::Stop));
        assert_eq!(*log.lock(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_failure_propagates_unchanged() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = CompositeStep::new("test")
            .then(step("a", &log, Err(StepError::validation("bad"))))
            .then(step("b", &log, Ok(StepResult::Continue)));

        let result = pipeline
            .execute(&mut MessagingContext::default(), &CancellationToken::new())
            .await;
        assert_eq!(result, Err(StepError::Validation("bad".into())));
        assert_eq!(*log.lock(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_cancellation_stops_before_next_step() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = CompositeStep::new("test").then(step("a", &log, Ok(StepResult::Continue)));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = pipeline
            .execute(&mut MessagingContext::default(), &cancel)
            .await;
        assert_eq!(result, Err(StepError::Cancelled));
        assert!(log.lock().is_empty());
    }
}
