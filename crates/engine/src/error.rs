//! Engine-level error types.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::step_instance::StepInstanceMeta;

/// Error type returned by user step functions.
pub type StepError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors produced by the job engine (builder + execution).
///
/// `Clone` is required because a failed step's result fans out through its
/// shared task to every consumer.
#[derive(Debug, Clone, Error)]
pub enum JobError {
    // ------ Builder errors (non-fatal; the definition stays usable) ------

    /// DAG primitive failure (duplicate node / dangling edge endpoint).
    #[error(transparent)]
    Graph(#[from] dag::GraphError),

    /// A dependency references a step that is not registered in the job.
    #[error("trying to reference step '{0}', but it is not registered in job")]
    RefStepNotInJob(String),

    /// Builder called after the definition was sealed.
    #[error("trying to add step '{0}' to a sealed job definition")]
    AddStepInSealedJob(String),

    /// A step with the same name is already registered.
    #[error("trying to add step '{0}' to job definition, but it already exists")]
    AddExistingStep(String),

    /// `step_after_both` was given the same parent twice.
    #[error("at least two input parent steps are the same")]
    DuplicateInputParentStep,

    // ------ Execution errors ------

    /// Instance bookkeeping miss; indicates a bug in the engine, not a
    /// user error.
    #[error("runtime step '{0}' not found, must be a bug in the engine")]
    RuntimeStepNotFound(String),

    /// The step's own function (or its retries) failed.
    #[error("step '{name}' failed: {cause}", name = .step.name())]
    StepFailed {
        step: Arc<dyn StepInstanceMeta>,
        #[source]
        cause: Arc<dyn std::error::Error + Send + Sync>,
    },

    /// The step could not start because one of its precedents failed.
    #[error("step '{name}' not started, precedent step failed: {cause}", name = .step.name())]
    PrecedentStepFailed {
        step: Arc<dyn StepInstanceMeta>,
        #[source]
        cause: Arc<JobError>,
    },

    /// The wait was cancelled through its context before the job reached a
    /// terminal state.
    #[error("wait cancelled before the job reached a terminal state")]
    Canceled,
}

impl JobError {
    pub(crate) fn step_failed(step: Arc<dyn StepInstanceMeta>, cause: StepError) -> Self {
        JobError::StepFailed {
            step,
            cause: Arc::from(cause),
        }
    }

    pub(crate) fn precedent_failed(step: Arc<dyn StepInstanceMeta>, cause: JobError) -> Self {
        JobError::PrecedentStepFailed {
            step,
            cause: Arc::new(cause),
        }
    }

    /// Walk `PrecedentStepFailed` chains back to the step that actually
    /// raised the failure.
    pub fn root_cause(&self) -> &JobError {
        match self {
            JobError::PrecedentStepFailed { cause, .. } => cause.root_cause(),
            _ => self,
        }
    }

    /// Name of the step instance carried by the execution variants.
    pub fn step_name(&self) -> Option<&str> {
        match self {
            JobError::StepFailed { step, .. } | JobError::PrecedentStepFailed { step, .. } => {
                Some(step.name())
            }
            _ => None,
        }
    }
}

/// Diagnostic error produced when a step function panics.
///
/// The backtrace is captured at the catch site, after the stack has
/// unwound into the engine's guard.
#[derive(Debug, Error)]
#[error("step panicked: {message}")]
pub struct PanicError {
    pub message: String,
    pub backtrace: String,
}

impl PanicError {
    pub(crate) fn from_payload(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&str>() {
            (*message).to_string()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "non-string panic payload".to_string()
        };

        Self {
            message,
            backtrace: std::backtrace::Backtrace::force_capture().to_string(),
        }
    }
}

/// Diagnostic error produced when a step invocation exceeds the timeout
/// attached via [`with_timeout`](crate::options::with_timeout).
#[derive(Debug, Clone, Error)]
#[error("step timed out after {0:?}")]
pub struct TimeoutError(pub Duration);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payload_str_is_extracted() {
        let err = PanicError::from_payload(Box::new("boom"));
        assert_eq!(err.message, "boom");
        assert!(!err.backtrace.is_empty());
    }

    #[test]
    fn panic_payload_string_is_extracted() {
        let err = PanicError::from_payload(Box::new("boom".to_string()));
        assert_eq!(err.message, "boom");
    }

    #[test]
    fn panic_payload_other_types_fall_back() {
        let err = PanicError::from_payload(Box::new(42u8));
        assert_eq!(err.message, "non-string panic payload");
    }

    #[test]
    fn graph_errors_convert() {
        let err = JobError::from(dag::GraphError::DuplicateNode("a".to_string()));
        assert!(matches!(err, JobError::Graph(_)));
        assert!(err.step_name().is_none());
    }
}
