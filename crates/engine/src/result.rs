//! Result projection: pair a job definition with a designated result step
//! so callers can await one typed output instead of the whole job.

use std::fmt;
use std::sync::Arc;

use crate::builder::typed_instance;
use crate::context::RunContext;
use crate::definition::{JobDefinition, JobDefinitionMeta};
use crate::error::JobError;
use crate::instance::JobInstance;
use crate::options::JobOption;
use crate::step::{StepDefinition, StepDefinitionMeta};
use crate::step_instance::SharedStepTask;

/// A job definition plus the step whose output is the job's result.
pub struct JobDefinitionWithResult<I, O> {
    definition: Arc<JobDefinition<I>>,
    result_step: Arc<StepDefinition<O>>,
}

impl<I, O> fmt::Debug for JobDefinitionWithResult<I, O>
where
    I: Send + Sync + 'static,
    O: Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobDefinitionWithResult")
            .field("definition", &self.definition.name())
            .field("result_step", &self.result_step.name())
            .finish()
    }
}

/// Pair `definition` with `result_step`.
///
/// # Errors
/// [`JobError::RefStepNotInJob`] if the step is not one of the
/// definition's own registered steps.
pub fn with_result<I, O>(
    definition: Arc<JobDefinition<I>>,
    result_step: &Arc<StepDefinition<O>>,
) -> Result<JobDefinitionWithResult<I, O>, JobError>
where
    I: Send + Sync + 'static,
    O: Send + Sync + 'static,
{
    definition.check_parent(result_step)?;
    Ok(JobDefinitionWithResult {
        definition,
        result_step: Arc::clone(result_step),
    })
}

impl<I, O> JobDefinitionWithResult<I, O>
where
    I: Send + Sync + 'static,
    O: Send + Sync + 'static,
{
    pub fn definition(&self) -> &Arc<JobDefinition<I>> {
        &self.definition
    }

    /// Seal the underlying definition.
    pub fn seal(&self) {
        self.definition.seal();
    }

    pub fn visualize(&self) -> String {
        self.definition.visualize()
    }

    /// Start a new instance; see [`JobDefinition::start`].
    pub async fn start(
        &self,
        ctx: &RunContext,
        input: I,
        options: Vec<JobOption>,
    ) -> Result<JobInstanceWithResult<I, O>, JobError> {
        let instance = Arc::clone(&self.definition).start(ctx, input, options).await?;
        let result_task = typed_instance::<O>(self.result_step.name(), &instance)?.task();
        Ok(JobInstanceWithResult {
            instance,
            result_task,
        })
    }
}

/// A running instance with direct access to the result step's output.
pub struct JobInstanceWithResult<I, O> {
    instance: JobInstance<I>,
    result_task: SharedStepTask<O>,
}

impl<I, O> JobInstanceWithResult<I, O>
where
    I: Send + Sync + 'static,
    O: Send + Sync + 'static,
{
    pub fn instance(&self) -> &JobInstance<I> {
        &self.instance
    }

    /// Await the result step's typed output.
    ///
    /// Does not wait for the rest of the job; combine with
    /// [`wait`](JobInstanceWithResult::wait) when full completion matters.
    pub async fn result(&self, ctx: &RunContext) -> Result<Arc<O>, JobError> {
        tokio::select! {
            _ = ctx.cancellation().cancelled() => Err(JobError::Canceled),
            outcome = self.result_task.clone() => outcome,
        }
    }

    /// Passthrough to [`JobInstance::wait`].
    pub async fn wait(&self, ctx: &RunContext) -> Result<(), JobError> {
        self.instance.wait(ctx).await
    }
}
