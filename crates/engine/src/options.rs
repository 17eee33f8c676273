//! Execution options for steps and job instances.
//!
//! Options are additive preparers applied in order, so call sites read as
//! a list of decorations:
//!
//! ```ignore
//! job.step_after("Query", &client, query_step, vec![
//!     execute_after(check_auth.as_ref()),
//!     with_retry(LinearRetryPolicy::new(Duration::from_millis(10), 3)),
//!     with_context_enrichment(enrich_job_context),
//! ])?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::context::RunContext;
use crate::retry::RetryPolicy;
use crate::step::StepDefinitionMeta;
use crate::step_instance::StepInstanceMeta;

/// Context enrichment hook, called once per step invocation right before
/// the user function runs.
pub type StepContextPolicy =
    Arc<dyn Fn(RunContext, &dyn StepInstanceMeta) -> RunContext + Send + Sync>;

/// Per-step execution options collected by the builder.
#[derive(Clone, Default)]
pub struct StepExecutionOptions {
    /// Dependencies by step name; input parents are recorded here too.
    pub(crate) depend_on: Vec<String>,
    pub(crate) retry_policy: Option<Arc<dyn RetryPolicy>>,
    pub(crate) context_policy: Option<StepContextPolicy>,
    pub(crate) timeout: Option<Duration>,
}

impl StepExecutionOptions {
    /// Names of the steps this step is gated on (input parents included).
    pub fn depend_on(&self) -> &[String] {
        &self.depend_on
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

/// A single step option; build them with [`execute_after`], [`with_retry`],
/// [`with_context_enrichment`] or [`with_timeout`].
pub type StepOption = Box<dyn FnOnce(StepExecutionOptions) -> StepExecutionOptions + Send>;

pub(crate) fn apply_step_options(options: Vec<StepOption>) -> StepExecutionOptions {
    options
        .into_iter()
        .fold(StepExecutionOptions::default(), |acc, prepare| prepare(acc))
}

/// Gate the step on `step` without consuming its output. Use `step_after`
/// or `step_after_both` to consume the value as well.
pub fn execute_after(step: &dyn StepDefinitionMeta) -> StepOption {
    let name = step.name().to_string();
    Box::new(move |mut options| {
        options.depend_on.push(name);
        options
    })
}

/// Re-invoke the step function on failure according to `policy`.
pub fn with_retry(policy: impl RetryPolicy + 'static) -> StepOption {
    let policy: Arc<dyn RetryPolicy> = Arc::new(policy);
    Box::new(move |mut options| {
        options.retry_policy = Some(policy);
        options
    })
}

/// Run `hook` over the ambient context right before each invocation.
///
/// [`enrich_job_context`](crate::context::enrich_job_context) is the stock
/// hook publishing job name, instance id and step name.
pub fn with_context_enrichment(
    hook: impl Fn(RunContext, &dyn StepInstanceMeta) -> RunContext + Send + Sync + 'static,
) -> StepOption {
    let hook: StepContextPolicy = Arc::new(hook);
    Box::new(move |mut options| {
        options.context_policy = Some(hook);
        options
    })
}

/// Fail any invocation that runs longer than `timeout`; each retry gets a
/// fresh timer.
pub fn with_timeout(timeout: Duration) -> StepOption {
    Box::new(move |mut options| {
        options.timeout = Some(timeout);
        options
    })
}

/// Per-instance execution options.
#[derive(Debug, Clone)]
pub struct JobExecutionOptions {
    pub(crate) id: String,
    pub(crate) run_sequentially: bool,
}

impl Default for JobExecutionOptions {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            run_sequentially: false,
        }
    }
}

impl JobExecutionOptions {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn run_sequentially(&self) -> bool {
        self.run_sequentially
    }
}

/// A single job option; build them with [`with_job_id`] or
/// [`with_sequential_execution`].
pub type JobOption = Box<dyn FnOnce(JobExecutionOptions) -> JobExecutionOptions + Send>;

pub(crate) fn apply_job_options(options: Vec<JobOption>) -> JobExecutionOptions {
    options
        .into_iter()
        .fold(JobExecutionOptions::default(), |acc, prepare| prepare(acc))
}

/// Use `id` for the instance instead of a fresh UUID.
pub fn with_job_id(id: impl Into<String>) -> JobOption {
    let id = id.into();
    Box::new(move |mut options| {
        options.id = id;
        options
    })
}

/// Await each step's completion before creating the next, reducing the job
/// to a serial topological walk. Useful for deterministic testing.
pub fn with_sequential_execution() -> JobOption {
    Box::new(|mut options| {
        options.run_sequentially = true;
        options
    })
}
