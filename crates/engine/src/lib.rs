//! `engine` crate — typed dataflow job engine.
//!
//! A [`JobDefinition`] is a reusable template: a DAG of typed steps built
//! once (process start is a good place) and started any number of times.
//! Each [`start`](JobDefinition::start) produces a [`JobInstance`] whose
//! steps run as independent tokio tasks gated on their precedents, with
//! optional retry, panic containment, and per-step execution records that
//! can be rendered as a graphviz dot graph at any time.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use engine::{JobDefinition, RunContext, StepError};
//! use futures::FutureExt;
//!
//! # async fn demo() -> Result<(), engine::JobError> {
//! let mut job = JobDefinition::<String>::new("greet");
//!
//! let upper = job.add_step(
//!     "Upper",
//!     |input: &String| {
//!         let input = input.clone();
//!         move |_ctx: RunContext| {
//!             let input = input.clone();
//!             async move { Ok::<_, StepError>(input.to_uppercase()) }.boxed()
//!         }
//!     },
//!     vec![],
//! )?;
//!
//! let _shout = job.step_after(
//!     "Shout",
//!     &upper,
//!     |_input: &String| {
//!         |_ctx: RunContext, upper: Arc<String>| {
//!             async move { Ok::<_, StepError>(format!("{upper}!")) }.boxed()
//!         }
//!     },
//!     vec![],
//! )?;
//!
//! let job = Arc::new(job);
//! let ctx = RunContext::new();
//! let instance = job.start(&ctx, "hello".to_string(), vec![]).await?;
//! instance.wait(&ctx).await?;
//! # Ok(())
//! # }
//! ```

mod builder;
pub mod context;
pub mod definition;
pub mod error;
pub mod instance;
pub mod options;
pub mod result;
pub mod retry;
pub mod step;
pub mod step_instance;

pub use context::{enrich_job_context, RunContext, JOB_ID_KEY, JOB_NAME_KEY, STEP_NAME_KEY};
pub use dag::GraphError;
pub use definition::{JobDefinition, JobDefinitionMeta};
pub use error::{JobError, PanicError, StepError, TimeoutError};
pub use instance::{JobHandle, JobInstance, JobInstanceMeta};
pub use options::{
    execute_after, with_context_enrichment, with_job_id, with_retry, with_sequential_execution,
    with_timeout, JobExecutionOptions, JobOption, StepContextPolicy, StepExecutionOptions,
    StepOption,
};
pub use result::{with_result, JobDefinitionWithResult, JobInstanceWithResult};
pub use retry::{RetryPolicy, RetryReport};
pub use step::{StepDefinition, StepDefinitionMeta, StepKind};
pub use step_instance::{ExecutionData, StepInstance, StepInstanceMeta, StepState};
