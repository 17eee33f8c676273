//! Job instances: a single execution of a job definition.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use dag::Graph;
use tracing::{debug, error};

use crate::context::RunContext;
use crate::definition::{JobDefinition, JobDefinitionMeta};
use crate::error::JobError;
use crate::options::JobExecutionOptions;
use crate::step_instance::{connect_step_instances, StepInstanceMeta, StepInstanceNode};

/// Identity of a running job instance: definition name plus instance id.
#[derive(Debug, Clone)]
pub struct JobHandle {
    name: String,
    id: String,
}

impl JobHandle {
    pub(crate) fn new(name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
        }
    }

    /// Name of the job definition this instance was started from.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Unique id of this instance.
    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Type-erased surface of [`JobInstance`], used by the instance creators
/// the builder installs on each step definition.
pub trait JobInstanceMeta: Send + Sync {
    fn handle(&self) -> &JobHandle;

    /// The job input as an erased `Arc`; creators downcast it back to the
    /// input type the builder recorded.
    fn input_any(&self) -> Arc<dyn Any + Send + Sync>;

    fn get_step_instance(&self, name: &str) -> Option<Arc<dyn StepInstanceMeta>>;

    /// Register a freshly created step instance with edges from its
    /// precedents. Used by the builder.
    fn add_step_instance(
        &mut self,
        step: Arc<dyn StepInstanceMeta>,
        preceding: &[Arc<dyn StepInstanceMeta>],
    );
}

/// A single execution of a [`JobDefinition`]; owns one step instance per
/// step definition. All step tasks are already running (or gated on their
/// precedents) by the time `start` hands the instance back.
pub struct JobInstance<I> {
    definition: Arc<JobDefinition<I>>,
    input: Arc<I>,
    options: JobExecutionOptions,
    handle: JobHandle,
    steps: HashMap<String, Arc<dyn StepInstanceMeta>>,
    dag: Graph<StepInstanceNode>,
}

impl<I: Send + Sync + 'static> JobInstance<I> {
    pub(crate) fn new(
        definition: Arc<JobDefinition<I>>,
        input: I,
        options: JobExecutionOptions,
    ) -> Self {
        let handle = JobHandle::new(definition.name(), options.id());
        Self {
            definition,
            input: Arc::new(input),
            options,
            handle,
            steps: HashMap::new(),
            dag: Graph::new(connect_step_instances),
        }
    }

    /// Unique id of this instance.
    pub fn id(&self) -> &str {
        self.handle.id()
    }

    pub fn definition(&self) -> &Arc<JobDefinition<I>> {
        &self.definition
    }

    pub fn input(&self) -> &Arc<I> {
        &self.input
    }

    pub fn options(&self) -> &JobExecutionOptions {
        &self.options
    }

    /// Render the instance graph in graphviz dot format, with node colors
    /// and tooltips reflecting each step's current state and timings.
    pub fn visualize(&self) -> String {
        self.dag.to_dot_graph()
    }

    /// Block until every step reached a terminal state.
    ///
    /// Surfaces the root cause of the most upstream failure: precedent
    /// failures are unwrapped down to the `StepFailed` that raised them.
    /// Cancelling `ctx` aborts the wait with [`JobError::Canceled`]; the
    /// step tasks themselves keep running.
    pub async fn wait(&self, ctx: &RunContext) -> Result<(), JobError> {
        debug!(job = %self.handle.name(), id = %self.handle.id(), "waiting for job instance");

        let waitables: Vec<_> = self
            .dag
            .topological_sort()
            .into_iter()
            .map(|step| step.waitable())
            .collect();

        let all_settled = async {
            let mut first_error: Option<JobError> = None;
            for waitable in waitables {
                if let Err(err) = waitable.await {
                    first_error.get_or_insert(err);
                }
            }
            first_error
        };

        tokio::select! {
            _ = ctx.cancellation().cancelled() => Err(JobError::Canceled),
            outcome = all_settled => match outcome {
                Some(err) => Err(err.root_cause().clone()),
                None => Ok(()),
            },
        }
    }
}

impl<I: Send + Sync + 'static> JobInstanceMeta for JobInstance<I> {
    fn handle(&self) -> &JobHandle {
        &self.handle
    }

    fn input_any(&self) -> Arc<dyn Any + Send + Sync> {
        self.input.clone()
    }

    fn get_step_instance(&self, name: &str) -> Option<Arc<dyn StepInstanceMeta>> {
        self.steps.get(name).cloned()
    }

    fn add_step_instance(
        &mut self,
        step: Arc<dyn StepInstanceMeta>,
        preceding: &[Arc<dyn StepInstanceMeta>],
    ) {
        let name = step.name().to_string();
        self.steps.insert(name.clone(), step.clone());

        if let Err(err) = self.dag.add_node(StepInstanceNode(step)) {
            error!(step = %name, %err, "instance DAG bookkeeping failed");
            return;
        }
        for parent in preceding {
            if let Err(err) = self.dag.connect(parent.name(), &name) {
                error!(step = %name, parent = %parent.name(), %err, "instance DAG bookkeeping failed");
            }
        }
    }
}
