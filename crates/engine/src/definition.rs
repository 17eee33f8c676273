//! Job definitions: reusable named DAGs of typed steps.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dag::Graph;
use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::debug;

use crate::context::RunContext;
use crate::error::JobError;
use crate::instance::{JobInstance, JobInstanceMeta};
use crate::options::{apply_job_options, JobOption, StepExecutionOptions};
use crate::step::{
    connect_step_definitions, StepDefinition, StepDefinitionMeta, StepDefinitionNode, StepKind,
};
use crate::step_instance::{StepInstance, StepState};

/// Type-erased surface of [`JobDefinition`].
pub trait JobDefinitionMeta: Send + Sync {
    fn name(&self) -> &str;

    /// Seal the definition; idempotent. A sealed definition rejects any
    /// further builder call but is safe for concurrent reads and starts.
    fn seal(&self);

    fn sealed(&self) -> bool;

    fn get_step(&self, name: &str) -> Option<Arc<dyn StepDefinitionMeta>>;

    /// Render the definition graph in graphviz dot format.
    fn visualize(&self) -> String;
}

/// A reusable job template: a DAG of typed steps parameterized over the
/// input type `I`.
///
/// Build it once (process start is a good place), then
/// [`start`](JobDefinition::start) it any number of times.
pub struct JobDefinition<I> {
    name: String,
    sealed: AtomicBool,
    steps: HashMap<String, Arc<dyn StepDefinitionMeta>>,
    dag: Graph<StepDefinitionNode>,
    root: Arc<StepDefinition<I>>,
}

impl<I: Send + Sync + 'static> JobDefinition<I> {
    /// Create a definition with a synthetic root step named after the job;
    /// the root's output is the job input and every real step transitively
    /// depends on it.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let root = Arc::new(StepDefinition::<I>::new(
            name.clone(),
            StepKind::Root,
            StepExecutionOptions::default(),
        ));

        let mut definition = Self {
            name: name.clone(),
            sealed: AtomicBool::new(false),
            steps: HashMap::new(),
            dag: Graph::new(connect_step_definitions),
            root,
        };

        let root_meta: Arc<dyn StepDefinitionMeta> = definition.root.clone();
        definition.steps.insert(name, root_meta.clone());
        // The root is the first node, so this cannot collide.
        let _ = definition.dag.add_node(StepDefinitionNode(root_meta));

        definition
    }

    pub(crate) fn root_step(&self) -> &Arc<StepDefinition<I>> {
        &self.root
    }

    /// Register `step` with edges from each of `preceding`. The endpoints
    /// are all registered by the builder before connecting, so a dangling
    /// reference here maps to `RefStepNotInJob`.
    pub(crate) fn register_step(
        &mut self,
        step: Arc<dyn StepDefinitionMeta>,
        preceding: &[Arc<dyn StepDefinitionMeta>],
    ) -> Result<(), JobError> {
        self.steps.insert(step.name().to_string(), step.clone());
        self.dag.add_node(StepDefinitionNode(step.clone()))?;
        for parent in preceding {
            self.dag
                .connect(parent.name(), step.name())
                .map_err(|err| match err {
                    dag::GraphError::ConnectNotExistingNode(_) => {
                        JobError::RefStepNotInJob(parent.name().to_string())
                    }
                    other => JobError::Graph(other),
                })?;
        }
        Ok(())
    }

    /// Start a new instance; seals the definition on first use.
    ///
    /// The receiver is the shared template (`Arc`), so a definition built
    /// once can be started concurrently from many places. The returned
    /// instance is already executing: the root step completed with the
    /// input, and every other step runs as its precedents allow. With
    /// [`with_sequential_execution`](crate::options::with_sequential_execution)
    /// each step settles before the next is created.
    pub async fn start(
        self: Arc<Self>,
        ctx: &RunContext,
        input: I,
        options: Vec<JobOption>,
    ) -> Result<JobInstance<I>, JobError> {
        if !self.sealed() {
            self.seal();
        }

        let job_options = apply_job_options(options);
        let sequential = job_options.run_sequentially();
        let mut instance = JobInstance::new(self.clone(), input, job_options);

        debug!(job = %self.name, id = %instance.id(), sequential, "starting job instance");

        // The root step completes immediately, carrying the job input.
        let root = Arc::new(StepInstance::<I>::new(
            self.root.clone(),
            instance.handle().clone(),
            StepState::Completed,
        ));
        let root_task: BoxFuture<'static, Result<Arc<I>, JobError>> =
            futures::future::ready(Ok(instance.input().clone())).boxed();
        root.install_task(root_task.shared());
        instance.add_step_instance(root, &[]);

        for step in self.dag.topological_sort() {
            if step.kind() == StepKind::Root {
                continue;
            }
            let created = step.create_instance(ctx, &mut instance)?;
            if sequential {
                let _ = created.waitable().await;
            }
        }

        Ok(instance)
    }
}

impl<I: Send + Sync + 'static> JobDefinitionMeta for JobDefinition<I> {
    fn name(&self) -> &str {
        &self.name
    }

    fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
    }

    fn sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    fn get_step(&self, name: &str) -> Option<Arc<dyn StepDefinitionMeta>> {
        self.steps.get(name).cloned()
    }

    fn visualize(&self) -> String {
        self.dag.to_dot_graph()
    }
}
