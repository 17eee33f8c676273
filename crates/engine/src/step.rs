//! Step definitions: the typed templates registered in a job definition.

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, OnceLock};

use dag::{DotEdgeSpec, DotNodeSpec};

use crate::context::RunContext;
use crate::error::JobError;
use crate::instance::JobInstanceMeta;
use crate::options::StepExecutionOptions;
use crate::step_instance::StepInstanceMeta;

/// Role of a step within its job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    /// Synthetic step whose output is the job input; every real step
    /// transitively depends on it.
    Root,
    /// Regular user-supplied step.
    Task,
}

/// Materializes one step instance bound to a job instance. Installed by the
/// builder, invoked by the scheduler.
pub(crate) type InstanceCreator = Box<
    dyn Fn(&RunContext, &mut dyn JobInstanceMeta) -> Result<Arc<dyn StepInstanceMeta>, JobError>
        + Send
        + Sync,
>;

/// Type-erased surface of [`StepDefinition`]; what the job's DAG stores.
pub trait StepDefinitionMeta: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> StepKind;

    /// Names of the steps this one is gated on (input parents included).
    fn depends_on(&self) -> &[String];

    fn execution_options(&self) -> &StepExecutionOptions;

    /// DOT attributes used when rendering the definition graph.
    fn dot_spec(&self) -> DotNodeSpec;

    /// Materialize a step instance bound to `job`. Used by the scheduler.
    fn create_instance(
        &self,
        ctx: &RunContext,
        job: &mut dyn JobInstanceMeta,
    ) -> Result<Arc<dyn StepInstanceMeta>, JobError>;

    /// Identity hook for parent-handle validation.
    fn as_any(&self) -> &dyn Any;
}

/// Typed step template. `T` is the step's output type; the handle returned
/// by the builder keeps `T` so downstream steps can consume the value with
/// static type safety.
pub struct StepDefinition<T> {
    name: String,
    kind: StepKind,
    options: StepExecutionOptions,
    creator: OnceLock<InstanceCreator>,
    _output: PhantomData<fn() -> T>,
}

impl<T: Send + Sync + 'static> StepDefinition<T> {
    pub(crate) fn new(
        name: impl Into<String>,
        kind: StepKind,
        options: StepExecutionOptions,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            options,
            creator: OnceLock::new(),
            _output: PhantomData,
        }
    }

    /// Install the instance creator; the builder does this exactly once,
    /// right after construction.
    pub(crate) fn set_creator(&self, creator: InstanceCreator) {
        let _ = self.creator.set(creator);
    }
}

impl<T: Send + Sync + 'static> StepDefinitionMeta for StepDefinition<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StepKind {
        self.kind
    }

    fn depends_on(&self) -> &[String] {
        self.options.depend_on()
    }

    fn execution_options(&self) -> &StepExecutionOptions {
        &self.options
    }

    fn dot_spec(&self) -> DotNodeSpec {
        let shape = match self.kind {
            StepKind::Root => "triangle",
            StepKind::Task => "box",
        };

        DotNodeSpec {
            name: self.name.clone(),
            display_name: self.name.clone(),
            tooltip: String::new(),
            shape: shape.to_string(),
            style: "filled".to_string(),
            fill_color: "gray".to_string(),
        }
    }

    fn create_instance(
        &self,
        ctx: &RunContext,
        job: &mut dyn JobInstanceMeta,
    ) -> Result<Arc<dyn StepInstanceMeta>, JobError> {
        match self.creator.get() {
            Some(creator) => creator(ctx, job),
            // The root step is materialized directly by the scheduler and
            // never goes through a creator.
            None => Err(JobError::RuntimeStepNotFound(self.name.clone())),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl<T> fmt::Debug for StepDefinition<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDefinition")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("depend_on", &self.options.depend_on())
            .finish()
    }
}

/// Newtype wrapper so [`dag::GraphNode`] (a foreign trait) can be
/// implemented for an erased step definition (`Arc<dyn StepDefinitionMeta>`
/// alone is a foreign type from this crate's perspective, per the orphan
/// rules).
pub(crate) struct StepDefinitionNode(pub(crate) Arc<dyn StepDefinitionMeta>);

impl std::ops::Deref for StepDefinitionNode {
    type Target = dyn StepDefinitionMeta;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl dag::GraphNode for StepDefinitionNode {
    fn key(&self) -> &str {
        self.name()
    }

    fn dot_spec(&self) -> DotNodeSpec {
        StepDefinitionMeta::dot_spec(self.0.as_ref())
    }
}

/// Edge attributes between two step definitions.
pub(crate) fn connect_step_definitions(
    from: &StepDefinitionNode,
    to: &StepDefinitionNode,
) -> DotEdgeSpec {
    DotEdgeSpec {
        from: from.name().to_string(),
        to: to.name().to_string(),
        tooltip: String::new(),
        style: "bold".to_string(),
        color: "black".to_string(),
    }
}
