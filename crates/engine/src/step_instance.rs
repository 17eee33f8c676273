//! Step instances: one execution of one step, with observable state.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use dag::{DotEdgeSpec, DotNodeSpec};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;

use crate::error::JobError;
use crate::instance::JobHandle;
use crate::retry::RetryReport;
use crate::step::{StepDefinition, StepDefinitionMeta, StepKind};

/// Lifecycle of a step instance; progresses monotonically
/// pending → running → (completed | failed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl StepState {
    fn fill_color(self) -> &'static str {
        match self {
            StepState::Pending => "gray",
            StepState::Running => "yellow",
            StepState::Completed => "green",
            StepState::Failed => "red",
        }
    }
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StepState::Pending => "pending",
            StepState::Running => "running",
            StepState::Completed => "completed",
            StepState::Failed => "failed",
        })
    }
}

/// Execution record for a step instance.
///
/// Fields stay unset until the step actually starts; a step skipped
/// because a precedent failed keeps an empty record.
#[derive(Debug, Clone, Default)]
pub struct ExecutionData {
    pub start_time: Option<DateTime<Utc>>,
    pub duration: Option<Duration>,
    pub retried: Option<RetryReport>,
}

/// Shared mutable cell between a [`StepInstance`] and its running task.
/// Written only by the owning task; observers read snapshots.
#[derive(Debug)]
pub(crate) struct StepTracker {
    state: RwLock<StepState>,
    exec: RwLock<ExecutionData>,
}

impl StepTracker {
    pub(crate) fn new(state: StepState) -> Self {
        Self {
            state: RwLock::new(state),
            exec: RwLock::new(ExecutionData::default()),
        }
    }

    pub(crate) fn state(&self) -> StepState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_state(&self, next: StepState) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = next;
    }

    pub(crate) fn execution_data(&self) -> ExecutionData {
        self.exec
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn mark_started(&self, at: DateTime<Utc>) {
        self.exec
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .start_time = Some(at);
    }

    pub(crate) fn record_duration(&self, duration: Duration) {
        self.exec
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .duration = Some(duration);
    }

    pub(crate) fn init_retry_report(&self) {
        self.exec
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retried = Some(RetryReport::default());
    }

    pub(crate) fn retry_count(&self) -> u32 {
        self.exec
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .retried
            .map(|report| report.count)
            .unwrap_or(0)
    }

    pub(crate) fn bump_retry(&self) {
        if let Some(report) = self
            .exec
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retried
            .as_mut()
        {
            report.count += 1;
        }
    }
}

/// A step's output future: shared, cloneable, fans out to every consumer.
pub(crate) type SharedStepTask<T> = Shared<BoxFuture<'static, Result<Arc<T>, JobError>>>;

/// Type-erased surface of [`StepInstance`]; what observers, enrichment
/// hooks and the scheduler see.
pub trait StepInstanceMeta: fmt::Debug + Send + Sync {
    fn name(&self) -> &str;

    fn state(&self) -> StepState;

    /// Snapshot of the execution record.
    fn execution_data(&self) -> ExecutionData;

    /// Back-link to the step definition.
    fn definition(&self) -> Arc<dyn StepDefinitionMeta>;

    /// The owning job instance (definition name + instance id).
    fn job(&self) -> &JobHandle;

    /// Erased completion future; resolves once the step is terminal.
    fn waitable(&self) -> BoxFuture<'static, Result<(), JobError>>;

    /// DOT attributes reflecting the current state.
    fn dot_spec(&self) -> DotNodeSpec;

    /// Downcast hook used to recover the typed instance.
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// One execution of one step within a job instance. `T` is the output.
pub struct StepInstance<T> {
    definition: Arc<StepDefinition<T>>,
    job: JobHandle,
    tracker: Arc<StepTracker>,
    task: OnceLock<SharedStepTask<T>>,
}

impl<T: Send + Sync + 'static> StepInstance<T> {
    pub(crate) fn new(
        definition: Arc<StepDefinition<T>>,
        job: JobHandle,
        state: StepState,
    ) -> Self {
        Self {
            definition,
            job,
            tracker: Arc::new(StepTracker::new(state)),
            task: OnceLock::new(),
        }
    }

    pub(crate) fn definition_typed(&self) -> &Arc<StepDefinition<T>> {
        &self.definition
    }

    pub(crate) fn tracker(&self) -> &Arc<StepTracker> {
        &self.tracker
    }

    pub(crate) fn install_task(&self, task: SharedStepTask<T>) {
        let _ = self.task.set(task);
    }

    /// The step's typed output future; cloning shares the same result.
    pub(crate) fn task(&self) -> SharedStepTask<T> {
        self.task
            .get()
            .expect("step task is installed at instance creation")
            .clone()
    }
}

impl<T: Send + Sync + 'static> StepInstanceMeta for StepInstance<T> {
    fn name(&self) -> &str {
        self.definition.name()
    }

    fn state(&self) -> StepState {
        self.tracker.state()
    }

    fn execution_data(&self) -> ExecutionData {
        self.tracker.execution_data()
    }

    fn definition(&self) -> Arc<dyn StepDefinitionMeta> {
        self.definition.clone()
    }

    fn job(&self) -> &JobHandle {
        &self.job
    }

    fn waitable(&self) -> BoxFuture<'static, Result<(), JobError>> {
        let task = self.task();
        async move { task.await.map(|_| ()) }.boxed()
    }

    fn dot_spec(&self) -> DotNodeSpec {
        let shape = match self.definition.kind() {
            StepKind::Root => "triangle",
            StepKind::Task => "hexagon",
        };

        let state = self.state();
        let exec = self.execution_data();
        let tooltip = match exec.start_time {
            Some(start) if state != StepState::Pending => format!(
                "State: {}\\nStartAt: {}\\nDuration: {:?}",
                state,
                start.to_rfc3339_opts(SecondsFormat::Nanos, true),
                exec.duration.unwrap_or_default(),
            ),
            _ => String::new(),
        };

        DotNodeSpec {
            name: self.name().to_string(),
            display_name: self.name().to_string(),
            tooltip,
            shape: shape.to_string(),
            style: "filled".to_string(),
            fill_color: state.fill_color().to_string(),
        }
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl<T: Send + Sync + 'static> fmt::Debug for StepInstance<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepInstance")
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

/// Newtype wrapper so [`dag::GraphNode`] (a foreign trait) can be
/// implemented for an erased step instance (`Arc<dyn StepInstanceMeta>`
/// alone is a foreign type from this crate's perspective, per the orphan
/// rules).
pub(crate) struct StepInstanceNode(pub(crate) Arc<dyn StepInstanceMeta>);

impl std::ops::Deref for StepInstanceNode {
    type Target = dyn StepInstanceMeta;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl dag::GraphNode for StepInstanceNode {
    fn key(&self) -> &str {
        self.name()
    }

    fn dot_spec(&self) -> DotNodeSpec {
        StepInstanceMeta::dot_spec(self.0.as_ref())
    }
}

/// Edge attributes between two step instances; the color reflects the
/// predecessor's terminal state, the tooltip carries the downstream step's
/// start time once it has begun.
pub(crate) fn connect_step_instances(
    from: &StepInstanceNode,
    to: &StepInstanceNode,
) -> DotEdgeSpec {
    let color = match from.state() {
        StepState::Completed => "green",
        StepState::Failed => "red",
        _ => "black",
    };

    let tooltip = match to.execution_data().start_time {
        Some(start) if to.state() != StepState::Pending => {
            format!("Time: {}", start.to_rfc3339_opts(SecondsFormat::Nanos, true))
        }
        _ => String::new(),
    };

    DotEdgeSpec {
        from: from.name().to_string(),
        to: to.name().to_string(),
        tooltip,
        style: "bold".to_string(),
        color: color.to_string(),
    }
}
