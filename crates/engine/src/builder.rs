//! Builder API: the typed step constructors and the instrumented task
//! wrapper they install on every step definition.
//!
//! Each constructor stores an *instance creator* on the new definition.
//! At `start` time the creator resolves the step's precedents inside the
//! job instance, recovers the typed parent instances recorded by the
//! builder, and spawns the instrumented user function as a tokio task
//! whose shared output fans out to downstream steps and to `wait`.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, error, warn};

use crate::context::RunContext;
use crate::definition::{JobDefinition, JobDefinitionMeta};
use crate::error::{JobError, StepError};
use crate::instance::JobInstanceMeta;
use crate::options::{apply_step_options, StepOption};
use crate::retry::{self, StepCall};
use crate::step::{StepDefinition, StepDefinitionMeta, StepKind};
use crate::step_instance::{StepInstance, StepInstanceMeta, StepState};

impl<I: Send + Sync + 'static> JobDefinition<I> {
    /// Add an independent step.
    ///
    /// `step_fn_factory` receives the job input when an instance starts
    /// and returns the per-invocation function, so every instance gets its
    /// own closure bound to its own input. If the options supply no
    /// precedent, the step is linked after the root so it cannot start
    /// before the input is materialized.
    pub fn add_step<T, F, SF, Fut>(
        &mut self,
        name: impl Into<String>,
        step_fn_factory: F,
        options: Vec<StepOption>,
    ) -> Result<Arc<StepDefinition<T>>, JobError>
    where
        T: Send + Sync + 'static,
        F: Fn(&I) -> SF + Send + Sync + 'static,
        SF: Fn(RunContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, StepError>> + Send + 'static,
    {
        let name = name.into();
        self.check_new_step(&name)?;

        let mut options = apply_step_options(options);
        let mut preceding = self.resolve_dependencies(&options)?;
        if preceding.is_empty() {
            self.link_after_root(&mut options, &mut preceding);
        }

        let step = Arc::new(StepDefinition::<T>::new(name, StepKind::Task, options));

        let creator = {
            let step = Arc::clone(&step);
            move |ctx: &RunContext, job: &mut dyn JobInstanceMeta| {
                let (preceding, waitables) = dependency_instances(step.as_ref(), job)?;
                let input = job_input::<I>(job);
                let step_fn = step_fn_factory(input.as_ref());

                let instance = Arc::new(StepInstance::<T>::new(
                    Arc::clone(&step),
                    job.handle().clone(),
                    StepState::Pending,
                ));

                let call: StepCall<T> = Arc::new(move |ctx| step_fn(ctx).boxed());
                let acquire: BoxFuture<'static, Result<StepCall<T>, JobError>> =
                    futures::future::ready(Ok(call)).boxed();
                spawn_step(&instance, ctx, waitables, acquire);

                let erased: Arc<dyn StepInstanceMeta> = instance;
                job.add_step_instance(erased.clone(), &preceding);
                Ok(erased)
            }
        };
        step.set_creator(Box::new(creator));

        self.register_step(step.clone(), &preceding)?;
        Ok(step)
    }

    /// Add a step after `parent`, consuming its output value.
    pub fn step_after<P, T, F, SF, Fut>(
        &mut self,
        name: impl Into<String>,
        parent: &Arc<StepDefinition<P>>,
        step_fn_factory: F,
        options: Vec<StepOption>,
    ) -> Result<Arc<StepDefinition<T>>, JobError>
    where
        P: Send + Sync + 'static,
        T: Send + Sync + 'static,
        F: Fn(&I) -> SF + Send + Sync + 'static,
        SF: Fn(RunContext, Arc<P>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, StepError>> + Send + 'static,
    {
        let name = name.into();
        self.check_new_step(&name)?;
        self.check_parent(parent)?;

        let mut options = apply_step_options(options);
        // The input parent is a dependency like any other, so the DAG and
        // the instance wiring see a single list.
        options.depend_on.push(parent.name().to_string());
        let preceding = self.resolve_dependencies(&options)?;

        let step = Arc::new(StepDefinition::<T>::new(name, StepKind::Task, options));

        let creator = {
            let step = Arc::clone(&step);
            let parent_name = parent.name().to_string();
            move |ctx: &RunContext, job: &mut dyn JobInstanceMeta| {
                let (preceding, waitables) = dependency_instances(step.as_ref(), job)?;
                let input = job_input::<I>(job);
                let step_fn = step_fn_factory(input.as_ref());
                let parent_task = typed_instance::<P>(&parent_name, job)?.task();

                let instance = Arc::new(StepInstance::<T>::new(
                    Arc::clone(&step),
                    job.handle().clone(),
                    StepState::Pending,
                ));

                let acquire: BoxFuture<'static, Result<StepCall<T>, JobError>> = async move {
                    let parent_value = parent_task.await?;
                    let call: StepCall<T> = Arc::new(move |ctx| {
                        step_fn(ctx, Arc::clone(&parent_value)).boxed()
                    });
                    Ok(call)
                }
                .boxed();
                spawn_step(&instance, ctx, waitables, acquire);

                let erased: Arc<dyn StepInstanceMeta> = instance;
                job.add_step_instance(erased.clone(), &preceding);
                Ok(erased)
            }
        };
        step.set_creator(Box::new(creator));

        self.register_step(step.clone(), &preceding)?;
        Ok(step)
    }

    /// Add a step after both parents, consuming both output values.
    pub fn step_after_both<P1, P2, T, F, SF, Fut>(
        &mut self,
        name: impl Into<String>,
        parent1: &Arc<StepDefinition<P1>>,
        parent2: &Arc<StepDefinition<P2>>,
        step_fn_factory: F,
        options: Vec<StepOption>,
    ) -> Result<Arc<StepDefinition<T>>, JobError>
    where
        P1: Send + Sync + 'static,
        P2: Send + Sync + 'static,
        T: Send + Sync + 'static,
        F: Fn(&I) -> SF + Send + Sync + 'static,
        SF: Fn(RunContext, Arc<P1>, Arc<P2>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, StepError>> + Send + 'static,
    {
        let name = name.into();
        self.check_new_step(&name)?;
        if parent1.name() == parent2.name() {
            return Err(JobError::DuplicateInputParentStep);
        }
        self.check_parent(parent1)?;
        self.check_parent(parent2)?;

        let mut options = apply_step_options(options);
        options.depend_on.push(parent1.name().to_string());
        options.depend_on.push(parent2.name().to_string());
        let preceding = self.resolve_dependencies(&options)?;

        let step = Arc::new(StepDefinition::<T>::new(name, StepKind::Task, options));

        let creator = {
            let step = Arc::clone(&step);
            let parent1_name = parent1.name().to_string();
            let parent2_name = parent2.name().to_string();
            move |ctx: &RunContext, job: &mut dyn JobInstanceMeta| {
                let (preceding, waitables) = dependency_instances(step.as_ref(), job)?;
                let input = job_input::<I>(job);
                let step_fn = step_fn_factory(input.as_ref());
                let parent1_task = typed_instance::<P1>(&parent1_name, job)?.task();
                let parent2_task = typed_instance::<P2>(&parent2_name, job)?.task();

                let instance = Arc::new(StepInstance::<T>::new(
                    Arc::clone(&step),
                    job.handle().clone(),
                    StepState::Pending,
                ));

                let acquire: BoxFuture<'static, Result<StepCall<T>, JobError>> = async move {
                    let parent1_value = parent1_task.await?;
                    let parent2_value = parent2_task.await?;
                    let call: StepCall<T> = Arc::new(move |ctx| {
                        step_fn(
                            ctx,
                            Arc::clone(&parent1_value),
                            Arc::clone(&parent2_value),
                        )
                        .boxed()
                    });
                    Ok(call)
                }
                .boxed();
                spawn_step(&instance, ctx, waitables, acquire);

                let erased: Arc<dyn StepInstanceMeta> = instance;
                job.add_step_instance(erased.clone(), &preceding);
                Ok(erased)
            }
        };
        step.set_creator(Box::new(creator));

        self.register_step(step.clone(), &preceding)?;
        Ok(step)
    }

    /// Same as [`add_step`](JobDefinition::add_step), but takes the
    /// per-invocation function directly. The function must not capture
    /// per-instance state, or it is shared between concurrent runs.
    pub fn add_step_static<T, SF, Fut>(
        &mut self,
        name: impl Into<String>,
        step_fn: SF,
        options: Vec<StepOption>,
    ) -> Result<Arc<StepDefinition<T>>, JobError>
    where
        T: Send + Sync + 'static,
        SF: Fn(RunContext) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<T, StepError>> + Send + 'static,
    {
        self.add_step(name, move |_: &I| step_fn.clone(), options)
    }

    /// Same as [`step_after`](JobDefinition::step_after), but takes the
    /// per-invocation function directly.
    pub fn step_after_static<P, T, SF, Fut>(
        &mut self,
        name: impl Into<String>,
        parent: &Arc<StepDefinition<P>>,
        step_fn: SF,
        options: Vec<StepOption>,
    ) -> Result<Arc<StepDefinition<T>>, JobError>
    where
        P: Send + Sync + 'static,
        T: Send + Sync + 'static,
        SF: Fn(RunContext, Arc<P>) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<T, StepError>> + Send + 'static,
    {
        self.step_after(name, parent, move |_: &I| step_fn.clone(), options)
    }

    /// Same as [`step_after_both`](JobDefinition::step_after_both), but
    /// takes the per-invocation function directly.
    pub fn step_after_both_static<P1, P2, T, SF, Fut>(
        &mut self,
        name: impl Into<String>,
        parent1: &Arc<StepDefinition<P1>>,
        parent2: &Arc<StepDefinition<P2>>,
        step_fn: SF,
        options: Vec<StepOption>,
    ) -> Result<Arc<StepDefinition<T>>, JobError>
    where
        P1: Send + Sync + 'static,
        P2: Send + Sync + 'static,
        T: Send + Sync + 'static,
        SF: Fn(RunContext, Arc<P1>, Arc<P2>) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<T, StepError>> + Send + 'static,
    {
        self.step_after_both(name, parent1, parent2, move |_: &I| step_fn.clone(), options)
    }

    fn check_new_step(&self, name: &str) -> Result<(), JobError> {
        if self.sealed() {
            return Err(JobError::AddStepInSealedJob(name.to_string()));
        }
        if self.get_step(name).is_some() {
            return Err(JobError::AddExistingStep(name.to_string()));
        }
        Ok(())
    }

    /// A parent handle must be this job's own registered definition, not a
    /// same-named one from another job.
    pub(crate) fn check_parent<P: Send + Sync + 'static>(
        &self,
        parent: &Arc<StepDefinition<P>>,
    ) -> Result<(), JobError> {
        let registered = self
            .get_step(parent.name())
            .ok_or_else(|| JobError::RefStepNotInJob(parent.name().to_string()))?;

        let same = registered
            .as_any()
            .downcast_ref::<StepDefinition<P>>()
            .map(|candidate| std::ptr::eq(candidate, parent.as_ref()))
            .unwrap_or(false);
        if !same {
            return Err(JobError::RefStepNotInJob(parent.name().to_string()));
        }
        Ok(())
    }

    fn resolve_dependencies(
        &self,
        options: &crate::options::StepExecutionOptions,
    ) -> Result<Vec<Arc<dyn StepDefinitionMeta>>, JobError> {
        options
            .depend_on()
            .iter()
            .map(|dep| {
                self.get_step(dep)
                    .ok_or_else(|| JobError::RefStepNotInJob(dep.clone()))
            })
            .collect()
    }

    fn link_after_root(
        &self,
        options: &mut crate::options::StepExecutionOptions,
        preceding: &mut Vec<Arc<dyn StepDefinitionMeta>>,
    ) {
        let root: Arc<dyn StepDefinitionMeta> = self.root_step().clone();
        options.depend_on.push(root.name().to_string());
        preceding.push(root);
    }
}

/// Resolve a step's dependencies inside the job instance, returning both
/// the erased instances (for DAG edges) and their completion futures.
fn dependency_instances(
    step: &dyn StepDefinitionMeta,
    job: &dyn JobInstanceMeta,
) -> Result<
    (
        Vec<Arc<dyn StepInstanceMeta>>,
        Vec<BoxFuture<'static, Result<(), JobError>>>,
    ),
    JobError,
> {
    let mut instances = Vec::new();
    let mut waitables = Vec::new();
    for dep in step.depends_on() {
        let instance = job
            .get_step_instance(dep)
            .ok_or_else(|| JobError::RuntimeStepNotFound(dep.clone()))?;
        waitables.push(instance.waitable());
        instances.push(instance);
    }
    Ok((instances, waitables))
}

/// Recover the typed job input from the erased instance handle. The
/// builder only registers steps on `JobDefinition<I>`, so the pairing is
/// established at construction and the downcast cannot fail.
fn job_input<I: Send + Sync + 'static>(job: &dyn JobInstanceMeta) -> Arc<I> {
    job.input_any()
        .downcast::<I>()
        .expect("job instance input type recorded by the builder")
}

/// Recover a typed step instance from the job's erased map. The typed
/// handle and the erased record are paired by the builder alone, which
/// makes the downcast sound.
pub(crate) fn typed_instance<T: Send + Sync + 'static>(
    name: &str,
    job: &dyn JobInstanceMeta,
) -> Result<Arc<StepInstance<T>>, JobError> {
    let meta = job
        .get_step_instance(name)
        .ok_or_else(|| JobError::RuntimeStepNotFound(name.to_string()))?;
    Ok(meta
        .as_any_arc()
        .downcast::<StepInstance<T>>()
        .expect("step instance type recorded by the builder"))
}

/// Spawn the instrumented step task and install its shared output on the
/// instance.
fn spawn_step<T: Send + Sync + 'static>(
    instance: &Arc<StepInstance<T>>,
    ctx: &RunContext,
    preceding_tasks: Vec<BoxFuture<'static, Result<(), JobError>>>,
    acquire: BoxFuture<'static, Result<StepCall<T>, JobError>>,
) {
    let run = {
        let instance = Arc::clone(instance);
        let ctx = ctx.clone();
        run_instrumented(instance, ctx, preceding_tasks, acquire)
    };

    let handle = tokio::spawn(run);
    let settle = {
        let instance = Arc::clone(instance);
        async move {
            match handle.await {
                Ok(result) => result,
                // Runtime-level failure (abort, runtime shutdown); user
                // panics are already contained inside the task.
                Err(join_error) => Err(JobError::step_failed(erased(&instance), Box::new(join_error))),
            }
        }
    };
    instance.install_task(settle.boxed().shared());
}

async fn run_instrumented<T: Send + Sync + 'static>(
    instance: Arc<StepInstance<T>>,
    ctx: RunContext,
    preceding_tasks: Vec<BoxFuture<'static, Result<(), JobError>>>,
    acquire: BoxFuture<'static, Result<StepCall<T>, JobError>>,
) -> Result<Arc<T>, JobError> {
    // Typed parents first: a failed parent short-circuits before the step
    // ever starts; state and timings stay untouched.
    let call = match acquire.await {
        Ok(call) => call,
        Err(parent_error) => {
            return Err(JobError::precedent_failed(erased(&instance), parent_error));
        }
    };

    // Precedence-only edges are awaited explicitly; same treatment.
    for task in preceding_tasks {
        if let Err(precedent_error) = task.await {
            return Err(JobError::precedent_failed(erased(&instance), precedent_error));
        }
    }

    let step_options = instance.definition_typed().execution_options();
    let retry_policy = step_options.retry_policy.clone();
    let timeout = step_options.timeout();

    let tracker = Arc::clone(instance.tracker());
    tracker.mark_started(Utc::now());
    tracker.set_state(StepState::Running);
    let started = Instant::now();
    debug!(step = %instance.name(), job = %instance.job().name(), "step running");

    let ctx = enriched_context(&ctx, instance.as_ref());

    let result = match retry_policy {
        Some(policy) => {
            tracker.init_retry_report();
            retry::run_with_retry(
                policy.as_ref(),
                &tracker,
                &call,
                &ctx,
                timeout,
                instance.name(),
            )
            .await
        }
        None => retry::guarded(&call, &ctx, timeout).await,
    };

    tracker.record_duration(started.elapsed());

    match result {
        Ok(value) => {
            tracker.set_state(StepState::Completed);
            debug!(step = %instance.name(), "step completed");
            Ok(Arc::new(value))
        }
        Err(cause) => {
            tracker.set_state(StepState::Failed);
            error!(step = %instance.name(), %cause, "step failed");
            Err(JobError::step_failed(erased(&instance), cause))
        }
    }
}

/// Apply the step's context policy, if any. A panicking hook is contained:
/// the step proceeds with the base context.
fn enriched_context<T: Send + Sync + 'static>(
    ctx: &RunContext,
    instance: &StepInstance<T>,
) -> RunContext {
    let policy = match &instance.definition_typed().execution_options().context_policy {
        Some(policy) => Arc::clone(policy),
        None => return ctx.clone(),
    };

    match std::panic::catch_unwind(AssertUnwindSafe(|| policy(ctx.clone(), instance))) {
        Ok(enriched) => enriched,
        Err(_) => {
            warn!(step = %instance.name(), "context enrichment panicked, continuing with the base context");
            ctx.clone()
        }
    }
}

fn erased<T: Send + Sync + 'static>(instance: &Arc<StepInstance<T>>) -> Arc<dyn StepInstanceMeta> {
    Arc::clone(instance) as Arc<dyn StepInstanceMeta>
}
