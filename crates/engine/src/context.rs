//! Ambient execution context handed to every step function.
//!
//! A [`RunContext`] carries a cancellation token plus an immutable string
//! key/value bag. Enrichment hooks derive new contexts per step, so
//! correlation metadata (job name, instance id, step name) is visible to
//! user code and its logs without any shared mutable state.

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::step_instance::StepInstanceMeta;

/// Context key under which [`enrich_job_context`] publishes the job name.
pub const JOB_NAME_KEY: &str = "jobflow.job_name";

/// Context key under which [`enrich_job_context`] publishes the job
/// instance id.
pub const JOB_ID_KEY: &str = "jobflow.job_id";

/// Context key under which [`enrich_job_context`] publishes the step name.
pub const STEP_NAME_KEY: &str = "jobflow.step_name";

/// Immutable key/value bag plus a cancellation token.
///
/// Cloning is cheap. [`with_value`](RunContext::with_value) returns a
/// derived context and leaves the original untouched, so hooks can layer
/// values per step without affecting sibling steps.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    cancellation: CancellationToken,
    values: Arc<HashMap<String, String>>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derived context that reports cancellation through `token`.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Derived context with `key` set to `value`.
    pub fn with_value(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut values: HashMap<String, String> = (*self.values).clone();
        values.insert(key.into(), value.into());
        Self {
            cancellation: self.cancellation.clone(),
            values: Arc::new(values),
        }
    }

    pub fn value(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// True once the context has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// Stock enrichment hook publishing [`JOB_NAME_KEY`], [`JOB_ID_KEY`] and
/// [`STEP_NAME_KEY`]; pass it to
/// [`with_context_enrichment`](crate::options::with_context_enrichment).
pub fn enrich_job_context(ctx: RunContext, step: &dyn StepInstanceMeta) -> RunContext {
    ctx.with_value(JOB_NAME_KEY, step.job().name())
        .with_value(JOB_ID_KEY, step.job().id())
        .with_value(STEP_NAME_KEY, step.name())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_context_is_empty_and_live() {
        let ctx = RunContext::new();
        assert_eq!(ctx.value(JOB_NAME_KEY), None);
        assert!(!ctx.is_cancelled());
    }

    #[test]
    fn with_value_derives_without_mutating_parent() {
        let base = RunContext::new();
        let derived = base.with_value("k", "v").with_value("k2", "v2");

        assert_eq!(base.value("k"), None);
        assert_eq!(derived.value("k"), Some("v"));
        assert_eq!(derived.value("k2"), Some("v2"));
    }

    #[test]
    fn with_cancellation_swaps_the_token() {
        let token = CancellationToken::new();
        let ctx = RunContext::new().with_cancellation(token.clone());
        token.cancel();
        assert!(ctx.is_cancelled());
    }
}
