//! Stage trait and pipeline definition.
//!
//! A [`Stage`] is one externally supplied asynchronous operation. The engine
//! only looks at whether it succeeded; its output is stored under the stage
//! name and handed to later stages of the same attempt.

use async_trait::async_trait;
use std::collections::HashSet;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::job::{JobId, StageResults};
use crate::{EngineError, Result};

/// Error type returned by stage functions.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Everything a stage can see while it runs.
#[derive(Debug)]
pub struct StageContext<I, O> {
    job_id: JobId,
    attempt: u32,
    input: Arc<I>,
    results: Arc<StageResults<O>>,
    cancellation: CancellationToken,
}

impl<I, O> Clone for StageContext<I, O> {
    fn clone(&self) -> Self {
        Self {
            job_id: self.job_id,
            attempt: self.attempt,
            input: self.input.clone(),
            results: self.results.clone(),
            cancellation: self.cancellation.clone(),
        }
    }
}

impl<I, O> StageContext<I, O> {
    pub(crate) fn new(
        job_id: JobId,
        attempt: u32,
        input: Arc<I>,
        results: Arc<StageResults<O>>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            job_id,
            attempt,
            input,
            results,
            cancellation,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// The job's immutable input.
    pub fn input(&self) -> &I {
        &self.input
    }

    /// Outputs of the stages that already completed in this attempt.
    pub fn results(&self) -> &StageResults<O> {
        &self.results
    }

    /// Output of an earlier stage by name.
    pub fn output_of(&self, stage: &str) -> Option<&O> {
        self.results.get(stage)
    }

    /// Token cancelled when the owning scheduler is reset. Stages that want
    /// to abandon an in-flight call on reset should select on it.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// One asynchronous step of a job.
#[async_trait]
pub trait Stage<I, O>: Send + Sync {
    /// Stage name; unique within a pipeline.
    fn name(&self) -> &str;

    /// Run the stage. Any error fails the whole job.
    async fn run(&self, ctx: StageContext<I, O>) -> std::result::Result<O, BoxError>;
}

/// A stage backed by an async closure. See [`stage_fn`].
pub struct FnStage<I, O, F> {
    name: String,
    func: F,
    _marker: PhantomData<fn(I) -> O>,
}

/// Build a stage from a name and an async closure.
///
/// ```
/// use stage_engine::{stage_fn, BoxError, StageContext};
///
/// let double = stage_fn("double", |ctx: StageContext<u32, u32>| async move {
///     Ok::<_, BoxError>(*ctx.input() * 2)
/// });
/// # let _ = double;
/// ```
pub fn stage_fn<I, O, F, Fut>(name: impl Into<String>, func: F) -> FnStage<I, O, F>
where
    F: Fn(StageContext<I, O>) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<O, BoxError>> + Send,
{
    FnStage {
        name: name.into(),
        func,
        _marker: PhantomData,
    }
}

#[async_trait]
impl<I, O, F, Fut> Stage<I, O> for FnStage<I, O, F>
where
    I: Send + Sync + 'static,
    O: Send + Sync + 'static,
    F: Fn(StageContext<I, O>) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<O, BoxError>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: StageContext<I, O>) -> std::result::Result<O, BoxError> {
        (self.func)(ctx).await
    }
}

/// Ordered list of stages every job of a scheduler runs through.
pub struct Pipeline<I, O> {
    stages: Vec<Arc<dyn Stage<I, O>>>,
}

impl<I, O> Default for Pipeline<I, O> {
    fn default() -> Self {
        Self { stages: Vec::new() }
    }
}

impl<I, O> Pipeline<I, O>
where
    I: Send + Sync + 'static,
    O: Send + Sync + 'static,
{
    /// Create an empty pipeline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage.
    ///
    /// Returns self for method chaining.
    pub fn add_stage<S: Stage<I, O> + 'static>(mut self, stage: S) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    /// Append an already shared stage.
    pub fn add_shared_stage(mut self, stage: Arc<dyn Stage<I, O>>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Check the pipeline is non-empty and its stage names are unique.
    pub fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            return Err(EngineError::EmptyPipeline);
        }
        let mut seen = HashSet::new();
        for stage in &self.stages {
            if !seen.insert(stage.name()) {
                return Err(EngineError::DuplicateStage(stage.name().to_string()));
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Stage names in execution order.
    pub fn stage_names(&self) -> Arc<[String]> {
        self.stages.iter().map(|s| s.name().to_string()).collect()
    }

    pub(crate) fn stage(&self, index: usize) -> Option<&Arc<dyn Stage<I, O>>> {
        self.stages.get(index)
    }
}
