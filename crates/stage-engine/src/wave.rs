//! Fixed-size wave batching.
//!
//! An alternative admission policy layered on the continuous-refill
//! scheduler: inputs are split into waves of at most `wave_size` jobs and the
//! next wave is only enqueued once every job of the current one has settled.
//! Within a wave the scheduler's own ceiling still applies.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use crate::job::JobOutcome;
use crate::scheduler::Scheduler;
use crate::{EngineError, Result};

/// Wave batching options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaveOptions {
    /// Maximum number of jobs per wave.
    pub wave_size: usize,
    /// Delay between the end of one wave and the start of the next.
    #[serde(default)]
    pub pause_between: Duration,
}

impl WaveOptions {
    pub fn new(wave_size: usize) -> Self {
        Self {
            wave_size,
            pause_between: Duration::ZERO,
        }
    }

    pub fn with_pause(mut self, pause: Duration) -> Self {
        self.pause_between = pause;
        self
    }
}

/// Run `inputs` through `scheduler` wave by wave.
///
/// Returns one outcome per input, in input order. A failed job does not stop
/// later waves.
pub async fn run_in_waves<I, O>(
    scheduler: &Scheduler<I, O>,
    inputs: impl IntoIterator<Item = I>,
    options: WaveOptions,
) -> Result<Vec<JobOutcome<O>>>
where
    I: Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
{
    if options.wave_size == 0 {
        return Err(EngineError::InvalidConfig(
            "wave_size must be greater than zero".into(),
        ));
    }

    let inputs: Vec<I> = inputs.into_iter().collect();
    let total = inputs.len();
    let waves = total.div_ceil(options.wave_size);
    info!(
        scheduler = %scheduler.name(),
        total,
        waves,
        wave_size = options.wave_size,
        "Starting wave run"
    );

    let mut outcomes = Vec::with_capacity(total);
    let mut remaining = inputs.into_iter().peekable();
    let mut wave = 0;
    while remaining.peek().is_some() {
        wave += 1;
        let batch: Vec<I> = remaining.by_ref().take(options.wave_size).collect();
        let ids = scheduler.enqueue(batch);
        debug!(scheduler = %scheduler.name(), wave, jobs = ids.len(), "Wave enqueued");

        let settled = scheduler.wait_for(&ids).await;
        let failed = settled.iter().filter(|outcome| !outcome.is_success()).count();
        info!(scheduler = %scheduler.name(), wave, waves, failed, "Wave settled");
        outcomes.extend(settled);

        if remaining.peek().is_some() && !options.pause_between.is_zero() {
            tokio::time::sleep(options.pause_between).await;
        }
    }

    Ok(outcomes)
}
