use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::stage::{BoxError, Stage, StageContext, stage_fn};

/// Initialize tracing for tests with appropriate settings
#[inline]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Stage that returns its job input unchanged.
pub fn echo_stage(name: &str) -> impl Stage<u32, u32> + 'static {
    stage_fn(name, |ctx: StageContext<u32, u32>| async move {
        Ok::<_, BoxError>(*ctx.input())
    })
}

/// Stage that fails for inputs matching `fails`.
pub fn failing_stage(name: &str, fails: fn(&u32) -> bool) -> impl Stage<u32, u32> + 'static {
    stage_fn(name, move |ctx: StageContext<u32, u32>| async move {
        if fails(ctx.input()) {
            return Err::<u32, BoxError>(format!("rejected input {}", ctx.input()).into());
        }
        Ok(*ctx.input())
    })
}

/// Stage that blocks until the returned semaphore hands out a permit.
pub fn gated_stage(name: &str) -> (impl Stage<u32, u32> + 'static, Arc<Semaphore>) {
    let gate = Arc::new(Semaphore::new(0));
    let held = gate.clone();
    let stage = stage_fn(name, move |ctx: StageContext<u32, u32>| {
        let gate = held.clone();
        async move {
            gate.acquire().await?.forget();
            Ok::<_, BoxError>(*ctx.input())
        }
    });
    (stage, gate)
}
