use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::inference::{
    AnalyzeRequest, CompressRequest, GenerateRequest, ImageData, InferenceClient, SaveRequest,
    SavedRecord,
};
use crate::{Error, Result};

/// Initialize tracing for tests with appropriate settings
#[inline]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

pub fn png(bytes: &[u8]) -> ImageData {
    ImageData::new("image/png", bytes.to_vec())
}

/// In-memory [`InferenceClient`].
///
/// Every call sleeps for `latency`, records its name, and fails when its
/// name/key pair is in the fail list. Keys are the constraints for
/// `analyze`, the prompt for `generate`, and the record name for `save`.
#[derive(Default)]
pub struct FakeInferenceClient {
    pub latency: Duration,
    failures: Mutex<HashSet<(&'static str, String)>>,
    calls: Mutex<Vec<(&'static str, String)>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl FakeInferenceClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_latency(latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            latency,
            ..Self::default()
        })
    }

    pub fn fail_on(&self, call: &'static str, key: &str) {
        self.failures.lock().insert((call, key.to_string()));
    }

    pub fn recover(&self, call: &'static str, key: &str) {
        self.failures.lock().remove(&(call, key.to_string()));
    }

    pub fn calls(&self) -> Vec<(&'static str, String)> {
        self.calls.lock().clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls.lock().iter().filter(|(c, _)| *c == call).count()
    }

    /// Highest number of calls observed running at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    async fn call(&self, name: &'static str, key: &str) -> Result<()> {
        self.calls.lock().push((name, key.to_string()));
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failures.lock().contains(&(name, key.to_string())) {
            return Err(Error::Api {
                status: 500,
                body: format!("{} failed for {}", name, key),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl InferenceClient for FakeInferenceClient {
    async fn analyze(&self, request: &AnalyzeRequest) -> Result<String> {
        self.call("analyze", &request.constraints).await?;
        Ok(format!("described: {}", request.constraints))
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<ImageData> {
        self.call("generate", &request.prompt).await?;
        Ok(png(request.prompt.as_bytes()))
    }

    async fn compress(&self, request: &CompressRequest) -> Result<ImageData> {
        self.call("compress", &request.size.to_string()).await?;
        let keep = request.image.data.len().min(request.size as usize);
        Ok(ImageData::new("image/jpeg", request.image.data[..keep].to_vec()))
    }

    async fn save(&self, request: &SaveRequest) -> Result<SavedRecord> {
        self.call("save", &request.name).await?;
        Ok(SavedRecord {
            id: format!("rec-{}", request.name),
            name: request.name.clone(),
            description: request.description.clone(),
            thumbnail_url: None,
        })
    }
}
