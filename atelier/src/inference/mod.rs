//! Remote inference and storage service.
//!
//! Every stage of both workflows is one call through [`InferenceClient`].
//! The HTTP implementation lives in [`http`]; tests substitute an in-memory
//! client.

pub mod http;

use async_trait::async_trait;
use base64::Engine as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use stage_engine::{BoxError, CancellationToken};
use std::future::Future;
use std::path::Path;

use crate::{Error, Result};

pub use http::HttpInferenceClient;

/// Encoded image bytes plus their MIME type. Serialized with base64 data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageData {
    pub mime_type: String,
    #[serde(serialize_with = "encode_base64", deserialize_with = "decode_base64")]
    pub data: Vec<u8>,
}

impl ImageData {
    pub fn new(mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data,
        }
    }

    /// Read an image file, inferring the MIME type from its extension.
    pub async fn from_file(path: &Path) -> Result<Self> {
        let mime_type = mime_for_path(path).ok_or_else(|| {
            Error::validation(format!("Unsupported image type: {}", path.display()))
        })?;
        let data = tokio::fs::read(path).await?;
        Ok(Self::new(mime_type, data))
    }

    /// File extension matching the MIME type.
    pub fn extension(&self) -> &'static str {
        match self.mime_type.as_str() {
            "image/png" => "png",
            "image/webp" => "webp",
            _ => "jpg",
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

fn mime_for_path(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}

fn encode_base64<S: Serializer>(data: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(data))
}

fn decode_base64<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<u8>, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    base64::engine::general_purpose::STANDARD
        .decode(encoded.as_bytes())
        .map_err(serde::de::Error::custom)
}

/// Describe a base image against a reference and free-form constraints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzeRequest {
    pub base_image: ImageData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_image: Option<ImageData>,
    pub constraints: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzeResponse {
    pub description: String,
}

/// Render an image from a prompt, optionally anchored on a base image and
/// style references.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_image: Option<ImageData>,
    #[serde(default)]
    pub references: Vec<ImageData>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub image: ImageData,
}

/// Produce a thumbnail bounded by `size` pixels at the given JPEG quality.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressRequest {
    pub image: ImageData,
    pub size: u32,
    pub quality: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressResponse {
    pub thumbnail: ImageData,
}

/// Persist a description and thumbnail as a template record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveRequest {
    pub name: String,
    pub description: String,
    pub thumbnail: ImageData,
}

/// A record stored by the remote service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
}

/// Calls made by the ingestion and generation stages.
#[async_trait]
pub trait InferenceClient: Send + Sync {
    async fn analyze(&self, request: &AnalyzeRequest) -> Result<String>;

    async fn generate(&self, request: &GenerateRequest) -> Result<ImageData>;

    async fn compress(&self, request: &CompressRequest) -> Result<ImageData>;

    async fn save(&self, request: &SaveRequest) -> Result<SavedRecord>;
}

/// Run a client call, abandoning it if `token` is cancelled first.
pub(crate) async fn cancellable<T, F>(
    token: &CancellationToken,
    call: F,
) -> std::result::Result<T, BoxError>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        _ = token.cancelled() => Err(Error::Cancelled.into()),
        result = call => result.map_err(BoxError::from),
    }
}
