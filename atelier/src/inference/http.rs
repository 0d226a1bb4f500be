//! reqwest-backed [`InferenceClient`].

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, warn};

use super::{
    AnalyzeRequest, AnalyzeResponse, CompressRequest, CompressResponse, GenerateRequest,
    GenerateResponse, ImageData, InferenceClient, SaveRequest, SavedRecord,
};
use crate::config::ApiConfig;
use crate::{Error, Result};

pub const ANALYZE_PATH: &str = "/v1/analyze";
pub const GENERATE_PATH: &str = "/v1/generate";
pub const COMPRESS_PATH: &str = "/v1/compress";
pub const RECORDS_PATH: &str = "/v1/records";

/// Longest error body kept in [`Error::Api`].
const MAX_ERROR_BODY: usize = 2048;

pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// JSON-over-HTTP client with bearer token authentication.
#[derive(Debug, Clone)]
pub struct HttpInferenceClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpInferenceClient {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        install_rustls_provider();

        let mut builder = reqwest::Client::builder()
            .user_agent(concat!("atelier/", env!("CARGO_PKG_VERSION")));
        if config.request_timeout > Duration::ZERO {
            builder = builder.timeout(config.request_timeout);
        }

        Ok(Self {
            client: builder.build()?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post<Req, Resp>(&self, path: &str, body: &Req) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, "POST");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            if body.len() > MAX_ERROR_BODY {
                let cut = (0..=MAX_ERROR_BODY)
                    .rev()
                    .find(|i| body.is_char_boundary(*i))
                    .unwrap_or(0);
                body.truncate(cut);
            }
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                warn!(url = %url, status = status.as_u16(), "Inference API rejected credentials");
            }
            return Err(Error::Api {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl InferenceClient for HttpInferenceClient {
    async fn analyze(&self, request: &AnalyzeRequest) -> Result<String> {
        let response: AnalyzeResponse = self.post(ANALYZE_PATH, request).await?;
        Ok(response.description)
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<ImageData> {
        let response: GenerateResponse = self.post(GENERATE_PATH, request).await?;
        Ok(response.image)
    }

    async fn compress(&self, request: &CompressRequest) -> Result<ImageData> {
        let response: CompressResponse = self.post(COMPRESS_PATH, request).await?;
        Ok(response.thumbnail)
    }

    async fn save(&self, request: &SaveRequest) -> Result<SavedRecord> {
        self.post(RECORDS_PATH, request).await
    }
}
