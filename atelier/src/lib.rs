//! Template ingestion and image generation for the atelier
//! design-visualization service.
//!
//! Both workflows drive a remote inference API through the bounded
//! [`stage_engine`] scheduler:
//! - [`ingest::IngestionPipeline`]: up to 70 items, four stages each,
//!   six in flight, continuous refill
//! - [`generate::GenerationBatcher`]: single-stage requests run in waves
//!   of nine

pub mod cli;
pub mod config;
pub mod error;
pub mod generate;
pub mod inference;
pub mod ingest;
pub mod logging;

#[cfg(test)]
mod test_utils;

pub use error::{Error, Result};
