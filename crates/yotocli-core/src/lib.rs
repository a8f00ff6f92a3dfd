//! YotoCLI Core Library
//!
//! This crate provides the engine behind the `yoto` command-line tool:
//! - Resolving cards, chapters and players from loose user queries
//! - Editing playlists while keeping keys, labels and totals consistent
//! - Uploading audio through the remote transcoder, one file or a batch
//! - Device-code login and token refresh
//! - Player control (play, stop, pause, volume)

pub mod auth;
pub mod batch;
pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod gateway;
pub mod library;
pub mod model;
pub mod playlist;
pub mod processing;
pub mod resolver;
pub mod upload;

// In-memory doubles for tests (only available with the test-utils feature)
#[cfg(any(test, feature = "test-utils"))]
pub mod test_support;

pub use auth::DeviceAuthFlow;
pub use batch::{BATCH_CONCURRENCY, BatchIngestor};
pub use client::HttpGateway;
pub use config::{AppConfig, ConfigManager};
pub use error::{EntityKind, Error, Result};
pub use gateway::LibraryGateway;
pub use library::{EditRequest, Library};
pub use model::{Card, Chapter, Device, DeviceStatus, Track};
pub use processing::{FfmpegNormalizer, YtDlpDownloader};
pub use upload::{PipelineStage, Progress, UploadPipeline};
