pub mod config;
pub mod error;
pub mod ingestion;
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod tracking;
pub mod utils;

// 機械学習機能のモジュール
#[cfg(feature = "ml")]
pub mod ml;

pub use error::{PipelineError, Result};
