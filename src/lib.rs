//! OCR service that drives versioned inference engines defensively.
//!
//! The [`ocr`] module holds the version-adaptive core; [`engines`] holds
//! concrete backends and [`server`] the HTTP surface.

pub mod config;
pub mod document;
pub mod engine;
pub mod engines;
pub mod error;
pub mod ocr;
pub mod preprocess;
pub mod server;

pub use engine::{EngineOptions, InferenceEngine, InvocationInput, ModelHandle, OptionValue};
pub use error::{AttemptFailure, OcrError};
pub use ocr::{LanguageKey, OcrOutput, OcrProcessor, Page};
