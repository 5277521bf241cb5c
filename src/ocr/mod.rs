//! Version-adaptive OCR core.
//!
//! [`OcrProcessor`] acquires a per-language model from the [`ModelCache`],
//! drives it through the invocation [`Cascade`] and [`normalize`]s whatever
//! the engine returned. Callers only see ordered text lines or an
//! [`OcrError`].

pub mod cache;
pub mod cascade;
pub mod normalize;
pub mod probe;

pub use cache::{CachedModel, LanguageKey, ModelCache};
pub use cascade::{default_configs, Cascade, CascadeSuccess, InvocationConfig, PlannedAttempt};
pub use normalize::{classify, normalize, ResultShape};
pub use probe::{probe, AcceptedParameterSet};

use crate::engine::{EngineOptions, InferenceEngine};
use crate::error::OcrError;
use image::DynamicImage;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One decoded page, optionally remembering the file it was read from
#[derive(Debug, Clone)]
pub struct Page {
    pub image: DynamicImage,
    source_path: Option<PathBuf>,
}

impl Page {
    pub fn new(image: DynamicImage) -> Self {
        Self {
            image,
            source_path: None,
        }
    }

    /// A page whose pixels also exist on disk, enabling path-mode calls
    pub fn from_file(image: DynamicImage, path: impl Into<PathBuf>) -> Self {
        Self {
            image,
            source_path: Some(path.into()),
        }
    }

    pub fn source_path(&self) -> Option<&Path> {
        self.source_path.as_deref()
    }
}

/// Document-level OCR output
#[derive(Debug, Clone, PartialEq)]
pub struct OcrOutput {
    pub lines: Vec<String>,
    /// `lines` joined with newlines
    pub text: String,
}

impl OcrOutput {
    pub fn from_lines(lines: Vec<String>) -> Self {
        let text = lines.join("\n");
        Self { lines, text }
    }
}

/// Composes cache, cascade and normalizer per page
pub struct OcrProcessor {
    cache: ModelCache,
    cascade: Cascade,
    default_language: LanguageKey,
}

impl OcrProcessor {
    pub fn new(
        engine: Arc<dyn InferenceEngine>,
        candidate_params: EngineOptions,
        default_language: LanguageKey,
    ) -> Self {
        Self::with_cascade(
            ModelCache::new(engine, candidate_params),
            Cascade::default(),
            default_language,
        )
    }

    pub fn with_cascade(cache: ModelCache, cascade: Cascade, default_language: LanguageKey) -> Self {
        Self {
            cache,
            cascade,
            default_language,
        }
    }

    pub fn engine(&self) -> &Arc<dyn InferenceEngine> {
        self.cache.engine()
    }

    pub fn cache(&self) -> &ModelCache {
        &self.cache
    }

    pub fn default_language(&self) -> &LanguageKey {
        &self.default_language
    }

    /// Resolve a request's optional language against the default
    pub fn language_for(&self, requested: Option<&str>) -> LanguageKey {
        LanguageKey::resolve(requested, &self.default_language)
    }

    /// OCR `pages` in order and collect their lines.
    ///
    /// Fails with [`OcrError::NoTextProduced`] when nothing was recognized,
    /// including when `pages` is empty (the cache is not touched then).
    pub fn run_ocr(&self, pages: &[Page], language: &LanguageKey) -> Result<OcrOutput, OcrError> {
        if pages.is_empty() {
            return Err(OcrError::NoTextProduced);
        }

        let mut lines = Vec::new();
        for (index, page) in pages.iter().enumerate() {
            let page_number = index + 1;
            let model = self.cache.acquire(language)?;
            let success = self.cascade.run(&model, page, page_number)?;
            let page_lines = normalize(&success.raw);

            tracing::info!(
                "Page {} of {}: {} lines via '{}' ({} mode)",
                page_number,
                pages.len(),
                page_lines.len(),
                success.label,
                success.mode
            );
            lines.extend(page_lines);
        }

        if lines.is_empty() {
            return Err(OcrError::NoTextProduced);
        }

        Ok(OcrOutput::from_lines(lines))
    }
}
