//! Inference engine implementations
//!
//! Each engine is a cheap factory; models are only loaded when the model
//! cache first asks for a language. Engines are conditionally compiled
//! based on feature flags.

#[cfg(feature = "engine-ocrs")]
pub mod ocrs;

#[cfg(feature = "engine-leptess")]
pub mod leptess;

use crate::config::Config;
use crate::engine::InferenceEngine;
use crate::error::OcrError;
use serde::Serialize;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Directory under the user cache dir holding downloaded models
const CACHE_DIR_NAME: &str = "adaptive-ocr";

/// Information about an available engine
#[derive(Debug, Clone, Serialize)]
pub struct EngineInfo {
    pub name: &'static str,
    pub description: &'static str,
    pub version: &'static str,
    pub supported_languages: Vec<String>,
}

/// Registry of available inference engines
pub struct EngineRegistry {
    engines: Vec<Arc<dyn InferenceEngine>>,
    default_engine: String,
}

impl EngineRegistry {
    /// Create a registry holding every compiled-in engine
    #[allow(unused_variables)]
    pub fn new(config: &Config) -> Result<Self, OcrError> {
        #[allow(unused_mut)]
        let mut engines: Vec<Arc<dyn InferenceEngine>> = Vec::new();

        #[cfg(feature = "engine-ocrs")]
        engines.push(Arc::new(ocrs::OcrsEngine::new()));

        #[cfg(feature = "engine-leptess")]
        engines.push(Arc::new(leptess::LeptessEngine::new(config)));

        Self::from_engines(engines)
    }

    /// Build from explicit engines; the first one is the default
    pub fn from_engines(engines: Vec<Arc<dyn InferenceEngine>>) -> Result<Self, OcrError> {
        let default_engine = engines
            .first()
            .map(|e| e.name().to_string())
            .ok_or_else(|| {
                OcrError::Internal(
                    "No OCR engines available. Build with --features engine-ocrs or --features engine-leptess".to_string(),
                )
            })?;

        Ok(Self {
            engines,
            default_engine,
        })
    }

    /// Get an engine by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn InferenceEngine>> {
        self.engines.iter().find(|e| e.name() == name).cloned()
    }

    /// Get the default engine
    pub fn default(&self) -> Option<Arc<dyn InferenceEngine>> {
        self.get(&self.default_engine)
    }

    /// The named engine, or the default when `name` is `None`
    pub fn select(&self, name: Option<&str>) -> Result<Arc<dyn InferenceEngine>, OcrError> {
        let name = name.unwrap_or(&self.default_engine);
        self.get(name).ok_or_else(|| {
            OcrError::InvalidRequest(format!(
                "Unknown engine '{}'. Available: {}",
                name,
                self.list().join(", ")
            ))
        })
    }

    /// Get the default engine name
    pub fn default_name(&self) -> &str {
        &self.default_engine
    }

    /// List all available engine names
    pub fn list(&self) -> Vec<&str> {
        self.engines.iter().map(|e| e.name()).collect()
    }

    /// Get info about all available engines
    pub fn info(&self) -> Vec<EngineInfo> {
        self.engines
            .iter()
            .map(|e| EngineInfo {
                name: e.name(),
                description: e.description(),
                version: e.version(),
                supported_languages: e.supported_languages(),
            })
            .collect()
    }
}

/// Return the cached copy of `url` under `relative`, downloading it first
/// if needed
#[allow(dead_code)]
pub(crate) fn fetch_cached(url: &str, relative: &Path) -> anyhow::Result<PathBuf> {
    let target = cache_dir().join(relative);
    if target.exists() {
        tracing::info!("Using cached model from {:?}", target);
        return Ok(target);
    }

    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| anyhow::anyhow!("Failed to create cache directory: {}", e))?;
    }

    tracing::info!("Downloading {} (this may take a moment)...", url);
    let response = ureq::get(url)
        .call()
        .map_err(|e| anyhow::anyhow!("Failed to download {}: {}", url, e))?;
    let buffer = response
        .into_body()
        .read_to_vec()
        .map_err(|e| anyhow::anyhow!("Failed to read response body: {}", e))?;

    // Write next to the target first so a failed download never looks cached.
    let partial = target.with_extension("partial");
    let mut file = File::create(&partial)
        .map_err(|e| anyhow::anyhow!("Failed to create model file: {}", e))?;
    file.write_all(&buffer)
        .map_err(|e| anyhow::anyhow!("Failed to write model file: {}", e))?;
    std::fs::rename(&partial, &target)
        .map_err(|e| anyhow::anyhow!("Failed to move model into place: {}", e))?;

    tracing::info!("Downloaded {} to {:?}", url, target);
    Ok(target)
}

pub(crate) fn cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(CACHE_DIR_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineOptions, ModelHandle};

    struct NamedEngine(&'static str);

    impl InferenceEngine for NamedEngine {
        fn name(&self) -> &'static str {
            self.0
        }

        fn description(&self) -> &'static str {
            "named"
        }

        fn version(&self) -> &'static str {
            "0"
        }

        fn constructor_signature(&self) -> anyhow::Result<Vec<String>> {
            Ok(Vec::new())
        }

        fn construct(&self, _options: &EngineOptions) -> anyhow::Result<Arc<dyn ModelHandle>> {
            anyhow::bail!("not loadable")
        }

        fn supported_languages(&self) -> Vec<String> {
            Vec::new()
        }
    }

    #[test]
    fn test_first_engine_is_default() {
        let registry = EngineRegistry::from_engines(vec![
            Arc::new(NamedEngine("alpha")),
            Arc::new(NamedEngine("beta")),
        ])
        .unwrap();

        assert_eq!(registry.default_name(), "alpha");
        assert_eq!(registry.list(), vec!["alpha", "beta"]);
        assert_eq!(registry.select(None).unwrap().name(), "alpha");
        assert_eq!(registry.select(Some("beta")).unwrap().name(), "beta");
        assert!(matches!(
            registry.select(Some("gamma")),
            Err(OcrError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_empty_registry_is_an_error() {
        assert!(EngineRegistry::from_engines(Vec::new()).is_err());
    }
}
