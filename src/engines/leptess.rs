//! Leptess/Tesseract engine implementation
//!
//! Tesseract-based OCR engine. Better for noisy/messy images like phone photos.
//! Uses tesseract-static crate for static linking (no system dependencies).
//! Downloads tessdata (training data) automatically on first construction.
//!
//! Results use the tabular-record layout: a single `rec_texts`/`rec_scores`
//! record per page.

use super::{cache_dir, fetch_cached};
use crate::config::Config;
use crate::engine::{
    EngineOptions, InferenceEngine, InvocationInput, ModelHandle, RawInvocationResult,
};
use crate::preprocess;
use anyhow::anyhow;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tesseract_static::tesseract::Tesseract;

const CONSTRUCTOR_PARAMS: &[&str] = &["self", "lang"];
const INVOCATION_PARAMS: &[&str] = &[
    "self",
    "use_doc_preprocessor",
    "use_doc_orientation_classify",
];

/// Tesseract model factory
pub struct LeptessEngine {
    /// Tessdata directory given on the command line, if any
    tessdata_override: Option<PathBuf>,
}

impl LeptessEngine {
    pub fn new(config: &Config) -> Self {
        Self {
            tessdata_override: config.tessdata_path.as_ref().map(PathBuf::from),
        }
    }

    /// Directory holding `<code>.traineddata`, downloading it if needed
    fn tessdata_dir(&self, code: &str) -> anyhow::Result<PathBuf> {
        if let Some(dir) = &self.tessdata_override {
            return Ok(dir.clone());
        }

        let file_name = format!("{}.traineddata", code);
        // Use tessdata_fast for smaller, faster downloads
        let url = format!(
            "https://github.com/tesseract-ocr/tessdata_fast/raw/main/{}",
            file_name
        );
        fetch_cached(&url, &Path::new("tessdata").join(&file_name))?;
        Ok(cache_dir().join("tessdata"))
    }
}

impl InferenceEngine for LeptessEngine {
    fn name(&self) -> &'static str {
        "leptess"
    }

    fn description(&self) -> &'static str {
        "Tesseract OCR engine - better for noisy/messy images like phone photos"
    }

    fn version(&self) -> &'static str {
        "5"
    }

    fn constructor_signature(&self) -> anyhow::Result<Vec<String>> {
        Ok(CONSTRUCTOR_PARAMS.iter().map(|p| p.to_string()).collect())
    }

    fn construct(&self, options: &EngineOptions) -> anyhow::Result<Arc<dyn ModelHandle>> {
        let language = options
            .get("lang")
            .and_then(|v| v.as_text())
            .unwrap_or("eng")
            .to_string();
        let code = tesseract_code(&language);

        let dir = self.tessdata_dir(code)?;
        let tessdata_path = dir
            .to_str()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow!("Invalid tessdata path: {:?}", dir))?;

        // Validate that tessdata is accessible by doing a test initialization
        Tesseract::new(Some(&tessdata_path), Some(code))
            .map_err(|e| anyhow!("Failed to initialize Tesseract: {}", e))?;

        tracing::info!(
            "Tesseract model ready (tessdata: {}, language: {})",
            tessdata_path,
            code
        );

        Ok(Arc::new(TesseractModel {
            tessdata_path,
            code: code.to_string(),
            language,
        }))
    }

    fn supported_languages(&self) -> Vec<String> {
        // Tesseract supports many languages - return common ones
        [
            "eng", "deu", "fra", "spa", "ita", "por", "nld", "jpn", "chi_sim", "chi_tra", "kor",
            "ara", "rus",
        ]
        .iter()
        .map(|l| l.to_string())
        .collect()
    }
}

/// Map short language codes onto tessdata file names
fn tesseract_code(language: &str) -> &str {
    match language {
        "en" => "eng",
        "de" | "german" => "deu",
        "fr" | "french" => "fra",
        "es" => "spa",
        "it" => "ita",
        "pt" => "por",
        "nl" => "nld",
        "ja" | "japan" => "jpn",
        "ch" | "zh" => "chi_sim",
        "chinese_cht" => "chi_tra",
        "ko" | "korean" => "kor",
        "ar" | "arabic" => "ara",
        "ru" => "rus",
        other => other,
    }
}

/// Tesseract instances are not shareable, so the handle keeps what it
/// needs to open a fresh one per call.
struct TesseractModel {
    tessdata_path: String,
    code: String,
    language: String,
}

impl ModelHandle for TesseractModel {
    fn language(&self) -> &str {
        &self.language
    }

    fn invocation_signature(&self) -> anyhow::Result<Vec<String>> {
        Ok(INVOCATION_PARAMS.iter().map(|p| p.to_string()).collect())
    }

    fn supports_path_input(&self) -> bool {
        true
    }

    fn invoke(
        &self,
        input: InvocationInput<'_>,
        options: &EngineOptions,
    ) -> anyhow::Result<RawInvocationResult> {
        let page = preprocess::prepare(&input.load()?, options);

        // Convert to BMP in memory (BMP is always supported by leptonica)
        let rgb_img = page.to_rgb8();
        let (width, height) = rgb_img.dimensions();
        let mut bmp_data = Vec::new();
        rgb_img
            .write_to(&mut std::io::Cursor::new(&mut bmp_data), image::ImageFormat::Bmp)
            .map_err(|e| anyhow!("Failed to convert to BMP: {}", e))?;

        tracing::debug!(
            "Processing image: {}x{}, BMP size: {} bytes",
            width,
            height,
            bmp_data.len()
        );

        let mut tess = Tesseract::new(Some(&self.tessdata_path), Some(&self.code))
            .map_err(|e| anyhow!("Failed to create Tesseract: {}", e))?
            .set_image_from_mem(&bmp_data)
            .map_err(|e| anyhow!("Failed to set image ({}x{}): {}", width, height, e))?
            .recognize()
            .map_err(|e| anyhow!("Failed to recognize text: {}", e))?;

        let text = tess
            .get_text()
            .map_err(|e| anyhow!("Failed to get text: {}", e))?;
        // 0-100 scale
        let confidence = tess.mean_text_conf() as f64 / 100.0;

        let texts: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
        let scores = vec![confidence; texts.len()];

        Ok(json!([{ "rec_texts": texts, "rec_scores": scores }]))
    }
}
