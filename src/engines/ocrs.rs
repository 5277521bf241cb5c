//! OCRS engine implementation
//!
//! Pure Rust OCR engine using the ocrs library. No system dependencies required.
//! Downloads neural network models automatically on first construction.
//!
//! Results use the nested-detection layout: one list per page of
//! `[quad, [text, score]]` items.

use super::fetch_cached;
use crate::engine::{
    bool_option, EngineOptions, InferenceEngine, InvocationInput, ModelHandle, RawInvocationResult,
};
use crate::preprocess;
use anyhow::anyhow;
use ocrs::{DecodeMethod, ImageSource, OcrEngine as OcrsOcrEngine, OcrEngineParams, TextItem};
use rten::Model;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;

/// Default model URLs from the ocrs project
const DETECTION_MODEL_URL: &str =
    "https://ocrs-models.s3-accelerate.amazonaws.com/text-detection.rten";
const RECOGNITION_MODEL_URL: &str =
    "https://ocrs-models.s3-accelerate.amazonaws.com/text-recognition.rten";

/// Language codes the bundled recognition model covers
const LATIN_LANGUAGES: &[&str] = &["en", "eng", "latin"];

const CONSTRUCTOR_PARAMS: &[&str] = &["self", "lang"];
const INVOCATION_PARAMS: &[&str] = &[
    "self",
    "det",
    "rec",
    "use_doc_preprocessor",
    "use_doc_orientation_classify",
];

/// Factory for ocrs-backed models
#[derive(Debug, Default)]
pub struct OcrsEngine;

impl OcrsEngine {
    pub fn new() -> Self {
        Self
    }
}

impl InferenceEngine for OcrsEngine {
    fn name(&self) -> &'static str {
        "ocrs"
    }

    fn description(&self) -> &'static str {
        "Pure Rust OCR engine - fast, no system dependencies required"
    }

    fn version(&self) -> &'static str {
        "0.9"
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
        if !LATIN_LANGUAGES.contains(&language.as_str()) {
            return Err(anyhow!(
                "ocrs has no recognition model for language '{}'",
                language
            ));
        }

        let detection_model_path =
            fetch_cached(DETECTION_MODEL_URL, Path::new("text-detection.rten"))?;
        let recognition_model_path =
            fetch_cached(RECOGNITION_MODEL_URL, Path::new("text-recognition.rten"))?;

        let detection_model = Model::load_file(&detection_model_path)
            .map_err(|e| anyhow!("Failed to load detection model: {}", e))?;
        let recognition_model = Model::load_file(&recognition_model_path)
            .map_err(|e| anyhow!("Failed to load recognition model: {}", e))?;

        let engine = OcrsOcrEngine::new(OcrEngineParams {
            detection_model: Some(detection_model),
            recognition_model: Some(recognition_model),
            decode_method: DecodeMethod::Greedy,
            ..Default::default()
        })
        .map_err(|e| anyhow!("Failed to create OCR engine: {}", e))?;

        Ok(Arc::new(OcrsModel { engine, language }))
    }

    fn supported_languages(&self) -> Vec<String> {
        // ocrs currently only supports English/Latin alphabet
        LATIN_LANGUAGES.iter().map(|l| l.to_string()).collect()
    }
}

/// A loaded ocrs detection + recognition pair
struct OcrsModel {
    engine: OcrsOcrEngine,
    language: String,
}

impl ModelHandle for OcrsModel {
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
        if !bool_option(options, "det", true) || !bool_option(options, "rec", true) {
            return Err(anyhow!("ocrs cannot skip detection or recognition"));
        }

        let page = preprocess::prepare(&input.load()?, options);

        // Convert to RGB8 (HWC format, which is what ImageSource::from_bytes expects)
        let rgb_img = page.into_rgb8();
        let dimensions = rgb_img.dimensions();
        let img_source = ImageSource::from_bytes(rgb_img.as_raw(), dimensions)
            .map_err(|e| anyhow!("Failed to create image source: {}", e))?;

        let ocr_input = self
            .engine
            .prepare_input(img_source)
            .map_err(|e| anyhow!("Failed to prepare input: {}", e))?;
        let word_rects = self
            .engine
            .detect_words(&ocr_input)
            .map_err(|e| anyhow!("Failed to detect words: {}", e))?;
        let line_rects = self.engine.find_text_lines(&ocr_input, &word_rects);
        let line_texts = self
            .engine
            .recognize_text(&ocr_input, &line_rects)
            .map_err(|e| anyhow!("Failed to recognize text: {}", e))?;

        let items: Vec<Value> = line_texts
            .iter()
            .flatten()
            .map(|line| {
                let text = line
                    .words()
                    .map(|word| word.to_string())
                    .collect::<Vec<_>>()
                    .join(" ");
                let rect = line.bounding_rect();
                let quad = json!([
                    [rect.left(), rect.top()],
                    [rect.right(), rect.top()],
                    [rect.right(), rect.bottom()],
                    [rect.left(), rect.bottom()]
                ]);
                let score = text_quality(&text);
                json!([quad, [text, score]])
            })
            .collect();

        Ok(json!([items]))
    }
}

/// Text-quality score in `0.0..=1.0`.
///
/// ocrs reports no per-line confidence, so this scores how much the text
/// looks like real words: letter share, stray symbols and long runs of one
/// character.
fn text_quality(text: &str) -> f32 {
    let total = text.chars().count();
    if total == 0 {
        return 0.0;
    }
    if total < 5 {
        return 0.5;
    }

    let letters = text.chars().filter(|c| c.is_alphanumeric()).count();
    let symbols = text
        .chars()
        .filter(|c| !c.is_alphanumeric() && !c.is_whitespace() && !c.is_ascii_punctuation())
        .count();

    let letter_score = (letters as f32 / total as f32 * 1.5).min(1.0);
    let symbol_score = 1.0 - (symbols as f32 / total as f32 * 10.0).min(1.0);
    let run_score = match longest_run(text) {
        0..=3 => 1.0,
        4..=5 => 0.8,
        6..=10 => 0.5,
        _ => 0.2,
    };

    (0.4 * letter_score + 0.4 * symbol_score + 0.2 * run_score).clamp(0.0, 1.0)
}

/// Longest run of one repeated non-whitespace character
fn longest_run(text: &str) -> usize {
    let mut longest = 0;
    let mut current = 0;
    let mut prev = None;
    for c in text.chars() {
        if c.is_whitespace() {
            current = 0;
        } else if Some(c) == prev {
            current += 1;
        } else {
            current = 1;
        }
        longest = longest.max(current);
        prev = Some(c);
    }
    longest
}
