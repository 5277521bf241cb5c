//! Drive a model through increasingly conservative call shapes until one works.

use super::cache::CachedModel;
use super::probe::{panic_message, AcceptedParameterSet};
use super::Page;
use crate::engine::{
    describe_options, EngineOptions, InvocationInput, OptionValue, RawInvocationResult,
};
use crate::error::{AttemptFailure, OcrError};
use std::panic::{self, AssertUnwindSafe};

/// One candidate call shape
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationConfig {
    pub label: &'static str,
    pub options: EngineOptions,
}

impl InvocationConfig {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            options: EngineOptions::new(),
        }
    }

    pub fn with(mut self, name: &str, value: impl Into<OptionValue>) -> Self {
        self.options.insert(name.to_string(), value.into());
        self
    }
}

/// Candidates ranked from richest feature set to most conservative
pub fn default_configs() -> Vec<InvocationConfig> {
    vec![
        InvocationConfig::new("default"),
        InvocationConfig::new("det-rec")
            .with("det", true)
            .with("rec", true),
        InvocationConfig::new("no-doc-preprocessor").with("use_doc_preprocessor", false),
        InvocationConfig::new("no-doc-orientation").with("use_doc_orientation_classify", false),
        InvocationConfig::new("no-doc-unwarping").with("use_doc_unwarping", false),
        InvocationConfig::new("no-doc-steps")
            .with("use_doc_orientation_classify", false)
            .with("use_doc_unwarping", false)
            .with("use_textline_orientation", false),
        InvocationConfig::new("no-angle-cls")
            .with("cls", false)
            .with("use_angle_cls", false)
            .with("use_textline_orientation", false),
    ]
}

/// A candidate after filtering through what the handle accepts
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedAttempt {
    pub label: String,
    pub options: EngineOptions,
}

/// The first invocation that did not fail
#[derive(Debug, Clone)]
pub struct CascadeSuccess {
    pub raw: RawInvocationResult,
    pub label: String,
    pub options: EngineOptions,
    pub mode: &'static str,
    /// Failures recorded before this attempt succeeded
    pub failed: Vec<AttemptFailure>,
}

pub struct Cascade {
    configs: Vec<InvocationConfig>,
}

impl Default for Cascade {
    fn default() -> Self {
        Self::new(default_configs())
    }
}

impl Cascade {
    pub fn new(configs: Vec<InvocationConfig>) -> Self {
        Self { configs }
    }

    pub fn configs(&self) -> &[InvocationConfig] {
        &self.configs
    }

    /// Filter every candidate through `accepted`, keeping order.
    ///
    /// With an empty accepted set every attempt is the bare call.
    pub fn plan(&self, accepted: &AcceptedParameterSet) -> Vec<PlannedAttempt> {
        self.configs
            .iter()
            .map(|config| PlannedAttempt {
                label: config.label.to_string(),
                options: accepted.filter(&config.options),
            })
            .collect()
    }

    /// Run the cascade for one page, stopping at the first non-failing call.
    ///
    /// Array mode is tried for every candidate. When the page came from a
    /// file and the handle takes paths, one last path-mode call is made
    /// with the most conservative options.
    pub fn run(
        &self,
        model: &CachedModel,
        page: &Page,
        page_number: usize,
    ) -> Result<CascadeSuccess, OcrError> {
        let mut plan: Vec<(PlannedAttempt, InvocationInput<'_>)> = self
            .plan(&model.accepted)
            .into_iter()
            .map(|attempt| (attempt, InvocationInput::Image(&page.image)))
            .collect();

        if let Some(path) = page.source_path() {
            if model.handle.supports_path_input() {
                let options = plan
                    .last()
                    .map(|(attempt, _)| attempt.options.clone())
                    .unwrap_or_default();
                plan.push((
                    PlannedAttempt {
                        label: "path".to_string(),
                        options,
                    },
                    InvocationInput::Path(path),
                ));
            }
        }

        let mut failed = Vec::new();
        for (attempt, input) in plan {
            match guarded_invoke(model, input, &attempt.options) {
                Ok(raw) => {
                    tracing::debug!(
                        "Page {} recognized with '{}' {} ({} mode) after {} failed attempts",
                        page_number,
                        attempt.label,
                        describe_options(&attempt.options),
                        input.mode(),
                        failed.len()
                    );
                    return Ok(CascadeSuccess {
                        raw,
                        label: attempt.label,
                        options: attempt.options,
                        mode: input.mode(),
                        failed,
                    });
                }
                Err(reason) => {
                    tracing::warn!(
                        "Page {} attempt '{}' {} ({} mode) failed: {}",
                        page_number,
                        attempt.label,
                        describe_options(&attempt.options),
                        input.mode(),
                        reason
                    );
                    failed.push(AttemptFailure {
                        label: attempt.label,
                        options: attempt.options,
                        reason,
                    });
                }
            }
        }

        Err(OcrError::InvocationExhausted {
            language: model.language.to_string(),
            page: page_number,
            attempts: failed,
        })
    }
}

fn guarded_invoke(
    model: &CachedModel,
    input: InvocationInput<'_>,
    options: &EngineOptions,
) -> Result<RawInvocationResult, String> {
    match panic::catch_unwind(AssertUnwindSafe(|| model.handle.invoke(input, options))) {
        Ok(Ok(raw)) => Ok(raw),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(payload) => Err(format!(
            "engine panicked: {}",
            panic_message(payload.as_ref())
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ModelHandle;
    use crate::ocr::cache::LanguageKey;
    use image::DynamicImage;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    /// Succeeds only for option sets containing `succeed_on`
    struct ScriptedHandle {
        signature: Vec<&'static str>,
        succeed_on: Option<&'static str>,
        path_input: bool,
        seen: Mutex<Vec<(&'static str, EngineOptions)>>,
    }

    impl ScriptedHandle {
        fn new(signature: Vec<&'static str>, succeed_on: Option<&'static str>) -> Self {
            Self {
                signature,
                succeed_on,
                path_input: false,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl ModelHandle for ScriptedHandle {
        fn language(&self) -> &str {
            "en"
        }

        fn invocation_signature(&self) -> anyhow::Result<Vec<String>> {
            Ok(self.signature.iter().map(|s| s.to_string()).collect())
        }

        fn supports_path_input(&self) -> bool {
            self.path_input
        }

        fn invoke(
            &self,
            input: InvocationInput<'_>,
            options: &EngineOptions,
        ) -> anyhow::Result<RawInvocationResult> {
            self.seen
                .lock()
                .unwrap()
                .push((input.mode(), options.clone()));
            if matches!(input, InvocationInput::Path(_)) && self.path_input {
                return Ok(json!([]));
            }
            match self.succeed_on {
                Some(name) if options.contains_key(name) => Ok(json!([{"rec_texts": ["ok"]}])),
                _ if options.len() > 2 => panic!("segfault in fused kernel"),
                _ => anyhow::bail!("Unknown argument"),
            }
        }
    }

    fn model(handle: Arc<ScriptedHandle>, accepted: AcceptedParameterSet) -> CachedModel {
        CachedModel {
            language: LanguageKey::new("en").unwrap(),
            handle,
            accepted,
        }
    }

    fn blank_page() -> Page {
        Page::new(DynamicImage::new_rgb8(4, 4))
    }

    #[test]
    fn test_default_order_starts_bare_and_degrades() {
        let labels: Vec<&str> = default_configs().iter().map(|c| c.label).collect();
        assert_eq!(
            labels,
            vec![
                "default",
                "det-rec",
                "no-doc-preprocessor",
                "no-doc-orientation",
                "no-doc-unwarping",
                "no-doc-steps",
                "no-angle-cls",
            ]
        );
        assert!(default_configs()[0].options.is_empty());
    }

    #[test]
    fn test_empty_accepted_set_plans_only_bare_calls() {
        let plan = Cascade::default().plan(&AcceptedParameterSet::empty());
        assert_eq!(plan.len(), default_configs().len());
        assert!(plan.iter().all(|attempt| attempt.options.is_empty()));
        assert_eq!(plan.last().unwrap().label, "no-angle-cls");
    }

    #[test]
    fn test_plan_filters_each_candidate() {
        let accepted = AcceptedParameterSet::new(["use_doc_unwarping", "use_textline_orientation"]);
        let plan = Cascade::default().plan(&accepted);

        let steps = plan.iter().find(|a| a.label == "no-doc-steps").unwrap();
        assert_eq!(
            steps.options.keys().map(String::as_str).collect::<Vec<_>>(),
            vec!["use_doc_unwarping", "use_textline_orientation"]
        );
        let det_rec = plan.iter().find(|a| a.label == "det-rec").unwrap();
        assert!(det_rec.options.is_empty());
    }

    #[test]
    fn test_stops_at_first_success() {
        let handle = Arc::new(ScriptedHandle::new(
            vec!["self", "use_doc_orientation_classify", "use_doc_preprocessor"],
            Some("use_doc_orientation_classify"),
        ));
        let model = model(handle.clone(), AcceptedParameterSet::new(handle.signature.clone()));

        let success = Cascade::default().run(&model, &blank_page(), 1).unwrap();

        assert_eq!(success.label, "no-doc-orientation");
        assert_eq!(success.mode, "array");
        assert_eq!(success.failed.len(), 3);
        assert_eq!(success.raw, json!([{"rec_texts": ["ok"]}]));
        assert_eq!(handle.seen.lock().unwrap().len(), 4);
    }

    #[test]
    fn test_empty_result_still_ends_cascade() {
        struct EmptyHandle;
        impl ModelHandle for EmptyHandle {
            fn language(&self) -> &str {
                "en"
            }
            fn invocation_signature(&self) -> anyhow::Result<Vec<String>> {
                Ok(Vec::new())
            }
            fn invoke(
                &self,
                _input: InvocationInput<'_>,
                _options: &EngineOptions,
            ) -> anyhow::Result<RawInvocationResult> {
                Ok(serde_json::Value::Null)
            }
        }

        let model = CachedModel {
            language: LanguageKey::new("en").unwrap(),
            handle: Arc::new(EmptyHandle),
            accepted: AcceptedParameterSet::empty(),
        };
        let success = Cascade::default().run(&model, &blank_page(), 1).unwrap();
        assert_eq!(success.label, "default");
        assert!(success.failed.is_empty());
    }

    #[test]
    fn test_exhaustion_aggregates_errors_and_panics() {
        let handle = Arc::new(ScriptedHandle::new(
            vec!["cls", "use_angle_cls", "use_textline_orientation"],
            None,
        ));
        let model = model(handle.clone(), AcceptedParameterSet::new(handle.signature.clone()));

        let err = Cascade::default().run(&model, &blank_page(), 3).unwrap_err();

        match err {
            OcrError::InvocationExhausted {
                language,
                page,
                attempts,
            } => {
                assert_eq!(language, "en");
                assert_eq!(page, 3);
                assert_eq!(attempts.len(), default_configs().len());
                assert_eq!(attempts[0].reason, "Unknown argument");
                let last = attempts.last().unwrap();
                assert_eq!(last.label, "no-angle-cls");
                assert_eq!(last.options.len(), 3);
                assert!(last.reason.contains("segfault in fused kernel"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_path_mode_is_last_resort() {
        let mut handle = ScriptedHandle::new(vec!["use_doc_unwarping"], None);
        handle.path_input = true;
        let handle = Arc::new(handle);
        let model = model(handle.clone(), AcceptedParameterSet::new(handle.signature.clone()));
        let page = Page::from_file(DynamicImage::new_rgb8(4, 4), PathBuf::from("/tmp/page.png"));

        let success = Cascade::default().run(&model, &page, 1).unwrap();

        assert_eq!(success.mode, "path");
        assert_eq!(success.label, "path");
        assert!(success.options.is_empty());
        let seen = handle.seen.lock().unwrap();
        assert_eq!(seen.len(), default_configs().len() + 1);
        assert!(seen[..seen.len() - 1].iter().all(|(mode, _)| *mode == "array"));
    }

    #[test]
    fn test_path_mode_skipped_without_source_file() {
        let mut handle = ScriptedHandle::new(Vec::new(), None);
        handle.path_input = true;
        let handle = Arc::new(handle);
        let model = model(handle.clone(), AcceptedParameterSet::empty());

        assert!(Cascade::default().run(&model, &blank_page(), 1).is_err());
        assert_eq!(handle.seen.lock().unwrap().len(), default_configs().len());
    }
}
