//! Lazily constructed, per-language model handles.

use super::probe::{self, panic_message, AcceptedParameterSet};
use crate::engine::{describe_options, EngineOptions, InferenceEngine, ModelHandle};
use crate::error::{AttemptFailure, OcrError};
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, TryLockError};

/// Normalized, non-empty language identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LanguageKey(String);

impl LanguageKey {
    /// Trim and lower-case `raw`; `None` when nothing is left
    pub fn new(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_lowercase();
        if normalized.is_empty() {
            None
        } else {
            Some(Self(normalized))
        }
    }

    /// The requested language, or `default` when the request had none
    pub fn resolve(requested: Option<&str>, default: &LanguageKey) -> Self {
        requested
            .and_then(Self::new)
            .unwrap_or_else(|| default.clone())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LanguageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A cached handle plus the invocation parameters it was probed to accept
pub struct CachedModel {
    pub language: LanguageKey,
    pub handle: Arc<dyn ModelHandle>,
    pub accepted: AcceptedParameterSet,
}

type Slot = Arc<RwLock<Option<Arc<CachedModel>>>>;

/// Owns at most one live model per language for the process lifetime.
///
/// Construction for a key is serialized on that key's slot while cached
/// handles are served under a shared read lock. Different keys construct
/// independently. Entries are never evicted.
pub struct ModelCache {
    engine: Arc<dyn InferenceEngine>,
    candidate_params: EngineOptions,
    slots: RwLock<HashMap<LanguageKey, Slot>>,
}

impl ModelCache {
    /// `candidate_params` are the constructor options to pass when
    /// accepted; `lang` is filled in per key.
    pub fn new(engine: Arc<dyn InferenceEngine>, candidate_params: EngineOptions) -> Self {
        Self {
            engine,
            candidate_params,
            slots: RwLock::new(HashMap::new()),
        }
    }

    pub fn engine(&self) -> &Arc<dyn InferenceEngine> {
        &self.engine
    }

    /// Return the handle for `language`, constructing it on first use
    pub fn acquire(&self, language: &LanguageKey) -> Result<Arc<CachedModel>, OcrError> {
        let slot = self.slot(language);
        if let Some(model) = read_slot(&slot).as_ref() {
            return Ok(Arc::clone(model));
        }

        let mut entry = write_slot(&slot);
        // Another caller may have finished while we waited
        if let Some(model) = entry.as_ref() {
            return Ok(Arc::clone(model));
        }

        let model = Arc::new(self.construct(language)?);
        *entry = Some(Arc::clone(&model));
        Ok(model)
    }

    /// Languages with a live handle. Never waits on a construction in
    /// progress.
    pub fn loaded_languages(&self) -> Vec<String> {
        let slots: Vec<(LanguageKey, Slot)> = {
            let slots = match self.slots.read() {
                Ok(slots) => slots,
                Err(poisoned) => poisoned.into_inner(),
            };
            slots
                .iter()
                .map(|(key, slot)| (key.clone(), Arc::clone(slot)))
                .collect()
        };
        let mut languages: Vec<String> = slots
            .into_iter()
            .filter(|(_, slot)| match slot.try_read() {
                Ok(entry) => entry.is_some(),
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().is_some(),
                // Still being constructed
                Err(TryLockError::WouldBlock) => false,
            })
            .map(|(key, _)| key.to_string())
            .collect();
        languages.sort();
        languages
    }

    fn slot(&self, language: &LanguageKey) -> Slot {
        {
            let slots = match self.slots.read() {
                Ok(slots) => slots,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(slot) = slots.get(language) {
                return Arc::clone(slot);
            }
        }

        let mut slots = match self.slots.write() {
            Ok(slots) => slots,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(slots.entry(language.clone()).or_default())
    }

    fn construct(&self, language: &LanguageKey) -> Result<CachedModel, OcrError> {
        let engine = self.engine.as_ref();
        tracing::info!(
            "Initializing {} v{} for language={}",
            engine.name(),
            engine.version(),
            language
        );

        let accepted_ctor = probe::probe(&format!("{} constructor", engine.name()), || {
            engine.constructor_signature()
        });

        let mut candidates = self.candidate_params.clone();
        candidates.insert("lang".to_string(), language.as_str().into());
        let filtered = accepted_ctor.filter(&candidates);
        tracing::info!(
            "{} constructor accepted args: {:?}",
            engine.name(),
            filtered.keys().collect::<Vec<_>>()
        );

        let mut attempts = Vec::new();
        let mut steps = vec![("filtered", filtered)];
        if !steps[0].1.is_empty() {
            steps.push(("bare", EngineOptions::new()));
        }

        for (label, options) in steps {
            match guarded_construct(engine, &options) {
                Ok(handle) => {
                    let accepted = probe::probe(
                        &format!("{} invocation", engine.name()),
                        || handle.invocation_signature(),
                    );
                    tracing::info!(
                        "{} initialized for language={} ({} construction, handle language={})",
                        engine.name(),
                        language,
                        label,
                        handle.language()
                    );
                    return Ok(CachedModel {
                        language: language.clone(),
                        handle,
                        accepted,
                    });
                }
                Err(reason) => {
                    tracing::warn!(
                        "{} {} construction {} failed for language={}: {}",
                        engine.name(),
                        label,
                        describe_options(&options),
                        language,
                        reason
                    );
                    attempts.push(AttemptFailure {
                        label: label.to_string(),
                        options,
                        reason,
                    });
                }
            }
        }

        Err(OcrError::ModelInitializationFailed {
            language: language.to_string(),
            attempts,
        })
    }
}

fn guarded_construct(
    engine: &dyn InferenceEngine,
    options: &EngineOptions,
) -> Result<Arc<dyn ModelHandle>, String> {
    match panic::catch_unwind(AssertUnwindSafe(|| engine.construct(options))) {
        Ok(Ok(handle)) => Ok(handle),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(payload) => Err(format!(
            "engine panicked: {}",
            panic_message(payload.as_ref())
        )),
    }
}

// A panic while a slot is held leaves it empty, which is a valid state.
type Entry = Option<Arc<CachedModel>>;

fn read_slot(slot: &RwLock<Entry>) -> RwLockReadGuard<'_, Entry> {
    match slot.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_slot(slot: &RwLock<Entry>) -> RwLockWriteGuard<'_, Entry> {
    match slot.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{InvocationInput, RawInvocationResult};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Mutex};
    use std::thread;
    use std::time::Duration;

    struct StubHandle {
        language: String,
    }

    impl ModelHandle for StubHandle {
        fn language(&self) -> &str {
            &self.language
        }

        fn invocation_signature(&self) -> anyhow::Result<Vec<String>> {
            Ok(vec!["self".to_string(), "det".to_string()])
        }

        fn invoke(
            &self,
            _input: InvocationInput<'_>,
            _options: &EngineOptions,
        ) -> anyhow::Result<RawInvocationResult> {
            Ok(serde_json::Value::Null)
        }
    }

    /// Fails every construction that carries options, and the first
    /// `bare_failures` bare ones.
    struct StubEngine {
        signature: Option<Vec<&'static str>>,
        reject_options: bool,
        bare_failures: AtomicUsize,
        calls: Mutex<Vec<EngineOptions>>,
    }

    impl StubEngine {
        fn new(signature: Option<Vec<&'static str>>) -> Self {
            Self {
                signature,
                reject_options: false,
                bare_failures: AtomicUsize::new(0),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<EngineOptions> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl InferenceEngine for StubEngine {
        fn name(&self) -> &'static str {
            "stub"
        }

        fn description(&self) -> &'static str {
            "stub engine"
        }

        fn version(&self) -> &'static str {
            "0.0.0"
        }

        fn constructor_signature(&self) -> anyhow::Result<Vec<String>> {
            match &self.signature {
                Some(names) => Ok(names.iter().map(|n| n.to_string()).collect()),
                None => anyhow::bail!("no signature"),
            }
        }

        fn construct(&self, options: &EngineOptions) -> anyhow::Result<Arc<dyn ModelHandle>> {
            self.calls.lock().unwrap().push(options.clone());
            if !options.is_empty() && self.reject_options {
                anyhow::bail!("unexpected keyword argument");
            }
            if options.is_empty() {
                let remaining = self.bare_failures.load(Ordering::SeqCst);
                if remaining > 0 {
                    self.bare_failures.store(remaining - 1, Ordering::SeqCst);
                    panic!("illegal instruction");
                }
            }
            let language = options
                .get("lang")
                .and_then(|v| v.as_text())
                .unwrap_or("default")
                .to_string();
            Ok(Arc::new(StubHandle { language }))
        }

        fn supported_languages(&self) -> Vec<String> {
            Vec::new()
        }
    }

    fn candidates() -> EngineOptions {
        let mut options = EngineOptions::new();
        options.insert("use_gpu".to_string(), false.into());
        options.insert("precision".to_string(), "fp32".into());
        options
    }

    fn key(raw: &str) -> LanguageKey {
        LanguageKey::new(raw).unwrap()
    }

    #[test]
    fn test_language_key_normalizes() {
        assert_eq!(key("  EN ").as_str(), "en");
        assert!(LanguageKey::new("   ").is_none());

        let default = key("ch");
        assert_eq!(LanguageKey::resolve(None, &default), default);
        assert_eq!(LanguageKey::resolve(Some(""), &default), default);
        assert_eq!(LanguageKey::resolve(Some("Fr"), &default).as_str(), "fr");
    }

    #[test]
    fn test_acquire_filters_candidates_and_caches() {
        let engine = Arc::new(StubEngine::new(Some(vec!["self", "lang", "use_gpu"])));
        let cache = ModelCache::new(engine.clone(), candidates());

        let first = cache.acquire(&key("en")).unwrap();
        let second = cache.acquire(&key("en")).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.handle.language(), "en");
        assert!(first.accepted.accepts("det"));

        let calls = engine.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0].keys().map(String::as_str).collect::<Vec<_>>(),
            vec!["lang", "use_gpu"]
        );
        assert_eq!(cache.loaded_languages(), vec!["en".to_string()]);
    }

    #[test]
    fn test_failed_filtered_construction_falls_back_to_bare() {
        let mut engine = StubEngine::new(Some(vec!["lang"]));
        engine.reject_options = true;
        let engine = Arc::new(engine);
        let cache = ModelCache::new(engine.clone(), candidates());

        let model = cache.acquire(&key("de")).unwrap();

        assert_eq!(model.handle.language(), "default");
        assert_eq!(model.language.as_str(), "de");
        let calls = engine.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[1].is_empty());
    }

    #[test]
    fn test_unreadable_signature_constructs_bare_once() {
        let engine = Arc::new(StubEngine::new(None));
        let cache = ModelCache::new(engine.clone(), candidates());

        cache.acquire(&key("en")).unwrap();

        assert_eq!(engine.calls(), vec![EngineOptions::new()]);
    }

    #[test]
    fn test_initialization_failure_is_not_cached() {
        let mut engine = StubEngine::new(Some(vec!["lang"]));
        engine.reject_options = true;
        engine.bare_failures = AtomicUsize::new(1);
        let engine = Arc::new(engine);
        let cache = ModelCache::new(engine.clone(), candidates());

        let err = match cache.acquire(&key("ja")) {
            Err(err) => err,
            Ok(_) => panic!("construction should fail"),
        };
        match err {
            OcrError::ModelInitializationFailed { language, attempts } => {
                assert_eq!(language, "ja");
                assert_eq!(attempts.len(), 2);
                assert_eq!(attempts[0].label, "filtered");
                assert!(attempts[1].reason.contains("illegal instruction"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(cache.loaded_languages().is_empty());

        // The next call starts from scratch and the bare path now succeeds.
        assert!(cache.acquire(&key("ja")).is_ok());
        assert_eq!(engine.calls().len(), 4);
    }

    #[test]
    fn test_cached_handle_is_served_while_slot_is_read_locked() {
        let engine = Arc::new(StubEngine::new(Some(vec!["lang"])));
        let cache = Arc::new(ModelCache::new(engine.clone(), candidates()));
        let first = cache.acquire(&key("en")).unwrap();

        // A reader holding the slot must not stall other lookups of the same key.
        let slot = cache.slot(&key("en"));
        let held = read_slot(&slot);

        let (tx, rx) = mpsc::channel();
        let worker = {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                let model = cache.acquire(&key("en")).unwrap();
                tx.send(model).unwrap();
            })
        };
        let second = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("cached lookup blocked on a shared read lock");
        drop(held);
        worker.join().unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(engine.calls().len(), 1);
    }
}
