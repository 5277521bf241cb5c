use image::DynamicImage;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Untyped, engine-version-dependent output of one successful invocation
pub type RawInvocationResult = serde_json::Value;

/// Named options passed to an engine constructor or invocation method.
///
/// Ordered so that logged and recorded option sets are stable.
pub type EngineOptions = BTreeMap<String, OptionValue>;

/// Value of a single named engine option
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Text(String),
}

impl OptionValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value),
            _ => None,
        }
    }
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(value) => write!(f, "{}", value),
            Self::Int(value) => write!(f, "{}", value),
            Self::Text(value) => write!(f, "{:?}", value),
        }
    }
}

impl From<bool> for OptionValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for OptionValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for OptionValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// Render an option set as `{a=1, b=false}` for logs and error messages
pub fn describe_options(options: &EngineOptions) -> String {
    let parts: Vec<String> = options
        .iter()
        .map(|(name, value)| format!("{}={}", name, value))
        .collect();
    format!("{{{}}}", parts.join(", "))
}

/// Read a boolean option, falling back to `default` when absent or not a bool
pub fn bool_option(options: &EngineOptions, name: &str, default: bool) -> bool {
    options
        .get(name)
        .and_then(OptionValue::as_bool)
        .unwrap_or(default)
}

/// What an invocation is handed: a decoded image or the file it came from
#[derive(Debug, Clone, Copy)]
pub enum InvocationInput<'a> {
    Image(&'a DynamicImage),
    Path(&'a Path),
}

impl InvocationInput<'_> {
    /// Short label used in attempt records
    pub fn mode(&self) -> &'static str {
        match self {
            Self::Image(_) => "array",
            Self::Path(_) => "path",
        }
    }

    /// Load the input as a decoded image regardless of mode
    pub fn load(&self) -> anyhow::Result<DynamicImage> {
        match self {
            Self::Image(image) => Ok((*image).clone()),
            Self::Path(path) => Ok(image::open(path)?),
        }
    }
}

/// Factory side of an external inference engine.
///
/// The set of constructor options an installed engine accepts is only
/// discoverable at runtime through [`InferenceEngine::constructor_signature`].
pub trait InferenceEngine: Send + Sync {
    /// Returns the engine identifier (e.g., "ocrs", "leptess")
    fn name(&self) -> &'static str;

    /// Returns a human-readable description of the engine
    fn description(&self) -> &'static str;

    /// Version string of the underlying engine, for diagnostics
    fn version(&self) -> &'static str;

    /// Parameter names the constructor currently declares.
    ///
    /// May include a receiver name such as `self`. May fail.
    fn constructor_signature(&self) -> anyhow::Result<Vec<String>>;

    /// Build a model handle from the given named options
    fn construct(&self, options: &EngineOptions) -> anyhow::Result<Arc<dyn ModelHandle>>;

    /// Get supported languages
    fn supported_languages(&self) -> Vec<String>;
}

/// A loaded, ready-to-invoke model bound to one language
pub trait ModelHandle: Send + Sync {
    /// Language the handle was actually built for
    fn language(&self) -> &str;

    /// Parameter names the invocation method currently declares
    fn invocation_signature(&self) -> anyhow::Result<Vec<String>>;

    /// Whether `invoke` understands [`InvocationInput::Path`]
    fn supports_path_input(&self) -> bool {
        false
    }

    /// Run recognition on one page
    fn invoke(
        &self,
        input: InvocationInput<'_>,
        options: &EngineOptions,
    ) -> anyhow::Result<RawInvocationResult>;
}
