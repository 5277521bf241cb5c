//! Runtime discovery of which named parameters an engine entry point accepts.

use crate::engine::EngineOptions;
use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};

/// Receiver names that never count as accepted parameters
const RECEIVER_NAMES: &[&str] = &["self", "&self", "&mut self"];

/// Parameter names an engine entry point was found to accept.
///
/// Computed once and read-only afterwards. An empty set means "pass no
/// optional parameters, use the engine's defaults".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcceptedParameterSet {
    names: BTreeSet<String>,
}

impl AcceptedParameterSet {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names
                .into_iter()
                .map(Into::into)
                .filter(|name| !RECEIVER_NAMES.contains(&name.as_str()))
                .collect(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn accepts(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    /// Keep only the options this entry point accepts
    pub fn filter(&self, options: &EngineOptions) -> EngineOptions {
        options
            .iter()
            .filter(|(name, _)| self.accepts(name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }
}

/// Ask an entry point for its declared parameters.
///
/// Never fails: an error or panic from `introspect` degrades to an empty
/// set and is only logged.
pub fn probe<F>(target: &str, introspect: F) -> AcceptedParameterSet
where
    F: FnOnce() -> anyhow::Result<Vec<String>>,
{
    match panic::catch_unwind(AssertUnwindSafe(introspect)) {
        Ok(Ok(names)) => {
            let accepted = AcceptedParameterSet::new(names);
            tracing::debug!(
                "{} declares parameters: {:?}",
                target,
                accepted.names().collect::<Vec<_>>()
            );
            accepted
        }
        Ok(Err(e)) => {
            tracing::warn!(
                "Failed to inspect {}: {}. Falling back to default arguments.",
                target,
                e
            );
            AcceptedParameterSet::empty()
        }
        Err(payload) => {
            tracing::warn!(
                "Inspecting {} panicked: {}. Falling back to default arguments.",
                target,
                panic_message(payload.as_ref())
            );
            AcceptedParameterSet::empty()
        }
    }
}

/// Best-effort text of a caught panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        return s.to_string();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    "unknown panic payload".to_string()
}
