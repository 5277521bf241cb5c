//! Flatten the engine's version-dependent output into ordered text lines.
//!
//! Known shapes:
//!
//! - tabular records: `[{"rec_texts": [..], "rec_scores": [..]}, ..]`,
//!   optionally wrapped as `{"res": {..}}`
//! - nested detections: `[[ [box, [text, score]] | [box, text], .. ], ..]`
//!   (one inner list per page, `null` for a page without text)
//! - flat detections: the same items without page nesting
//!
//! Anything falsy is an empty page. Entries that do not fit are skipped.

use serde_json::Value;

const TEXTS_FIELD: &str = "rec_texts";
const SCORES_FIELD: &str = "rec_scores";
const RESULT_WRAPPER: &str = "res";
const NO_ITEMS: &[Value] = &[];

/// Classified view of a raw invocation result
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResultShape<'a> {
    TabularRecord(&'a [Value]),
    NestedDetection(&'a [Value]),
    FlatDetection(&'a [Value]),
    Empty,
}

impl ResultShape<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            Self::TabularRecord(_) => "tabular-record",
            Self::NestedDetection(_) => "nested-detection",
            Self::FlatDetection(_) => "flat-detection",
            Self::Empty => "empty",
        }
    }
}

/// Decide which shape `raw` has
pub fn classify(raw: &Value) -> ResultShape<'_> {
    if is_falsy(raw) {
        return ResultShape::Empty;
    }

    let entries = match raw {
        Value::Array(entries) => entries.as_slice(),
        Value::Object(_) => std::slice::from_ref(raw),
        _ => return ResultShape::Empty,
    };

    // Every entry votes; malformed ones are skipped during extraction.
    if entries.iter().any(is_detection_item) {
        ResultShape::FlatDetection(entries)
    } else if entries.iter().any(|entry| match entry {
        Value::Array(items) => items.iter().any(is_detection_item),
        _ => false,
    }) {
        ResultShape::NestedDetection(entries)
    } else if entries.iter().any(Value::is_object) {
        ResultShape::TabularRecord(entries)
    } else if entries.iter().any(Value::is_array) {
        // Only empty or malformed pages
        ResultShape::NestedDetection(entries)
    } else {
        ResultShape::Empty
    }
}

/// Reduce `raw` to its non-blank lines, preserving engine order
pub fn normalize(raw: &Value) -> Vec<String> {
    let shape = classify(raw);
    let lines = match shape {
        ResultShape::TabularRecord(records) => tabular_lines(records),
        ResultShape::NestedDetection(pages) => {
            detection_lines(pages.iter().flat_map(page_items))
        }
        ResultShape::FlatDetection(items) => detection_lines(items.iter()),
        ResultShape::Empty => Vec::new(),
    };
    tracing::debug!("Normalized {} result into {} lines", shape.name(), lines.len());
    lines
}

fn tabular_lines(records: &[Value]) -> Vec<String> {
    let mut lines = Vec::new();
    for record in records {
        let record = match record.get(RESULT_WRAPPER) {
            Some(inner) if inner.is_object() => inner,
            _ => record,
        };
        let Some(texts) = record.get(TEXTS_FIELD).and_then(Value::as_array) else {
            tracing::debug!("Skipping record without {}", TEXTS_FIELD);
            continue;
        };
        let scored = record
            .get(SCORES_FIELD)
            .and_then(Value::as_array)
            .map_or(0, Vec::len);
        if scored != texts.len() {
            tracing::debug!("{} texts carry {} scores", texts.len(), scored);
        }
        lines.extend(texts.iter().filter_map(Value::as_str).filter_map(clean));
    }
    lines
}

fn page_items(page: &Value) -> std::slice::Iter<'_, Value> {
    match page {
        Value::Array(items) => items.iter(),
        _ => NO_ITEMS.iter(),
    }
}

fn detection_lines<'a>(items: impl Iterator<Item = &'a Value>) -> Vec<String> {
    items
        .filter_map(|item| {
            let text = item_text(item);
            if text.is_none() {
                tracing::debug!("Skipping malformed detection item: {}", item);
            }
            text
        })
        .filter_map(clean)
        .collect()
}

/// Text of a `[box, text]` or `[box, [text, score]]` item
fn item_text(item: &Value) -> Option<&str> {
    let pair = item.as_array().filter(|pair| pair.len() >= 2)?;
    match &pair[1] {
        Value::String(text) => Some(text),
        Value::Array(content) => content.first().and_then(Value::as_str),
        _ => None,
    }
}

fn is_detection_item(value: &Value) -> bool {
    let Some(pair) = value.as_array() else {
        return false;
    };
    pair.len() >= 2 && is_box(&pair[0]) && item_text(value).is_some()
}

/// A quad of points (`[[x, y], ..]`) or flat coordinates (`[x1, y1, ..]`)
fn is_box(value: &Value) -> bool {
    let Some(coords) = value.as_array() else {
        return false;
    };
    !coords.is_empty()
        && coords.iter().all(|c| {
            c.is_number()
                || c.as_array()
                    .is_some_and(|point| point.iter().all(Value::is_number))
        })
}

fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
    }
}

fn clean(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
