//! Decoding of list/watch query parameters
//!
//! Mirrors the API server's parameter codec for `ListOptions`: booleans never
//! fail to decode, integers and selectors do. Only the first value of a
//! repeated parameter is considered.

use std::collections::{BTreeMap, HashMap};

use crate::{Error, Result};

const TERM_OPERATORS: [&str; 3] = ["!=", "==", "="];

/// Options carried by a list or watch request
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListOptions {
    /// Validated label selector, `None` when it selects everything
    pub label_selector: Option<String>,
    /// Parsed field selector, `None` when it selects everything
    pub field_selector: Option<FieldSelector>,
    pub watch: bool,
    pub allow_watch_bookmarks: bool,
    pub send_initial_events: bool,
    pub resource_version: Option<String>,
    pub resource_version_match: Option<String>,
    pub continue_token: Option<String>,
    pub timeout_seconds: Option<i64>,
    pub limit: Option<i64>,
}

impl ListOptions {
    /// Decode list options from a raw (still percent-encoded) query string
    pub fn from_query(query: Option<&str>) -> Result<Self> {
        let params = first_values(query);
        let mut opts = ListOptions::default();

        if let Some(selector) = params.get("labelSelector") {
            validate_label_selector(selector)?;
            if !selector.trim().is_empty() {
                opts.label_selector = Some(selector.clone());
            }
        }
        if let Some(selector) = params.get("fieldSelector") {
            let parsed = FieldSelector::parse(selector)?;
            if !parsed.is_empty() {
                opts.field_selector = Some(parsed);
            }
        }

        opts.watch = params.get("watch").map(|v| parse_bool(v)).unwrap_or(false);
        opts.allow_watch_bookmarks = params
            .get("allowWatchBookmarks")
            .map(|v| parse_bool(v))
            .unwrap_or(false);
        opts.send_initial_events = params
            .get("sendInitialEvents")
            .map(|v| parse_bool(v))
            .unwrap_or(false);

        opts.resource_version = params.get("resourceVersion").cloned();
        opts.resource_version_match = params.get("resourceVersionMatch").cloned();
        opts.continue_token = params.get("continue").cloned();
        opts.timeout_seconds = parse_int("timeoutSeconds", params.get("timeoutSeconds"))?;
        opts.limit = parse_int("limit", params.get("limit"))?;

        Ok(opts)
    }

    /// Only the `watch` flag, used when full decoding failed
    pub fn watch_only(query: Option<&str>) -> Self {
        ListOptions {
            watch: first_values(query)
                .get("watch")
                .map(|v| parse_bool(v))
                .unwrap_or(false),
            ..Default::default()
        }
    }
}

fn first_values(query: Option<&str>) -> HashMap<String, String> {
    let mut params = HashMap::new();
    if let Some(query) = query {
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            params
                .entry(key.into_owned())
                .or_insert_with(|| value.into_owned());
        }
    }
    params
}

/// Anything other than `0` or a case-insensitive `false` is true, including
/// an empty value.
pub fn parse_bool(value: &str) -> bool {
    !(value == "0" || value.eq_ignore_ascii_case("false"))
}

fn parse_int(name: &str, value: Option<&String>) -> Result<Option<i64>> {
    let Some(value) = value else {
        return Ok(None);
    };
    let value = value.trim();
    if value.is_empty() {
        return Ok(Some(0));
    }
    value
        .parse::<i64>()
        .map(Some)
        .map_err(|e| Error::ListOptionsError(format!("{}: {}", name, e)))
}

/// Whether `name` may be used as a single path segment
pub fn is_valid_path_segment_name(name: &str) -> bool {
    name != "." && name != ".." && !name.contains('/') && !name.contains('%')
}

// ============================================================================
// Field selectors
// ============================================================================

/// A conjunction of `field=value` / `field!=value` terms
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FieldSelector {
    terms: Vec<FieldTerm>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct FieldTerm {
    field: String,
    value: String,
    equals: bool,
}

impl FieldSelector {
    pub fn parse(selector: &str) -> Result<Self> {
        let mut parts = split_terms(selector);
        parts.sort();

        let mut terms = Vec::new();
        for part in parts.iter().filter(|p| !p.is_empty()) {
            let (field, op, rhs) = split_term(part).ok_or_else(|| {
                Error::ListOptionsError(format!(
                    "invalid selector: '{}'; can't understand '{}'",
                    selector, part
                ))
            })?;
            terms.push(FieldTerm {
                field: field.to_string(),
                value: unescape_value(rhs)?,
                equals: op != "!=",
            });
        }
        Ok(FieldSelector { terms })
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// Value of the first equality term on `field`
    pub fn requires_exact_match(&self, field: &str) -> Option<&str> {
        self.terms
            .iter()
            .find(|t| t.equals && t.field == field)
            .map(|t| t.value.as_str())
    }

    /// True when the selector is nothing but `metadata.name=<value>`
    pub fn is_name_only(&self) -> bool {
        self.terms.len() == 1 && self.requires_exact_match("metadata.name").is_some()
    }
}

fn split_terms(selector: &str) -> Vec<&str> {
    if selector.is_empty() {
        return Vec::new();
    }
    let mut terms = Vec::new();
    let mut start = 0;
    let mut in_slash = false;
    for (i, c) in selector.char_indices() {
        if in_slash {
            in_slash = false;
        } else if c == '\\' {
            in_slash = true;
        } else if c == ',' {
            terms.push(&selector[start..i]);
            start = i + 1;
        }
    }
    terms.push(&selector[start..]);
    terms
}

fn split_term(term: &str) -> Option<(&str, &'static str, &str)> {
    for (i, _) in term.char_indices() {
        let remaining = &term[i..];
        for op in TERM_OPERATORS {
            if remaining.starts_with(op) {
                return Some((&term[..i], op, &term[i + op.len()..]));
            }
        }
    }
    None
}

fn unescape_value(value: &str) -> Result<String> {
    if !value.contains(['\\', ',', '=']) {
        return Ok(value.to_string());
    }
    let mut out = String::with_capacity(value.len());
    let mut in_slash = false;
    for c in value.chars() {
        if in_slash {
            match c {
                '\\' | ',' | '=' => out.push(c),
                other => {
                    return Err(Error::ListOptionsError(format!(
                        "invalid escape sequence: \\{}",
                        other
                    )))
                }
            }
            in_slash = false;
            continue;
        }
        match c {
            '\\' => in_slash = true,
            ',' | '=' => {
                return Err(Error::ListOptionsError(format!(
                    "invalid field selector: unescaped character {}",
                    c
                )))
            }
            other => out.push(other),
        }
    }
    if in_slash {
        return Err(Error::ListOptionsError(
            "invalid escape sequence: \\".to_string(),
        ));
    }
    Ok(out)
}

// ============================================================================
// Label selectors
// ============================================================================

/// Check a label selector against the selector grammar
pub fn validate_label_selector(selector: &str) -> Result<()> {
    if selector.trim().is_empty() {
        return Ok(());
    }
    for requirement in split_requirements(selector) {
        validate_requirement(requirement.trim())
            .map_err(|msg| Error::ListOptionsError(format!("{}: {}", selector, msg)))?;
    }
    Ok(())
}

/// Convert an equality-only selector (`a=b,c=d`) into a label map
pub fn selector_as_equality_map(selector: &str) -> Result<BTreeMap<String, String>> {
    let mut labels = BTreeMap::new();
    if selector.is_empty() {
        return Ok(labels);
    }
    for label in selector.split(',') {
        let pair: Vec<&str> = label.split('=').collect();
        if pair.len() != 2 {
            return Err(Error::ListOptionsError(format!(
                "invalid selector: {}",
                label
            )));
        }
        let key = pair[0].trim();
        let value = pair[1].trim();
        if !is_qualified_key(key) || !is_label_value(value) {
            return Err(Error::ListOptionsError(format!(
                "invalid selector: {}",
                label
            )));
        }
        labels.insert(key.to_string(), value.to_string());
    }
    Ok(labels)
}

fn split_requirements(selector: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in selector.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                out.push(&selector[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    out.push(&selector[start..]);
    out
}

fn validate_requirement(requirement: &str) -> std::result::Result<(), String> {
    if let Some(key) = requirement.strip_prefix('!') {
        let key = key.trim();
        return if is_qualified_key(key) {
            Ok(())
        } else {
            Err(format!("invalid label key {:?}", key))
        };
    }

    let key_len = requirement
        .find(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/' | '-')))
        .unwrap_or(requirement.len());
    let key = &requirement[..key_len];
    if !is_qualified_key(key) {
        return Err(format!("invalid label key {:?}", key));
    }

    let rest = requirement[key_len..].trim_start();
    if rest.is_empty() {
        return Ok(());
    }
    for op in ["!=", "==", "="] {
        if let Some(value) = rest.strip_prefix(op) {
            let value = value.trim();
            return if is_label_value(value) {
                Ok(())
            } else {
                Err(format!("invalid label value {:?}", value))
            };
        }
    }
    for op in [">", "<"] {
        if let Some(value) = rest.strip_prefix(op) {
            return value
                .trim()
                .parse::<i64>()
                .map(|_| ())
                .map_err(|_| format!("{} requires an integer value", op));
        }
    }
    for op in ["notin", "in"] {
        if let Some(values) = rest.strip_prefix(op) {
            let values = values.trim();
            let inner = values
                .strip_prefix('(')
                .and_then(|v| v.strip_suffix(')'))
                .ok_or_else(|| format!("'{}' requires a parenthesised value set", op))?;
            if inner.trim().is_empty() {
                return Err(format!("for '{}' operator, values set can't be empty", op));
            }
            for value in inner.split(',') {
                if !is_label_value(value.trim()) {
                    return Err(format!("invalid label value {:?}", value.trim()));
                }
            }
            return Ok(());
        }
    }
    Err(format!("unexpected {:?}", rest))
}

fn is_qualified_key(key: &str) -> bool {
    let (prefix, name) = match key.split_once('/') {
        Some((prefix, name)) => (Some(prefix), name),
        None => (None, key),
    };
    if let Some(prefix) = prefix {
        let valid_prefix = !prefix.is_empty()
            && prefix.len() <= 253
            && prefix
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.');
        if !valid_prefix {
            return false;
        }
    }
    !name.is_empty() && is_label_value(name)
}

fn is_label_value(value: &str) -> bool {
    if value.is_empty() {
        return true;
    }
    let bytes = value.as_bytes();
    value.len() <= 63
        && bytes[0].is_ascii_alphanumeric()
        && bytes[bytes.len() - 1].is_ascii_alphanumeric()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}
