//! Message catalogs and per-request localisation.
//!
//! A [`Catalog`] is loaded once at startup. When a handler unit carries one,
//! the request context binds a [`Localizer`] ordered by the caller's
//! `Accept-Language` preference, falling back to the catalog default.
//! Templates use `{name}` placeholders filled from a property map.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};

/// Messages by language tag, then by message id.
#[derive(Clone, Debug, Default)]
pub struct Catalog {
    default_language: String,
    messages: HashMap<String, HashMap<String, String>>,
}

impl Catalog {
    pub fn new(default_language: impl Into<String>) -> Self {
        Self { default_language: default_language.into().to_ascii_lowercase(), messages: HashMap::new() }
    }

    pub fn add(&mut self, language: &str, id: impl Into<String>, template: impl Into<String>) -> &mut Self {
        self.messages
            .entry(language.to_ascii_lowercase())
            .or_default()
            .insert(id.into(), template.into());
        self
    }

    pub fn default_language(&self) -> &str { &self.default_language }

    fn lookup(&self, language: &str, id: &str) -> Option<&str> {
        self.messages.get(language)?.get(id).map(String::as_str)
    }
}

/// Resolves message ids against a catalog in preference order.
#[derive(Clone, Debug)]
pub struct Localizer {
    catalog: Arc<Catalog>,
    preferred: Vec<String>,
}

impl Localizer {
    pub fn new(catalog: Arc<Catalog>, accept_language: &str) -> Self {
        let mut preferred = parse_accept_language(accept_language);
        preferred.push(catalog.default_language.clone());
        Self { catalog, preferred }
    }

    /// The first template found for `id`, rendered with `params`.
    pub fn localize(&self, id: &str, params: &Map<String, Value>) -> Option<String> {
        self.preferred
            .iter()
            .find_map(|lang| self.catalog.lookup(lang, id))
            .map(|template| render(template, params))
    }
}

/// The caller's language preference, bound to the request.
#[derive(Clone, Debug)]
pub struct Language {
    pub accept_language: String,
    pub localizer: Localizer,
}

/// Language tags by descending `q`, each followed by its primary subtag.
fn parse_accept_language(header: &str) -> Vec<String> {
    let mut weighted: Vec<(f32, String)> = header
        .split(',')
        .filter_map(|item| {
            let mut parts = item.trim().split(';');
            let tag = parts.next()?.trim().to_ascii_lowercase();
            if tag.is_empty() || tag == "*" {
                return None;
            }
            let q = parts
                .find_map(|p| p.trim().strip_prefix("q=").and_then(|q| q.parse().ok()))
                .unwrap_or(1.0);
            Some((q, tag))
        })
        .collect();
    weighted.sort_by(|a, b| b.0.total_cmp(&a.0));

    let mut tags = Vec::new();
    for (_, tag) in weighted {
        let primary = tag.split('-').next().unwrap_or_default().to_owned();
        tags.push(tag);
        if !tags.contains(&primary) {
            tags.push(primary);
        }
    }
    tags
}

fn render(template: &str, params: &Map<String, Value>) -> String {
    params.iter().fold(template.to_owned(), |acc, (key, value)| {
        let text = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        acc.replace(&format!("{{{key}}}"), &text)
    })
}
