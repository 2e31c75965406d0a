use scout_core::error::AppError;
use scout_core::models::{EntityKind, NormalizedRecord, RawPayload};
use scout_core::traits::Extractor;
use scraper::{Html, Selector};
use serde_json::Value;

/// Extractor for schema.org JSON-LD blocks embedded in the page.
///
/// Pure: parses the payload body and returns the first object whose `@type`
/// matches the requested entity kind. Pages without a match are reported as
/// extraction errors so layout drift shows up separately from fetch failures.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLdExtractor;

impl JsonLdExtractor {
    pub fn new() -> Self {
        Self
    }

    /// schema.org types accepted for each entity kind.
    pub fn types_for(kind: EntityKind) -> &'static [&'static str] {
        match kind {
            EntityKind::Job => &["JobPosting"],
            EntityKind::Company => &["Organization", "Corporation"],
            EntityKind::Profile => &["Person", "ProfilePage"],
        }
    }

    /// Every JSON object found in `ld+json` script blocks, with `@graph`
    /// containers and top-level arrays flattened.
    pub fn objects(html: &str) -> Result<Vec<Value>, AppError> {
        let selector = Selector::parse(r#"script[type="application/ld+json"]"#)
            .map_err(|e| AppError::ExtractionError(format!("Invalid selector: {e}")))?;
        let document = Html::parse_document(html);

        let mut objects = Vec::new();
        for script in document.select(&selector) {
            let text: String = script.text().collect();
            match serde_json::from_str::<Value>(text.trim()) {
                Ok(value) => flatten(value, &mut objects),
                Err(e) => tracing::debug!(error = %e, "Skipping malformed JSON-LD block"),
            }
        }
        Ok(objects)
    }
}

fn flatten(value: Value, out: &mut Vec<Value>) {
    match value {
        Value::Array(items) => {
            for item in items {
                flatten(item, out);
            }
        }
        Value::Object(mut map) => {
            if let Some(graph) = map.remove("@graph") {
                flatten(graph, out);
            }
            if map.contains_key("@type") {
                out.push(Value::Object(map));
            }
        }
        _ => {}
    }
}

fn has_type(object: &Value, wanted: &[&str]) -> bool {
    match object.get("@type") {
        Some(Value::String(t)) => wanted.contains(&t.as_str()),
        Some(Value::Array(types)) => types
            .iter()
            .filter_map(Value::as_str)
            .any(|t| wanted.contains(&t)),
        _ => false,
    }
}

impl Extractor for JsonLdExtractor {
    fn extract(&self, kind: EntityKind, payload: &RawPayload) -> Result<NormalizedRecord, AppError> {
        let wanted = Self::types_for(kind);
        let objects = Self::objects(&payload.body)?;

        let found = objects
            .into_iter()
            .find(|o| has_type(o, wanted))
            .ok_or_else(|| {
                AppError::ExtractionError(format!(
                    "No {} JSON-LD block on {}",
                    wanted.join("/"),
                    payload.final_url
                ))
            })?;

        Ok(NormalizedRecord { kind, data: found })
    }
}
