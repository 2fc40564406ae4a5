//! JSON-schema cleaning for tool declarations. The upstream rejects a subset
//! of standard keywords outright and ignores most validation constraints, so
//! constraints are surfaced to the model as a description suffix instead.

use serde_json::{Map, Value as JsonValue};

/// Removed wherever they appear.
const DROPPED_KEYWORDS: [&str; 5] = [
    "$schema",
    "additionalProperties",
    "uniqueItems",
    "exclusiveMinimum",
    "exclusiveMaximum",
];

/// Removed, but surfaced as `"name: value"` notes on the top-level
/// description.
const ELIDED_CONSTRAINTS: [&str; 11] = [
    "minLength",
    "maxLength",
    "minimum",
    "maximum",
    "minItems",
    "maxItems",
    "minProperties",
    "maxProperties",
    "pattern",
    "format",
    "multipleOf",
];

/// Clean a tool `parameters` schema in place and return it. All other fields
/// pass through verbatim.
pub fn clean_tool_schema(schema: &JsonValue) -> JsonValue {
    let mut cleaned = schema.clone();
    let mut notes = Vec::new();
    walk(&mut cleaned, &mut notes, false);
    if !notes.is_empty()
        && let JsonValue::Object(map) = &mut cleaned
    {
        append_description(map, &format!("({})", notes.join(", ")));
    }
    cleaned
}

fn walk(value: &mut JsonValue, notes: &mut Vec<String>, in_properties: bool) {
    match value {
        JsonValue::Object(map) => {
            if !in_properties {
                for key in ELIDED_CONSTRAINTS {
                    if let Some(found) = map.remove(key) {
                        if matches!(found, JsonValue::Object(_) | JsonValue::Array(_)) {
                            continue;
                        }
                        notes.push(format!("{key}: {}", scalar_to_string(&found)));
                    }
                }
                if map.get("additionalProperties") == Some(&JsonValue::Bool(false)) {
                    let note = "no additional properties".to_string();
                    if !notes.contains(&note) {
                        notes.push(note);
                    }
                }
                for key in DROPPED_KEYWORDS {
                    map.remove(key);
                }
                if map
                    .get("required")
                    .and_then(|v| v.as_array())
                    .map(|a| a.is_empty())
                    .unwrap_or(false)
                {
                    map.remove("required");
                }
            }

            let keys: Vec<String> = map.keys().cloned().collect();
            for key in keys {
                if let Some(child) = map.get_mut(&key) {
                    walk(child, notes, key == "properties");
                }
            }
        }
        JsonValue::Array(items) => {
            for item in items {
                walk(item, notes, false);
            }
        }
        _ => {}
    }
}

fn scalar_to_string(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn append_description(map: &mut Map<String, JsonValue>, suffix: &str) {
    let existing = map
        .get("description")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let merged = if existing.is_empty() {
        suffix.to_string()
    } else {
        format!("{existing} {suffix}")
    };
    map.insert("description".to_string(), JsonValue::String(merged));
}
