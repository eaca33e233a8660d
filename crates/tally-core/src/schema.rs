//! Versioned schema upgrade for stored and imported state.
//!
//! Documents written by older builds are upgraded one version at a time,
//! each step filling every field it introduced with an explicit default,
//! before strict deserialization into [`ApplicationState`].

use serde_json::{Map, Value, json};
use thiserror::Error;

use crate::model::ApplicationState;

/// Version written by this build.
pub const CURRENT_SCHEMA_VERSION: u32 = 2;

const VERSION_FIELD: &str = "schemaVersion";

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("Expected a JSON object")]
    NotAnObject,

    #[error("Invalid schemaVersion field")]
    InvalidVersion,

    #[error("Unsupported schema version {0} (newest known is {max})", max = CURRENT_SCHEMA_VERSION)]
    UnsupportedVersion(u64),

    #[error("Invalid state: {0}")]
    Shape(#[from] serde_json::Error),
}

type Migration = fn(&mut Map<String, Value>);

/// `MIGRATIONS[n]` upgrades a version `n` document to version `n + 1`.
const MIGRATIONS: [Migration; CURRENT_SCHEMA_VERSION as usize] = [upgrade_v0, upgrade_v1];

/// Upgrade a raw document to the current schema and deserialize it.
pub fn upgrade(value: Value) -> Result<ApplicationState, SchemaError> {
    let Value::Object(mut doc) = value else {
        return Err(SchemaError::NotAnObject);
    };

    let version = read_version(&doc)?;
    if version > u64::from(CURRENT_SCHEMA_VERSION) {
        return Err(SchemaError::UnsupportedVersion(version));
    }

    for migration in MIGRATIONS.iter().skip(version as usize) {
        migration(&mut doc);
    }
    doc.insert(VERSION_FIELD.to_string(), json!(CURRENT_SCHEMA_VERSION));

    Ok(serde_json::from_value(Value::Object(doc))?)
}

/// Parse a JSON string and upgrade it.
pub fn upgrade_str(text: &str) -> Result<ApplicationState, SchemaError> {
    upgrade(serde_json::from_str(text)?)
}

fn read_version(doc: &Map<String, Value>) -> Result<u64, SchemaError> {
    match doc.get(VERSION_FIELD) {
        None | Some(Value::Null) => Ok(0),
        Some(value) => value.as_u64().ok_or(SchemaError::InvalidVersion),
    }
}

/// v0 -> v1: unversioned documents may lack any field.
fn upgrade_v0(doc: &mut Map<String, Value>) {
    fill(doc, "sheets", json!([]));
    fill(doc, "templates", json!([]));
    fill(doc, "history", json!([]));
    fill(doc, "activeSheetId", Value::Null);
    fill(doc, "viewMode", json!("sheet"));
    fill(doc, "notes", json!(""));
    fill(doc, "exchangeRate", json!(1.0));
    fill(doc, "rateMeta", Value::Null);

    for_each_sheet(doc, |sheet| {
        fill(sheet, "month", Value::Null);
        fill(sheet, "createdAt", json!(0));
        fill(sheet, "categories", json!([]));
        fill(sheet, "marks", json!([]));
        fill(sheet, "balances", json!([]));
    });

    if let Some(Value::Array(templates)) = doc.get_mut("templates") {
        for template in templates.iter_mut().filter_map(Value::as_object_mut) {
            fill(template, "categories", json!([]));
        }
    }
}

/// v1 -> v2: marks move from `done`/`type` to `status`/`direction`.
fn upgrade_v1(doc: &mut Map<String, Value>) {
    for_each_sheet(doc, |sheet| {
        let Some(Value::Array(marks)) = sheet.get_mut("marks") else {
            return;
        };
        for mark in marks.iter_mut().filter_map(Value::as_object_mut) {
            let done = mark.remove("done").and_then(|v| v.as_bool());
            if !mark.contains_key("status") {
                let status = if done == Some(true) { "completed" } else { "pending" };
                mark.insert("status".to_string(), json!(status));
            }

            let kind = mark.remove("type");
            if !mark.contains_key("direction") {
                let direction = match kind.as_ref().and_then(Value::as_str) {
                    Some("in") => "incoming",
                    _ => "outgoing",
                };
                mark.insert("direction".to_string(), json!(direction));
            }
        }
    });
}

/// Insert `default` when `key` is missing or null.
fn fill(obj: &mut Map<String, Value>, key: &str, default: Value) {
    if obj.get(key).is_none_or(Value::is_null) {
        obj.insert(key.to_string(), default);
    }
}

/// Visit every sheet object, active and archived.
fn for_each_sheet(doc: &mut Map<String, Value>, mut f: impl FnMut(&mut Map<String, Value>)) {
    if let Some(Value::Array(sheets)) = doc.get_mut("sheets") {
        for sheet in sheets.iter_mut().filter_map(Value::as_object_mut) {
            f(sheet);
        }
    }
    if let Some(Value::Array(history)) = doc.get_mut("history") {
        for entry in history.iter_mut().filter_map(Value::as_object_mut) {
            if let Some(Value::Object(sheet)) = entry.get_mut("sheet") {
                f(sheet);
            }
        }
    }
}
