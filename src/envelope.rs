//! Versioned wire envelope for queued trading decisions.
//!
//! Decoding happens in two steps so callers can keep the raw JSON value
//! around for hashing and for best-effort key recovery when validation
//! fails: [`decode_json`] turns the body into an object, then
//! [`parse_envelope_value`] validates the envelope fields and hands every
//! inference to the module's [`ItemParser`].

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::fmt::Debug;

use crate::module::{ModuleAliases, ModuleKind};

/// Module-specific validation of one inference item.
pub trait ItemParser: Send + Sync {
    type Item: Debug + Send + Sync;

    fn parse_item(&self, item: &Value) -> Result<Self::Item, ItemError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ItemError {
    #[error("item is not a JSON object")]
    NotAnObject,
    #[error("missing required field '{0}'")]
    MissingField(&'static str),
    #[error("invalid field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// What a consumer accepts: one schema version and one module, reachable
/// through its canonical name or any configured alias.
#[derive(Debug, Clone)]
pub struct EnvelopeRules {
    pub expected_version: u32,
    pub module: ModuleKind,
    pub aliases: ModuleAliases,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<T> {
    pub version: u32,
    /// Canonical module, after alias normalization.
    pub module: ModuleKind,
    /// Module half of the idempotency key. Taken from `moduleKey` when
    /// present, otherwise from `module`.
    pub module_key: ModuleKind,
    pub run_id: String,
    pub message_key: String,
    pub user_id: String,
    pub generated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub allocation_mode: Option<String>,
    pub inferences: Vec<T>,
}

impl<T> Envelope<T> {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MalformedMessage {
    #[error("message body is empty")]
    EmptyBody,
    #[error("message body is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("message body is not a JSON object")]
    NotAnObject,
    #[error("unsupported schema version {found}, expected {expected}")]
    UnsupportedVersion { expected: u32, found: String },
    #[error("unexpected module '{found}', expected {expected}")]
    UnexpectedModule { expected: ModuleKind, found: String },
    #[error("missing required field '{0}'")]
    MissingField(&'static str),
    #[error("invalid field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("invalid timestamp in '{field}': {value}")]
    InvalidTimestamp { field: &'static str, value: String },
    #[error("'inferences' is not a list")]
    InferencesNotList,
    #[error("invalid inference at index {index}: {source}")]
    InvalidItem {
        index: usize,
        #[source]
        source: ItemError,
    },
}

pub fn decode_json(body: &str) -> Result<Value, MalformedMessage> {
    if body.trim().is_empty() {
        return Err(MalformedMessage::EmptyBody);
    }

    let value: Value = serde_json::from_str(body)?;
    if !value.is_object() {
        return Err(MalformedMessage::NotAnObject);
    }

    Ok(value)
}

pub fn parse_envelope<P: ItemParser>(
    body: &str,
    rules: &EnvelopeRules,
    parser: &P,
) -> Result<Envelope<P::Item>, MalformedMessage> {
    let value = decode_json(body)?;
    parse_envelope_value(&value, rules, parser)
}

pub fn parse_envelope_value<P: ItemParser>(
    value: &Value,
    rules: &EnvelopeRules,
    parser: &P,
) -> Result<Envelope<P::Item>, MalformedMessage> {
    let object = value.as_object().ok_or(MalformedMessage::NotAnObject)?;

    let version = parse_version(object, rules.expected_version)?;
    let module = parse_module(object, "module", rules)?
        .ok_or(MalformedMessage::MissingField("module"))?;
    let module_key = parse_module(object, "moduleKey", rules)?.unwrap_or(module);

    let run_id = required_string(object, "runId")?;
    let message_key = required_string(object, "messageKey")?;
    let user_id = required_string(object, "userId")?;

    let generated_at = required_timestamp(object, "generatedAt")?;
    let expires_at = required_timestamp(object, "expiresAt")?;

    let allocation_mode = match object.get("allocationMode") {
        None | Some(Value::Null) => None,
        Some(Value::String(mode)) => Some(mode.clone()),
        Some(_) => {
            return Err(MalformedMessage::InvalidField {
                field: "allocationMode",
                reason: "expected a string".to_string(),
            });
        }
    };

    let items = object
        .get("inferences")
        .and_then(Value::as_array)
        .ok_or(MalformedMessage::InferencesNotList)?;

    let inferences = items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            parser
                .parse_item(item)
                .map_err(|source| MalformedMessage::InvalidItem { index, source })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Envelope {
        version,
        module,
        module_key,
        run_id,
        message_key,
        user_id,
        generated_at,
        expires_at,
        allocation_mode,
        inferences,
    })
}

fn parse_version(object: &Map<String, Value>, expected: u32) -> Result<u32, MalformedMessage> {
    let raw = object
        .get("version")
        .ok_or(MalformedMessage::MissingField("version"))?;

    match raw.as_u64().and_then(|version| u32::try_from(version).ok()) {
        Some(version) if version == expected => Ok(version),
        _ => Err(MalformedMessage::UnsupportedVersion {
            expected,
            found: raw.to_string(),
        }),
    }
}

/// `Ok(None)` when the field is absent. A present field must resolve to
/// the consumer's module.
fn parse_module(
    object: &Map<String, Value>,
    field: &'static str,
    rules: &EnvelopeRules,
) -> Result<Option<ModuleKind>, MalformedMessage> {
    let name = match object.get(field) {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::String(name)) => name,
        Some(_) => {
            return Err(MalformedMessage::InvalidField {
                field,
                reason: "expected a string".to_string(),
            });
        }
    };

    match rules.aliases.resolve(name) {
        Some(module) if module == rules.module => Ok(Some(module)),
        _ => Err(MalformedMessage::UnexpectedModule {
            expected: rules.module,
            found: name.clone(),
        }),
    }
}

fn required_string(
    object: &Map<String, Value>,
    field: &'static str,
) -> Result<String, MalformedMessage> {
    match object.get(field) {
        None | Some(Value::Null) => Err(MalformedMessage::MissingField(field)),
        Some(Value::String(value)) if value.trim().is_empty() => {
            Err(MalformedMessage::MissingField(field))
        }
        Some(Value::String(value)) => Ok(value.trim().to_string()),
        Some(_) => Err(MalformedMessage::InvalidField {
            field,
            reason: "expected a string".to_string(),
        }),
    }
}

fn required_timestamp(
    object: &Map<String, Value>,
    field: &'static str,
) -> Result<DateTime<Utc>, MalformedMessage> {
    let raw = required_string(object, field)?;

    DateTime::parse_from_rfc3339(&raw)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|_| MalformedMessage::InvalidTimestamp { field, value: raw })
}
