use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::error::ProtoError;
use crate::message::{Command, Event};

/// Hard cap on one serialized message, terminator excluded.
pub const MAX_MESSAGE_SIZE: usize = 4096;

/// A family of messages sharing one discriminator field.
pub trait Schema: Serialize + DeserializeOwned {
    const TAG: &'static str;
    const KINDS: &'static [&'static str];
}

impl Schema for Command {
    const TAG: &'static str = "action";
    const KINDS: &'static [&'static str] = &["start_mission", "get_status", "emergency_stop", "return_home"];
}

impl Schema for Event {
    const TAG: &'static str = "type";
    const KINDS: &'static [&'static str] = &[
        "telemetry",
        "status",
        "mission_confirmation",
        "navigation_update",
        "mission_status",
    ];
}

/// Outcome of decoding one line. Never an error: the caller decides what a
/// bad line means.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded<T> {
    Message(T),
    /// Structured, but the discriminator names nothing we know.
    UnknownKind(String),
    /// Free text that looks like a device status line.
    Diagnostic(String),
    Unrecognized { line: String, reason: String },
}

const DIAGNOSTIC_KEYWORDS: &[&str] = &[
    "ready", "gps", "fix", "mission", "waypoint", "navigat", "error", "warn", "status", "init",
];

/// Serialize to one compact line including the trailing `\n`.
/// Nothing is returned for messages over `MAX_MESSAGE_SIZE`, so a caller
/// that writes the result can never emit a truncated frame.
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, ProtoError> {
    let mut out = serde_json::to_vec(msg)?;
    if out.len() > MAX_MESSAGE_SIZE {
        return Err(ProtoError::TooLarge { size: out.len(), max: MAX_MESSAGE_SIZE });
    }
    out.push(b'\n');
    Ok(out)
}

pub fn decode<T: Schema>(line: &str) -> Decoded<T> {
    let line = line.trim();

    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            if is_diagnostic(line) {
                return Decoded::Diagnostic(line.to_owned());
            }
            return Decoded::Unrecognized { line: line.to_owned(), reason: e.to_string() };
        }
    };

    let kind = match value.as_object().map(|o| o.get(T::TAG)) {
        None => return unrecognized(line, "not an object"),
        Some(None) => return unrecognized(line, &format!("missing \"{}\"", T::TAG)),
        Some(Some(Value::String(k))) => k.clone(),
        Some(Some(_)) => return unrecognized(line, &format!("\"{}\" is not a string", T::TAG)),
    };

    if !T::KINDS.contains(&kind.as_str()) {
        return Decoded::UnknownKind(kind);
    }

    match serde_json::from_value::<T>(value) {
        Ok(msg) => Decoded::Message(msg),
        Err(e) => unrecognized(line, &format!("invalid {}: {}", kind, e)),
    }
}

fn unrecognized<T>(line: &str, reason: &str) -> Decoded<T> {
    Decoded::Unrecognized { line: line.to_owned(), reason: reason.to_owned() }
}

fn is_diagnostic(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    DIAGNOSTIC_KEYWORDS.iter().any(|k| lower.contains(k))
}
