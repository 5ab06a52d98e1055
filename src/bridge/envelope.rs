//! Envelope
//!
//! The single message unit exchanged over a channel. The textual form is a
//! JSON object; `correlationId` is the one correlation field name on the
//! wire, and `""` marks a fire-and-forget message.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;

/// Identifier of a binding object. Id 0 is the extension root.
pub type ObjectId = u32;

/// The extension root / singleton, not an instance.
pub const ROOT_OBJECT_ID: ObjectId = 0;

/// Command used by native to refresh a mirrored property.
pub const UPDATE_PROPERTY: &str = "updateProperty";

/// Token linking an outbound call to its eventual reply.
///
/// Always non-zero; zero on the wire (binary frames) or an empty string
/// (text frames) means "no reply expected".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(pub u32);

impl CorrelationId {
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a message is addressed on the client side.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    /// The extension object itself (object id 0).
    Extension,
    /// A live binding object.
    Object(ObjectId),
    /// A named constructor proxy rather than an instance.
    Constructor(String),
}

impl Target {
    /// Resolve the target an inbound envelope is addressed to.
    pub fn of(envelope: &Envelope) -> Target {
        let object_id = envelope.object_id.unwrap_or(ROOT_OBJECT_ID);
        if object_id > ROOT_OBJECT_ID {
            return Target::Object(object_id);
        }
        match envelope.constructor_name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => Target::Constructor(name.to_string()),
            _ => Target::Extension,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Extension => write!(f, "extension"),
            Target::Object(id) => write!(f, "object {}", id),
            Target::Constructor(name) => write!(f, "constructor {}", name),
        }
    }
}

/// Wire message.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(alias = "command")]
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(rename = "correlationId", default, with = "correlation_marker")]
    pub correlation_id: Option<CorrelationId>,
    #[serde(rename = "objectId", default, skip_serializing_if = "Option::is_none")]
    pub object_id: Option<ObjectId>,
    #[serde(
        rename = "constructorName",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub constructor_name: Option<String>,
    /// Property name for `getProperty` / `setProperty` / `updateProperty`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Envelope {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            ..Default::default()
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_correlation(mut self, id: CorrelationId) -> Self {
        self.correlation_id = Some(id);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Address the envelope to `target`.
    pub fn addressed_to(mut self, target: &Target) -> Self {
        match target {
            Target::Extension => {
                self.object_id = None;
                self.constructor_name = None;
            }
            Target::Object(id) => {
                self.object_id = Some(*id);
                self.constructor_name = None;
            }
            Target::Constructor(name) => {
                self.object_id = None;
                self.constructor_name = Some(name.clone());
            }
        }
        self
    }

    pub fn target(&self) -> Target {
        Target::of(self)
    }

    /// Interpret this envelope as a reply.
    ///
    /// `data.error` set to anything but `null`, `false` or `""` is a failure
    /// carrying that value. Otherwise the value is `data.body`, then `data`,
    /// then `args`.
    pub fn outcome(&self) -> Result<Value, Value> {
        if let Some(Value::Object(map)) = &self.data {
            if let Some(error) = map.get("error") {
                if is_error_value(error) {
                    return Err(error.clone());
                }
            }
            if let Some(body) = map.get("body") {
                return Ok(body.clone());
            }
        }
        Ok(self.payload())
    }

    /// Event payload: `data` if present, else `args` as an array.
    pub fn payload(&self) -> Value {
        match &self.data {
            Some(data) => data.clone(),
            None if !self.args.is_empty() => Value::Array(self.args.clone()),
            None => Value::Null,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

fn is_error_value(value: &Value) -> bool {
    match value {
        Value::Null | Value::Bool(false) => false,
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

mod correlation_marker {
    use super::*;
    use serde::de::Error as _;

    pub fn serialize<S: Serializer>(
        id: &Option<CorrelationId>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match id {
            Some(id) => serializer.serialize_u32(id.0),
            None => serializer.serialize_str(""),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<CorrelationId>, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        let number = match raw {
            Value::Null => return Ok(None),
            Value::String(s) if s.trim().is_empty() => return Ok(None),
            Value::String(s) => s
                .trim()
                .parse::<u32>()
                .map_err(|e| D::Error::custom(format!("correlation id `{}`: {}", s, e)))?,
            Value::Number(n) => n
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| D::Error::custom(format!("correlation id {} out of range", n)))?,
            other => {
                return Err(D::Error::custom(format!(
                    "correlation id must be a number or string, got {}",
                    other
                )));
            }
        };
        Ok((number > 0).then_some(CorrelationId(number)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fire_and_forget_serializes_empty_marker() {
        let env = Envelope::new("halfclose").addressed_to(&Target::Object(3));
        let value: Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        assert_eq!(value, json!({"cmd": "halfclose", "correlationId": "", "objectId": 3}));
    }

    #[test]
    fn correlated_call_serializes_numeric_marker() {
        let env = Envelope::new("msg_smsSend")
            .with_data(json!({"phone": "+15551234", "message": "hi", "serviceID": 0}))
            .with_correlation(CorrelationId(7));
        let value: Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        assert_eq!(value["correlationId"], json!(7));
        assert_eq!(value["data"]["phone"], json!("+15551234"));
        assert!(value.get("objectId").is_none());
    }

    #[test]
    fn marker_accepts_strings_null_and_missing() {
        let a = Envelope::from_json(r#"{"cmd":"x","correlationId":"12"}"#).unwrap();
        assert_eq!(a.correlation_id, Some(CorrelationId(12)));
        let b = Envelope::from_json(r#"{"cmd":"x","correlationId":null}"#).unwrap();
        assert_eq!(b.correlation_id, None);
        let c = Envelope::from_json(r#"{"command":"x"}"#).unwrap();
        assert_eq!(c.cmd, "x");
        assert_eq!(c.correlation_id, None);
        assert!(Envelope::from_json(r#"{"cmd":"x","correlationId":"abc"}"#).is_err());
    }

    #[test]
    fn outcome_prefers_error_then_body() {
        let ok = Envelope::new("r").with_data(json!({"body": {"id": 1}, "error": null}));
        assert_eq!(ok.outcome(), Ok(json!({"id": 1})));

        let failed = Envelope::new("r").with_data(json!({"body": {}, "error": "bad number"}));
        assert_eq!(failed.outcome(), Err(json!("bad number")));

        let falsy = Envelope::new("r").with_data(json!({"error": false, "free": 10}));
        assert_eq!(falsy.outcome(), Ok(json!({"error": false, "free": 10})));

        let args = Envelope::new("r").with_args(vec![json!(1), json!("two")]);
        assert_eq!(args.outcome(), Ok(json!([1, "two"])));
    }

    #[test]
    fn target_resolution() {
        let ctor = Envelope::from_json(r#"{"cmd":"e","objectId":0,"constructorName":" Socket "}"#)
            .unwrap();
        assert_eq!(ctor.target(), Target::Constructor("Socket".into()));
        let obj = Envelope::from_json(r#"{"cmd":"e","objectId":4,"constructorName":"Socket"}"#)
            .unwrap();
        assert_eq!(obj.target(), Target::Object(4));
        assert_eq!(Envelope::new("e").target(), Target::Extension);
    }
}
