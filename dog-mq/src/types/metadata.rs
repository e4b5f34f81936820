use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::BrokerConfig;
use crate::error::{BrokerError, BrokerResult};

/// Reserved keys always count as present for `replace` and `remove`
const RESERVED_KEYS: &[&str] = &[
    "_default_message_ttl",
    "_max_messages_post_size",
    "_default_message_delay",
    "_dead_letter_queue",
    "_dead_letter_queue_messages_ttl",
    "_max_claim_count",
    "_enable_encrypt_messages",
    "_flavor",
];

/// Queue metadata: named reserved settings plus free-form user keys.
///
/// Reserved keys keep their `_`-prefixed wire names so stored and listed
/// metadata looks the same to clients. Any other `_`-prefixed key is rejected.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueMetadata {
    #[serde(rename = "_default_message_ttl", default, skip_serializing_if = "Option::is_none")]
    pub default_message_ttl: Option<u64>,

    #[serde(rename = "_max_messages_post_size", default, skip_serializing_if = "Option::is_none")]
    pub max_messages_post_size: Option<usize>,

    #[serde(rename = "_default_message_delay", default, skip_serializing_if = "Option::is_none")]
    pub default_message_delay: Option<u64>,

    /// Name of the queue (same project) receiving messages claimed too often
    #[serde(rename = "_dead_letter_queue", default, skip_serializing_if = "Option::is_none")]
    pub dead_letter_queue: Option<String>,

    #[serde(
        rename = "_dead_letter_queue_messages_ttl",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub dead_letter_queue_messages_ttl: Option<u64>,

    #[serde(rename = "_max_claim_count", default, skip_serializing_if = "Option::is_none")]
    pub max_claim_count: Option<u32>,

    /// Seal bodies at rest; needs a configured message encryption key
    #[serde(rename = "_enable_encrypt_messages", default, skip_serializing_if = "Option::is_none")]
    pub enable_encrypt_messages: Option<bool>,

    #[serde(rename = "_flavor", default, skip_serializing_if = "Option::is_none")]
    pub flavor: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl QueueMetadata {
    /// Parse a client-supplied JSON object
    pub fn from_map(map: Map<String, Value>) -> BrokerResult<Self> {
        let meta: Self = serde_json::from_value(Value::Object(map))
            .map_err(|e| BrokerError::validation(format!("invalid queue metadata: {e}")))?;
        if let Some(key) = meta.extra.keys().find(|k| k.starts_with('_')) {
            return Err(BrokerError::validation(format!(
                "unknown reserved metadata key: {key}"
            )));
        }
        Ok(meta)
    }

    pub fn to_map(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }

    /// Size of the serialized form, the unit `max_queue_metadata` limits
    pub fn encoded_len(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(usize::MAX)
    }

    pub fn with_user_key(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Fill the message defaults a reader sees when the owner never set them
    pub fn with_defaults(mut self, config: &BrokerConfig) -> Self {
        self.default_message_ttl = self.default_message_ttl.or(Some(config.default_message_ttl));
        self.max_messages_post_size = self
            .max_messages_post_size
            .or(Some(config.max_messages_post_size));
        self.default_message_delay = self
            .default_message_delay
            .or(Some(config.default_message_delay));
        self
    }

    /// Apply patch operations in order, all or nothing
    pub fn patched(&self, ops: &[MetadataPatch]) -> BrokerResult<Self> {
        let mut map = self.to_map();
        for patch in ops {
            let op: PatchOp = patch.op.parse()?;
            let key = patch.key_name()?;
            match op {
                PatchOp::Add => {
                    map.insert(key.to_string(), patch.required_value()?);
                }
                PatchOp::Replace => {
                    if !map.contains_key(key) && !RESERVED_KEYS.contains(&key) {
                        return Err(BrokerError::Conflict(format!(
                            "cannot replace missing metadata key {key}"
                        )));
                    }
                    map.insert(key.to_string(), patch.required_value()?);
                }
                PatchOp::Remove => {
                    if map.remove(key).is_none() && !RESERVED_KEYS.contains(&key) {
                        return Err(BrokerError::Conflict(format!(
                            "cannot remove missing metadata key {key}"
                        )));
                    }
                }
            }
        }
        Self::from_map(map)
    }
}

/// Metadata patch verbs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOp {
    Add,
    Replace,
    Remove,
}

impl fmt::Display for PatchOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Add => "add",
            Self::Replace => "replace",
            Self::Remove => "remove",
        })
    }
}

impl FromStr for PatchOp {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "add" => Ok(Self::Add),
            "replace" => Ok(Self::Replace),
            "remove" => Ok(Self::Remove),
            other => Err(BrokerError::validation(format!(
                "unsupported metadata patch op: {other}"
            ))),
        }
    }
}

/// One client-supplied metadata edit.
///
/// `op` stays a string so unknown verbs surface as validation failures
/// rather than deserialization errors. `path` is either a bare key or
/// `/metadata/<key>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataPatch {
    pub op: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl MetadataPatch {
    pub fn add(key: &str, value: Value) -> Self {
        Self {
            op: PatchOp::Add.to_string(),
            path: key.to_string(),
            value: Some(value),
        }
    }

    pub fn replace(key: &str, value: Value) -> Self {
        Self {
            op: PatchOp::Replace.to_string(),
            path: key.to_string(),
            value: Some(value),
        }
    }

    pub fn remove(key: &str) -> Self {
        Self {
            op: PatchOp::Remove.to_string(),
            path: key.to_string(),
            value: None,
        }
    }

    fn key_name(&self) -> BrokerResult<&str> {
        let key = self
            .path
            .strip_prefix("/metadata/")
            .unwrap_or(self.path.trim_start_matches('/'));
        if key.is_empty() || key.contains('/') {
            return Err(BrokerError::validation(format!(
                "invalid metadata path: {}",
                self.path
            )));
        }
        Ok(key)
    }

    fn required_value(&self) -> BrokerResult<Value> {
        self.value
            .clone()
            .ok_or_else(|| BrokerError::validation(format!("{} requires a value", self.op)))
    }
}
