//! Typed ID definitions for cluster nodes, engine instances, and requests.

use sha2::{Digest, Sha256};

use crate::{define_id, IdError};

// =============================================================================
// ULID-backed IDs
// =============================================================================

define_id!(
    /// A cluster member able to host engine instances.
    NodeId,
    "node"
);

define_id!(
    /// Correlates one unit of work through runtime logs and telemetry.
    RequestId,
    "req"
);

// =============================================================================
// Engine Type
// =============================================================================

/// Maximum length of an engine type name.
const MAX_ENGINE_TYPE_LEN: usize = 64;

/// Name of a pluggable engine implementation (e.g. `code_analysis`).
///
/// Engine types are lowercase ASCII, start with a letter, and may contain
/// digits, `_`, `.` and `-`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EngineType(String);

impl EngineType {
    /// Validates and wraps an engine type name.
    pub fn new(value: impl Into<String>) -> Result<Self, IdError> {
        let value = value.into();
        let invalid = |reason| IdError::InvalidEngineType {
            value: value.clone(),
            reason,
        };

        let Some(first) = value.chars().next() else {
            return Err(IdError::Empty);
        };
        if value.len() > MAX_ENGINE_TYPE_LEN {
            return Err(invalid("longer than 64 characters"));
        }
        if !first.is_ascii_lowercase() {
            return Err(invalid("must start with a lowercase letter"));
        }
        if !value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '.' | '-'))
        {
            return Err(invalid("allowed characters are [a-z0-9_.-]"));
        }

        Ok(Self(value))
    }

    /// Returns the engine type name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EngineType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for EngineType {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for EngineType {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl serde::Serialize for EngineType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for EngineType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::new(s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Instance ID
// =============================================================================

/// Number of digest bytes kept in an instance ID.
const DIGEST_BYTES: usize = 8;

/// Identifier of one running engine instance.
///
/// Derived from the engine type and its start configuration, so two
/// instances started with the same config share the digest half and differ
/// only in their start timestamp.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceId {
    digest: String,
    started_ms: i64,
}

impl InstanceId {
    /// Derives an instance ID stamped with the current time.
    #[must_use]
    pub fn derive(engine_type: &EngineType, config: &serde_json::Value) -> Self {
        Self::derive_at(engine_type, config, chrono::Utc::now().timestamp_millis())
    }

    /// Derives an instance ID for an explicit start timestamp.
    #[must_use]
    pub fn derive_at(engine_type: &EngineType, config: &serde_json::Value, started_ms: i64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(engine_type.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(canonical_json(config).as_bytes());
        let digest = hasher.finalize();

        Self {
            digest: hex::encode(&digest[..DIGEST_BYTES]),
            started_ms,
        }
    }

    /// Parses an instance ID in the `{digest}-{timestamp}` format.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }

        let Some((digest, started)) = s.split_once('-') else {
            return Err(IdError::MissingSeparator('-'));
        };

        if digest.len() != DIGEST_BYTES * 2 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(IdError::InvalidFormat {
                message: format!("digest must be {} hex characters", DIGEST_BYTES * 2),
            });
        }

        let started_ms = started.parse::<i64>().map_err(|e| IdError::InvalidFormat {
            message: format!("timestamp: {e}"),
        })?;

        Ok(Self {
            digest: digest.to_ascii_lowercase(),
            started_ms,
        })
    }

    /// Returns the config digest half of the ID.
    #[must_use]
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Returns the start timestamp (milliseconds since the Unix epoch).
    #[must_use]
    pub const fn started_ms(&self) -> i64 {
        self.started_ms
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.digest, self.started_ms)
    }
}

impl std::str::FromStr for InstanceId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl serde::Serialize for InstanceId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for InstanceId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Produce canonical JSON (sorted keys, no extra whitespace).
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("{}:{}", quote(k), canonical_json(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(arr) => {
            let inner: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        serde_json::Value::String(s) => quote(s),
        other => other.to_string(),
    }
}

fn quote(s: &str) -> String {
    // serde_json's string encoder already escapes control characters.
    serde_json::Value::String(s.to_string()).to_string()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn engine(name: &str) -> EngineType {
        EngineType::new(name).unwrap()
    }

    #[test]
    fn test_node_id_roundtrip() {
        let id = NodeId::new();
        let parsed: NodeId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!(id.to_string().starts_with("node_"));
    }

    #[test]
    fn test_node_id_invalid_prefix() {
        let result: Result<NodeId, _> = "req_01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert!(result.unwrap_err().is_prefix_error());
    }

    #[test]
    fn test_node_id_missing_separator() {
        let result: Result<NodeId, _> = "node01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert_eq!(result.unwrap_err(), IdError::MissingSeparator('_'));
    }

    #[test]
    fn test_request_id_invalid_ulid() {
        let result: Result<RequestId, _> = "req_invalid".parse();
        assert!(matches!(result.unwrap_err(), IdError::InvalidUlid(_)));
    }

    #[test]
    fn test_node_id_json_roundtrip() {
        let id = NodeId::new();
        let json = serde_json::to_string(&id).unwrap();
        let parsed: NodeId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_engine_type_validation() {
        assert!(EngineType::new("code_analysis").is_ok());
        assert!(EngineType::new("codegen.v2").is_ok());
        assert!(EngineType::new("").unwrap_err().is_empty());
        assert!(matches!(
            EngineType::new("CodeGen"),
            Err(IdError::InvalidEngineType { .. })
        ));
        assert!(matches!(
            EngineType::new("9lives"),
            Err(IdError::InvalidEngineType { .. })
        ));
        assert!(matches!(
            EngineType::new("has space"),
            Err(IdError::InvalidEngineType { .. })
        ));
    }

    #[test]
    fn test_instance_id_is_config_sensitive() {
        let a = InstanceId::derive_at(&engine("codegen"), &json!({"model": "a"}), 1);
        let b = InstanceId::derive_at(&engine("codegen"), &json!({"model": "b"}), 1);
        let c = InstanceId::derive_at(&engine("analysis"), &json!({"model": "a"}), 1);
        assert_ne!(a.digest(), b.digest());
        assert_ne!(a.digest(), c.digest());
    }

    #[test]
    fn test_instance_id_ignores_key_order() {
        let a: serde_json::Value = serde_json::from_str(r#"{"x":1,"y":[1,2]}"#).unwrap();
        let b: serde_json::Value = serde_json::from_str(r#"{"y":[1,2],"x":1}"#).unwrap();
        let engine = engine("codegen");
        assert_eq!(
            InstanceId::derive_at(&engine, &a, 7),
            InstanceId::derive_at(&engine, &b, 7)
        );
    }

    #[test]
    fn test_instance_id_timestamp_distinguishes_restarts() {
        let engine = engine("codegen");
        let first = InstanceId::derive_at(&engine, &json!({}), 1000);
        let second = InstanceId::derive_at(&engine, &json!({}), 1001);
        assert_eq!(first.digest(), second.digest());
        assert!(first < second);
    }

    #[test]
    fn test_instance_id_parse_errors() {
        assert!(InstanceId::parse("").unwrap_err().is_empty());
        assert_eq!(
            InstanceId::parse("abc").unwrap_err(),
            IdError::MissingSeparator('-')
        );
        assert!(matches!(
            InstanceId::parse("zz-12"),
            Err(IdError::InvalidFormat { .. })
        ));
        assert!(matches!(
            InstanceId::parse("0123456789abcdef-later"),
            Err(IdError::InvalidFormat { .. })
        ));
    }

    proptest! {
        #[test]
        fn prop_instance_id_roundtrip(model in "[a-z]{0,12}", ts in 0i64..i64::MAX) {
            let id = InstanceId::derive_at(&engine("codegen"), &json!({ "model": model }), ts);
            let parsed: InstanceId = id.to_string().parse().unwrap();
            prop_assert_eq!(id, parsed);
        }

        #[test]
        fn prop_engine_type_roundtrip(name in "[a-z][a-z0-9_.-]{0,40}") {
            let parsed: EngineType = name.parse().unwrap();
            prop_assert_eq!(parsed.as_str(), name.as_str());
        }
    }
}
