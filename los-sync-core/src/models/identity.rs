use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use super::row::{Row, UUID_FIELD};

/// How a table identifies a logical record across both stores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityKind {
    /// Keyed by the generated `uuid` field.
    Uuid,
    /// Keyed by one or more business fields, e.g. `date`.
    Natural(Vec<String>),
}

impl IdentityKind {
    pub fn natural<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        IdentityKind::Natural(fields.into_iter().map(Into::into).collect())
    }

    /// Fields that make up the identity, in key order.
    pub fn fields(&self) -> Vec<&str> {
        match self {
            IdentityKind::Uuid => vec![UUID_FIELD],
            IdentityKind::Natural(fields) => fields.iter().map(String::as_str).collect(),
        }
    }

    /// Resolves the identity of a row, or `None` when a key field is
    /// missing, null, or not a scalar.
    pub fn resolve(&self, row: &Row) -> Option<Identity> {
        match self {
            IdentityKind::Uuid => row
                .uuid()
                .filter(|u| !u.is_empty())
                .map(|u| Identity::Uuid(u.to_string())),
            IdentityKind::Natural(fields) => fields
                .iter()
                .map(|f| row.get(f).and_then(scalar_key))
                .collect::<Option<Vec<_>>>()
                .map(Identity::Natural),
        }
    }

    /// Parses an identity back from its [`Identity::key`] form.
    pub fn parse_key(&self, key: &str) -> Result<Identity, IdentityError> {
        if key.is_empty() {
            return Err(IdentityError::Empty);
        }
        match self {
            IdentityKind::Uuid => Ok(Identity::Uuid(key.to_string())),
            IdentityKind::Natural(fields) if fields.len() == 1 => {
                Ok(Identity::Natural(vec![key.to_string()]))
            }
            IdentityKind::Natural(fields) => {
                let parts: Vec<String> = serde_json::from_str(key)
                    .map_err(|_| IdentityError::InvalidKey(key.to_string()))?;
                if parts.len() != fields.len() {
                    return Err(IdentityError::WrongArity {
                        expected: fields.len(),
                        got: parts.len(),
                    });
                }
                Ok(Identity::Natural(parts))
            }
        }
    }
}

/// Text form of a scalar key value. Numbers and booleans are accepted so
/// that a key stored as `7` on one side matches `"7"` on the other.
pub(crate) fn scalar_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// The resolved identity of one logical record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Identity {
    Uuid(String),
    Natural(Vec<String>),
}

impl Identity {
    /// Stable single-string key used by the deletion log and in URLs.
    ///
    /// A uuid or a single natural value is used as-is; composite natural
    /// keys are encoded as a JSON array.
    pub fn key(&self) -> String {
        match self {
            Identity::Uuid(u) => u.clone(),
            Identity::Natural(parts) if parts.len() == 1 => parts[0].clone(),
            Identity::Natural(parts) => {
                serde_json::to_string(parts).unwrap_or_else(|_| parts.join(","))
            }
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("Identity key is empty")]
    Empty,

    #[error("Invalid composite identity key: {0}")]
    InvalidKey(String),

    #[error("Identity key has {got} part(s), expected {expected}")]
    WrongArity { expected: usize, got: usize },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        Row::from_value(value).unwrap()
    }

    #[test]
    fn test_resolve_uuid() {
        let kind = IdentityKind::Uuid;
        assert_eq!(
            kind.resolve(&row(json!({"uuid": "abc"}))),
            Some(Identity::Uuid("abc".to_string()))
        );
        assert_eq!(kind.resolve(&row(json!({"uuid": ""}))), None);
        assert_eq!(kind.resolve(&row(json!({"text": "no id"}))), None);
    }

    #[test]
    fn test_resolve_composite_natural_key() {
        let kind = IdentityKind::natural(["date", "habitKey"]);
        let identity = kind
            .resolve(&row(json!({"date": "2024-03-14", "habitKey": "read", "value": 0})))
            .unwrap();
        assert_eq!(
            identity,
            Identity::Natural(vec!["2024-03-14".to_string(), "read".to_string()])
        );
        assert_eq!(kind.resolve(&row(json!({"date": "2024-03-14"}))), None);
    }

    #[test]
    fn test_numeric_key_matches_string_key() {
        let kind = IdentityKind::natural(["settingKey"]);
        assert_eq!(
            kind.resolve(&row(json!({"settingKey": 7}))),
            kind.resolve(&row(json!({"settingKey": "7"})))
        );
    }

    #[test]
    fn test_key_and_parse_key() {
        let single = IdentityKind::natural(["date"]);
        let identity = Identity::Natural(vec!["2024-03-14".to_string()]);
        assert_eq!(identity.key(), "2024-03-14");
        assert_eq!(single.parse_key(&identity.key()).unwrap(), identity);

        let composite = IdentityKind::natural(["date", "habitKey"]);
        let identity = Identity::Natural(vec!["2024-03-14".to_string(), "read".to_string()]);
        assert_eq!(identity.key(), r#"["2024-03-14","read"]"#);
        assert_eq!(composite.parse_key(&identity.key()).unwrap(), identity);

        assert!(matches!(
            composite.parse_key(r#"["2024-03-14"]"#),
            Err(IdentityError::WrongArity { expected: 2, got: 1 })
        ));
        assert!(matches!(IdentityKind::Uuid.parse_key(""), Err(IdentityError::Empty)));
    }
}
