use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which of the two stores a value belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// The mobile client's embedded store.
    Local,
    /// The desktop/server store.
    Remote,
}

impl Side {
    pub fn other(self) -> Self {
        match self {
            Side::Local => Side::Remote,
            Side::Remote => Side::Local,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Local => write!(f, "local"),
            Side::Remote => write!(f, "remote"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Invalid side '{0}'. Valid values: local, remote")]
pub struct ParseSideError(String);

impl FromStr for Side {
    type Err = ParseSideError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" | "mobile" => Ok(Side::Local),
            "remote" | "desktop" | "server" => Ok(Side::Remote),
            _ => Err(ParseSideError(s.to_string())),
        }
    }
}

/// How a store lays out aggregate tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layout {
    /// Parent rows and child rows live in separate tables.
    Normalized,
    /// One document per aggregate with the children nested as arrays.
    Document,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_parse() {
        assert_eq!("local".parse::<Side>().unwrap(), Side::Local);
        assert_eq!("Desktop".parse::<Side>().unwrap(), Side::Remote);
        assert!("both".parse::<Side>().is_err());
    }

    #[test]
    fn test_side_other() {
        assert_eq!(Side::Local.other(), Side::Remote);
        assert_eq!(Side::Remote.other(), Side::Local);
    }
}
