//! InstanceId: Identifier of a member in the cluster.
//!
//! Wraps a u32 and displays as its decimal value, which is also the form
//! used when an instance is written into a message `to`/`from` header.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InstanceIdError {
    #[error("Invalid instance ID: expected a non-negative integer, got {0:?}")]
    InvalidFormat(String),
}

/// Identifier of a cluster member.
///
/// # Examples
/// ```
/// use ha_core::InstanceId;
///
/// let id = InstanceId::new(3);
/// assert_eq!(id.to_string(), "3");
///
/// let parsed: InstanceId = "3".parse().unwrap();
/// assert_eq!(parsed, id);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(u32);

impl InstanceId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the underlying numeric value.
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl Display for InstanceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for InstanceId {
    type Err = InstanceIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u32>()
            .map(Self)
            .map_err(|_| InstanceIdError::InvalidFormat(s.to_string()))
    }
}

impl From<u32> for InstanceId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl From<InstanceId> for u32 {
    fn from(id: InstanceId) -> u32 {
        id.0
    }
}

// Serialize as a string so ids read the same in headers, logs and JSON
impl serde::Serialize for InstanceId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for InstanceId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
