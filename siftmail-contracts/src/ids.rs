use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Stable identifier for a task (one scan request) across its lifetime.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Dense index into the symbol cache's rule arena. Stable for the lifetime
/// of a loaded configuration; never reused across a config reload.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuleId(pub u32);

impl RuleId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A rule's stable name, interned once at load time.
///
/// Bounded to 128 bytes per spec §3; construction validates the bound so the
/// invariant cannot be violated once a `RuleName` exists.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct RuleName(Arc<str>);

/// A rule name longer than the 128-byte limit in spec §3 was rejected.
#[derive(Debug, thiserror::Error)]
#[error("rule name {0:?} exceeds the 128-byte limit ({} bytes)", .0.len())]
pub struct RuleNameTooLong(String);

impl RuleName {
    pub const MAX_LEN: usize = 128;

    pub fn new(name: impl Into<String>) -> Result<Self, RuleNameTooLong> {
        let name = name.into();
        if name.len() > Self::MAX_LEN {
            return Err(RuleNameTooLong(name));
        }
        Ok(Self(Arc::from(name)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RuleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for RuleName {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for RuleName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        RuleName::new(raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_oversize_names() {
        let too_long = "x".repeat(RuleName::MAX_LEN + 1);
        assert!(RuleName::new(too_long).is_err());
    }

    #[test]
    fn accepts_boundary_length() {
        let exact = "x".repeat(RuleName::MAX_LEN);
        assert!(RuleName::new(exact).is_ok());
    }
}
