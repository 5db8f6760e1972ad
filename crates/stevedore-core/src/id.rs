//! Identifiers — run spec path ids and instance ids.
//!
//! Run specs are addressed by absolute, forward-slash delimited paths
//! (`/payments/api`). Instance ids are opaque strings tied to exactly
//! one run spec: `{run_spec_id}.{suffix}`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Hierarchical path id of a run spec, e.g. `/payments/api`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunSpecId(String);

impl RunSpecId {
    /// Parse and validate an absolute path id.
    pub fn parse(raw: &str) -> CoreResult<Self> {
        if !raw.starts_with('/') || raw.len() < 2 {
            return Err(CoreError::InvalidRunSpecId(raw.to_string()));
        }
        if raw[1..].split('/').any(|seg| seg.is_empty()) {
            return Err(CoreError::InvalidRunSpecId(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    /// The group root path.
    pub fn root() -> Self {
        Self("/".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path segments, in order.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|s| !s.is_empty())
    }
}

impl fmt::Display for RunSpecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque id of one instance of a run spec.
///
/// The run spec prefix is recoverable, which lets stream consumers route
/// updates without a tracker lookup.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    /// Build an instance id for a run spec with the given unique suffix.
    pub fn for_run_spec(run_spec: &RunSpecId, suffix: &str) -> Self {
        Self(format!("{}.{}", run_spec, suffix))
    }

    /// The run spec id this instance belongs to.
    pub fn run_spec_id(&self) -> CoreResult<RunSpecId> {
        let prefix = self
            .0
            .rsplit_once('.')
            .map(|(p, _)| p)
            .ok_or_else(|| CoreError::InvalidInstanceId(self.0.clone()))?;
        RunSpecId::parse(prefix)
            .map_err(|_| CoreError::InvalidInstanceId(self.0.clone()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_absolute_paths() {
        let id = RunSpecId::parse("/foo/bar").unwrap();
        assert_eq!(id.as_str(), "/foo/bar");
        assert_eq!(id.segments().collect::<Vec<_>>(), vec!["foo", "bar"]);
    }

    #[test]
    fn rejects_relative_and_empty_segments() {
        assert!(RunSpecId::parse("foo/bar").is_err());
        assert!(RunSpecId::parse("/foo//bar").is_err());
        assert!(RunSpecId::parse("/").is_err());
        assert!(RunSpecId::parse("").is_err());
    }

    #[test]
    fn instance_id_recovers_run_spec() {
        let spec = RunSpecId::parse("/foo/app1").unwrap();
        let inst = InstanceId::for_run_spec(&spec, "a1b2c3");
        assert_eq!(inst.as_str(), "/foo/app1.a1b2c3");
        assert_eq!(inst.run_spec_id().unwrap(), spec);
    }

    #[test]
    fn ids_order_lexicographically() {
        let a = InstanceId::for_run_spec(&RunSpecId::parse("/a").unwrap(), "1");
        let b = InstanceId::for_run_spec(&RunSpecId::parse("/a").unwrap(), "2");
        assert!(a < b);
    }
}
