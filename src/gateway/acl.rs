//! Access control for the control protocol.

use crate::core::errors::{ConvoyError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Wildcard entry admitting every caller
pub const ACL_ALLOW_ALL: &str = "*";

/// Authenticated identity of a control protocol caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub principal: String,
    #[serde(default)]
    pub groups: Vec<String>,
}

impl Caller {
    pub fn new(principal: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            groups: Vec::new(),
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.groups.push(group.into());
        self
    }
}

/// Gateway operations subject to the access check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    SubmitCluster,
    GetStatus,
    Flex,
    StopCluster,
    ListInstances,
    RetryLifecycle,
    ListClusters,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SubmitCluster => "submit_cluster",
            Self::GetStatus => "get_status",
            Self::Flex => "flex",
            Self::StopCluster => "stop_cluster",
            Self::ListInstances => "list_instances",
            Self::RetryLifecycle => "retry_lifecycle",
            Self::ListClusters => "list_clusters",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Principal list check. Entries starting with `@` name groups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPolicy {
    allow_all: bool,
    principals: BTreeSet<String>,
    groups: BTreeSet<String>,
}

impl AccessPolicy {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut policy = Self {
            allow_all: false,
            principals: BTreeSet::new(),
            groups: BTreeSet::new(),
        };
        for entry in entries {
            let entry = entry.as_ref().trim();
            if entry.is_empty() {
                continue;
            }
            if entry == ACL_ALLOW_ALL {
                policy.allow_all = true;
            } else if let Some(group) = entry.strip_prefix('@') {
                policy.groups.insert(group.to_string());
            } else {
                policy.principals.insert(entry.to_string());
            }
        }
        policy
    }

    pub fn allow_all() -> Self {
        Self::new([ACL_ALLOW_ALL])
    }

    pub fn is_allowed(&self, caller: &Caller) -> bool {
        self.allow_all
            || self.principals.contains(&caller.principal)
            || caller.groups.iter().any(|g| self.groups.contains(g))
    }

    pub fn check(&self, caller: &Caller, operation: Operation) -> Result<()> {
        if self.is_allowed(caller) {
            Ok(())
        } else {
            tracing::warn!(principal = %caller.principal, operation = %operation, "Control request denied");
            Err(ConvoyError::authorization(operation.as_str()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_principals_and_groups() {
        let policy = AccessPolicy::new(["alice", " @ops ", ""]);
        assert!(policy.check(&Caller::new("alice"), Operation::StopCluster).is_ok());
        assert!(policy.check(&Caller::new("bob").with_group("ops"), Operation::Flex).is_ok());

        let err = policy.check(&Caller::new("mallory"), Operation::StopCluster).unwrap_err();
        assert!(matches!(err, ConvoyError::Authorization { ref operation } if operation == "stop_cluster"));
    }

    #[test]
    fn test_wildcard_and_empty() {
        assert!(AccessPolicy::allow_all().is_allowed(&Caller::new("anyone")));
        assert!(!AccessPolicy::new(Vec::<String>::new()).is_allowed(&Caller::new("anyone")));
    }
}
