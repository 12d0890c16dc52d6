//! Static access policy - an in-memory grant table
//!
//! Grants are keyed by ability. A grant with id `*` covers every id in its
//! container. Admin viewers are granted everything.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use crate::context::Viewer;
use crate::visibility::{AccessError, AccessPolicy, AccessQuery};
use crate::reference::Target;

pub const WILDCARD_ID: &str = "*";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grants(pub HashMap<String, Vec<Target>>);

impl Grants {
    fn allows(&self, ability: &str, target: &Target) -> bool {
        self.0.get(ability).is_some_and(|granted| {
            granted.iter().any(|g| {
                g == target || (g.id == WILDCARD_ID && g.container == target.container)
            })
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StaticPolicy {
    /// Granted to everyone, anonymous viewers included.
    #[serde(default)]
    pub public: Grants,
    /// Granted per username, on top of `public`.
    #[serde(default)]
    pub users: HashMap<String, Grants>,
}

impl StaticPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_file(path: &Path) -> Result<Self, AccessError> {
        let content = fs::read_to_string(path)
            .map_err(|e| AccessError::new("load", format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&content)
            .map_err(|e| AccessError::new("load", format!("{}: {}", path.display(), e)))
    }

    pub fn grant_public(mut self, ability: &str, target: Target) -> Self {
        self.public.0.entry(ability.to_string()).or_default().push(target);
        self
    }

    pub fn grant(mut self, username: &str, ability: &str, target: Target) -> Self {
        self.users
            .entry(username.to_string())
            .or_default()
            .0
            .entry(ability.to_string())
            .or_default()
            .push(target);
        self
    }

    fn allows(&self, viewer: Option<&Viewer>, ability: &str, target: &Target) -> bool {
        if self.public.allows(ability, target) {
            return true;
        }
        match viewer {
            Some(v) if v.admin => true,
            Some(v) => self
                .users
                .get(&v.username)
                .is_some_and(|g| g.allows(ability, target)),
            None => false,
        }
    }
}

impl AccessPolicy for StaticPolicy {
    fn permitted(
        &self,
        viewer: Option<&Viewer>,
        query: &AccessQuery,
    ) -> Result<HashSet<Target>, AccessError> {
        Ok(query
            .targets
            .iter()
            .filter(|t| self.allows(viewer, &query.ability, t))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_and_user_grants() {
        let policy = StaticPolicy::new()
            .grant_public("read_issue", Target::scoped("pub/p", WILDCARD_ID))
            .grant("alice", "read_issue", Target::scoped("priv/p", "7"));
        let query = AccessQuery::new(
            "read_issue",
            [
                Target::scoped("pub/p", "1"),
                Target::scoped("priv/p", "7"),
                Target::scoped("priv/p", "8"),
            ],
        );

        let anon = policy.permitted(None, &query).unwrap();
        assert_eq!(anon.len(), 1);

        let alice = Viewer::new(1, "alice");
        let seen = policy.permitted(Some(&alice), &query).unwrap();
        assert_eq!(seen.len(), 2);
        assert!(!seen.contains(&Target::scoped("priv/p", "8")));
    }

    #[test]
    fn test_admin_sees_everything() {
        let mut admin = Viewer::new(2, "root");
        admin.admin = true;
        let query = AccessQuery::new("read_code", [Target::scoped("x/y", "abc1234")]);
        assert_eq!(StaticPolicy::new().permitted(Some(&admin), &query).unwrap().len(), 1);
    }

    #[test]
    fn test_load_from_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.json");
        fs::write(
            &path,
            r#"{"public": {"read_project": [{"id": "g/p"}]},
                "users": {"bob": {"read_snippet": [{"id": "12"}]}}}"#,
        )
        .unwrap();
        let policy = StaticPolicy::from_file(&path).unwrap();
        let bob = Viewer::new(3, "bob");
        let q = AccessQuery::new("read_snippet", [Target::global("12")]);
        assert_eq!(policy.permitted(Some(&bob), &q).unwrap().len(), 1);
        assert!(policy.permitted(None, &q).unwrap().is_empty());
    }
}
