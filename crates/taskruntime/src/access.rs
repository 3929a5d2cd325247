use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use taskcore::{AccessControl, Permission, RunId};

/// Flat permission grants: anonymous, any authenticated user, per-job users,
/// and administrators (who hold everything).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PermissionTable {
    #[serde(default)]
    pub anonymous: HashSet<Permission>,
    #[serde(default)]
    pub authenticated: HashSet<Permission>,
    #[serde(default)]
    pub administrators: HashSet<String>,
    /// job name -> user id -> permissions
    #[serde(default)]
    pub jobs: HashMap<String, HashMap<String, HashSet<Permission>>>,
}

impl PermissionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_administrator(mut self, user: impl Into<String>) -> Self {
        self.administrators.insert(user.into());
        self
    }

    pub fn grant_anonymous(mut self, permission: Permission) -> Self {
        self.anonymous.insert(permission);
        self
    }

    pub fn grant_authenticated(mut self, permission: Permission) -> Self {
        self.authenticated.insert(permission);
        self
    }

    pub fn grant(mut self, job: impl Into<String>, user: impl Into<String>, permission: Permission) -> Self {
        self.jobs
            .entry(job.into())
            .or_default()
            .entry(user.into())
            .or_default()
            .insert(permission);
        self
    }

    pub fn is_administrator(&self, identity: Option<&str>) -> bool {
        identity.map_or(false, |id| self.administrators.contains(id))
    }
}

impl AccessControl for PermissionTable {
    fn has_permission(&self, scope: &RunId, identity: Option<&str>, permission: Permission) -> bool {
        let Some(identity) = identity else {
            return self.anonymous.contains(&permission);
        };

        self.administrators.contains(identity)
            || self.anonymous.contains(&permission)
            || self.authenticated.contains(&permission)
            || self
                .jobs
                .get(&scope.job)
                .and_then(|users| users.get(identity))
                .map_or(false, |granted| granted.contains(&permission))
    }
}
