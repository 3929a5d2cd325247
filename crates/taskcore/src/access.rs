use crate::RunId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Permissions checked against a run's access scope.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Read,
    /// "Trigger build": lets anyone holding it complete unassigned tasks.
    Build,
    Cancel,
    Configure,
    Administer,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Permission::Read => "read",
            Permission::Build => "build",
            Permission::Cancel => "cancel",
            Permission::Configure => "configure",
            Permission::Administer => "administer",
        };
        f.write_str(name)
    }
}

/// Capability check used by tasks to decide who may see or resolve them.
///
/// `identity` is `None` for anonymous callers. Implementations must fail closed.
pub trait AccessControl: Send + Sync {
    fn has_permission(&self, scope: &RunId, identity: Option<&str>, permission: Permission) -> bool;
}

/// Grants everything to everyone. Useful for embedded engines and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unrestricted;

impl AccessControl for Unrestricted {
    fn has_permission(&self, _scope: &RunId, _identity: Option<&str>, _permission: Permission) -> bool {
        true
    }
}
