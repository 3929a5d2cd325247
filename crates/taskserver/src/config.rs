use std::path::PathBuf;
use taskcore::Permission;
use taskruntime::PermissionTable;

/// Server settings read from the environment.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_address: String,
    pub data_dir: PathBuf,
    pub admins: Vec<String>,
    pub anonymous_read: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:3000".to_string(),
            data_dir: PathBuf::from("data"),
            admins: Vec::new(),
            anonymous_read: false,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            bind_address: lookup("BIND_ADDRESS").unwrap_or(defaults.bind_address),
            data_dir: lookup("TASKS_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            admins: lookup("TASKS_ADMINS")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            anonymous_read: lookup("TASKS_ANONYMOUS_READ")
                .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(defaults.anonymous_read),
        }
    }

    /// `<data_dir>/permissions.json` if present, otherwise authenticated users
    /// may read and build. Configured administrators are always added.
    pub fn permission_table(&self) -> anyhow::Result<PermissionTable> {
        let path = self.data_dir.join("permissions.json");
        let mut table = if path.exists() {
            serde_json::from_reader(std::fs::File::open(&path)?)?
        } else {
            PermissionTable::new()
                .grant_authenticated(Permission::Read)
                .grant_authenticated(Permission::Build)
        };
        if self.anonymous_read {
            table = table.grant_anonymous(Permission::Read);
        }
        for admin in &self.admins {
            table = table.with_administrator(admin.clone());
        }
        Ok(table)
    }
}
