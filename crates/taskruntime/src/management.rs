use crate::run::validate_job_name;
use crate::RuntimeError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// A process script registered with the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Script {
    pub id: String,
    /// Location of the process definition (path or URL).
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Script {
    pub fn new(id: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ScriptsFile {
    #[serde(default)]
    scripts: Vec<Script>,
}

/// Registered process scripts, loaded on construction and written on `save`.
#[derive(Debug)]
pub struct ManagementConfig {
    path: PathBuf,
    scripts: Vec<Script>,
}

impl ManagementConfig {
    pub const FILE_NAME: &'static str = "scripts.json";

    pub fn config_path(data_dir: &Path) -> PathBuf {
        data_dir.join(Self::FILE_NAME)
    }

    /// Load the configuration at `path`; a missing file is an empty list.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, RuntimeError> {
        let path = path.into();
        let scripts = if path.exists() {
            let file: ScriptsFile = serde_json::from_reader(std::fs::File::open(&path)?)?;
            file.scripts
        } else {
            Vec::new()
        };
        tracing::debug!("Loaded {} scripts from {}", scripts.len(), path.display());
        Ok(Self { path, scripts })
    }

    /// Like [`load`](Self::load), but an unreadable file is logged and treated as empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        match Self::load(path.clone()) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Could not load {}: {}", path.display(), e);
                Self {
                    path,
                    scripts: Vec::new(),
                }
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn list(&self) -> &[Script] {
        &self.scripts
    }

    pub fn find(&self, id: &str) -> Option<&Script> {
        self.scripts.iter().find(|s| s.id == id)
    }

    /// Replace the whole list. Ids must be unique and usable as names.
    pub fn replace_all(&mut self, scripts: Vec<Script>) -> Result<(), RuntimeError> {
        let mut seen = HashSet::new();
        for script in &scripts {
            validate_job_name(&script.id)
                .map_err(|_| RuntimeError::InvalidJobName(script.id.clone()))?;
            if !seen.insert(script.id.as_str()) {
                return Err(RuntimeError::DuplicateScript(script.id.clone()));
            }
        }
        self.scripts = scripts;
        Ok(())
    }

    pub fn save(&self) -> Result<(), RuntimeError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = ScriptsFile {
            scripts: self.scripts.clone(),
        };
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&file)?)?;
        std::fs::rename(&tmp, &self.path)?;
        tracing::info!("Saved {} scripts to {}", self.scripts.len(), self.path.display());
        Ok(())
    }
}
