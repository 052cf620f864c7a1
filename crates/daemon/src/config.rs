use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
    /// Gates operations that shell out to the host desktop. The server
    /// core never requires it.
    pub desktop_mode: bool,
    pub doc_roots: Vec<DocRoot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:4000".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { db_path: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// One namespaced document tree. Only the `vfs` type is supported; other
/// types are rejected at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocRoot {
    pub key: String,
    #[serde(rename = "type", default = "default_root_type")]
    pub root_type: String,
}

fn default_root_type() -> String {
    "vfs".to_string()
}

impl Config {
    /// Load config from `~/.docfs/config.toml`, returning defaults if the
    /// file is missing.
    pub fn load() -> Self {
        let path = Self::default_path();
        Self::load_from(&path)
    }

    pub fn default_path() -> PathBuf {
        Self::data_dir().join("config.toml")
    }

    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!(path = %path.display(), "loaded config");
                    config
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "invalid config file, using defaults");
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    pub fn data_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".docfs")
    }

    pub fn db_path(&self) -> PathBuf {
        self.storage
            .db_path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| Self::data_dir().join("docfs.db"))
    }

    /// Keys of the configured `vfs` roots; at least `main` when nothing
    /// is configured. Errors on any root with an unsupported type.
    pub fn vfs_root_keys(&self) -> Result<Vec<String>, String> {
        if self.doc_roots.is_empty() {
            return Ok(vec!["main".to_string()]);
        }
        let mut keys = Vec::with_capacity(self.doc_roots.len());
        for r in &self.doc_roots {
            if r.root_type != "vfs" {
                return Err(format!(
                    "document root '{}' has unsupported type '{}'",
                    r.key, r.root_type
                ));
            }
            keys.push(r.key.clone());
        }
        Ok(keys)
    }

    /// Write config to a TOML file.
    pub fn save_to(&self, path: &Path) -> std::io::Result<()> {
        let toml_str = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_missing() {
        let cfg = Config::load_from(Path::new("/nonexistent/config.toml"));
        assert_eq!(cfg.api.addr, "127.0.0.1:4000");
        assert!(!cfg.desktop_mode);
        assert_eq!(cfg.vfs_root_keys().unwrap(), vec!["main"]);
    }

    #[test]
    fn rejects_non_vfs_roots() {
        let cfg: Config = toml::from_str(
            r#"
            [[doc_roots]]
            key = "docs"
            type = "vfs"

            [[doc_roots]]
            key = "legacy"
            type = "lfs"
            "#,
        )
        .unwrap();
        assert!(cfg.vfs_root_keys().is_err());
    }

    #[test]
    fn root_type_defaults_to_vfs() {
        let cfg: Config = toml::from_str(
            r#"
            [[doc_roots]]
            key = "docs"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.vfs_root_keys().unwrap(), vec!["docs"]);
    }
}
