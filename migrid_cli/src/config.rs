//! Parses `migrid.toml`, the way `refinery_core::config` parses `Refinery.toml`.
//! CLI flags always take precedence over whatever is loaded here.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct Config {
    #[serde(default)]
    pub main: Main,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct Main {
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default)]
    pub pass: String,
    #[serde(default = "default_db")]
    pub db: String,
    #[serde(default = "default_migdir")]
    pub migdir: PathBuf,
    #[serde(default)]
    pub workers_per_host: Option<usize>,
}

impl Default for Main {
    fn default() -> Self {
        Main {
            hosts: Vec::new(),
            user: default_user(),
            pass: String::new(),
            db: default_db(),
            migdir: default_migdir(),
            workers_per_host: None,
        }
    }
}

fn default_user() -> String {
    "postgres".to_string()
}

fn default_db() -> String {
    "postgres".to_string()
}

fn default_migdir() -> PathBuf {
    PathBuf::from("migrations")
}

impl Config {
    pub fn from_file_location(location: &Path) -> Result<Config> {
        if !location.exists() {
            return Ok(Config::default());
        }
        let contents = std::fs::read_to_string(location)
            .with_context(|| format!("could not open config file at {location:?}"))?;
        toml::from_str(&contents).with_context(|| format!("could not parse config file at {location:?}"))
    }

    pub fn from_env_var(name: &str) -> Result<Config> {
        let value = std::env::var(name).with_context(|| format!("environment variable {name} is not set"))?;
        toml::from_str(&value).context("could not parse config from environment variable")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_yields_defaults() {
        let config = Config::from_file_location(Path::new("/nonexistent/migrid.toml")).unwrap();
        assert_eq!(config.main.db, "postgres");
        assert!(config.main.hosts.is_empty());
    }

    #[test]
    fn parses_hosts_list_and_workers_per_host() {
        let toml = "[main]\nhosts = [\"db1:5432\", \"db2:5432\"]\nworkers_per_host = 4\n";
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(toml.as_bytes()).unwrap();
        let config = Config::from_file_location(file.path()).unwrap();
        assert_eq!(config.main.hosts, vec!["db1:5432".to_string(), "db2:5432".to_string()]);
        assert_eq!(config.main.workers_per_host, Some(4));
    }

    #[test]
    fn rejects_malformed_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"[main\nhosts = ").unwrap();
        assert!(Config::from_file_location(file.path()).is_err());
    }
}
