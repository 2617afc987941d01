//! Configuration module for NanoStatus.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::path::{Path, PathBuf};

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the API server (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "./nanostatus.db")
    pub db_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "./nanostatus.db".to_string(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `PORT`: HTTP port (default: 8080)
    /// - `DB_PATH`: Database file path (default: "./nanostatus.db")
    /// - `RUST_LOG`: log verbosity (debug, info, warn, error)
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Ok(port_str) = env::var("PORT") {
            if let Ok(port) = port_str.parse() {
                cfg.http_port = port;
            }
        }

        if let Ok(db_path) = env::var("DB_PATH") {
            cfg.db_path = db_path;
        }

        cfg
    }

    /// Directory holding the database file; also where monitors.yaml lives.
    pub fn data_dir(&self) -> PathBuf {
        match Path::new(&self.db_path).parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    /// Create the database directory if it is missing (Docker volumes).
    pub fn ensure_data_dir(&self) {
        let dir = self.data_dir();
        if dir != Path::new(".") {
            if let Err(e) = std::fs::create_dir_all(&dir) {
                tracing::warn!("Could not create database directory {}: {}", dir.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.http_port, 8080);
        assert_eq!(cfg.db_path, "./nanostatus.db");
        assert_eq!(cfg.data_dir(), PathBuf::from("."));
    }

    #[test]
    fn test_data_dir_follows_db_path() {
        let cfg = ServerConfig {
            http_port: 8080,
            db_path: "/data/nanostatus.db".to_string(),
        };
        assert_eq!(cfg.data_dir(), PathBuf::from("/data"));
    }
}
