use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{ConsultaError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_qr_base_url")]
    pub qr_base_url: String,
    #[serde(default = "default_report_base_url")]
    pub report_base_url: String,
    #[serde(default = "default_download_dir")]
    pub download_dir: String,
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
}

fn default_api_base_url() -> String {
    "http://localhost:3001".to_string()
}

fn default_qr_base_url() -> String {
    "https://apis.siamsoft.gobiernodigitalperu.com".to_string()
}

fn default_report_base_url() -> String {
    "https://documentosvirtuales.com".to_string()
}

fn default_download_dir() -> String {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Downloads")
        .join("consulta")
        .to_string_lossy()
        .to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            qr_base_url: default_qr_base_url(),
            report_base_url: default_report_base_url(),
            download_dir: default_download_dir(),
            request_timeout_secs: None,
        }
    }
}

impl Settings {
    /// Apply `CONSULTA_*_URL` environment overrides on top of the stored values.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("CONSULTA_API_BASE_URL") {
            if !v.trim().is_empty() {
                self.api_base_url = v;
            }
        }
        if let Ok(v) = std::env::var("CONSULTA_QR_BASE_URL") {
            if !v.trim().is_empty() {
                self.qr_base_url = v;
            }
        }
        if let Ok(v) = std::env::var("CONSULTA_REPORT_BASE_URL") {
            if !v.trim().is_empty() {
                self.report_base_url = v;
            }
        }
        self
    }

    /// Set a field by its settings-file key. Used by `consulta config set`.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "api_base_url" => self.api_base_url = trim_trailing_slash(value),
            "qr_base_url" => self.qr_base_url = trim_trailing_slash(value),
            "report_base_url" => self.report_base_url = trim_trailing_slash(value),
            "download_dir" => self.download_dir = shellexpand_path(value),
            "request_timeout_secs" => {
                self.request_timeout_secs = if value.is_empty() || value == "none" {
                    None
                } else {
                    Some(value.parse().map_err(|_| {
                        ConsultaError::Settings(format!("not a number of seconds: {value}"))
                    })?)
                };
            }
            other => {
                return Err(ConsultaError::Settings(format!("unknown setting: {other}")));
            }
        }
        Ok(())
    }

    pub fn entries(&self) -> Vec<(&'static str, String)> {
        vec![
            ("api_base_url", self.api_base_url.clone()),
            ("qr_base_url", self.qr_base_url.clone()),
            ("report_base_url", self.report_base_url.clone()),
            ("download_dir", self.download_dir.clone()),
            (
                "request_timeout_secs",
                self.request_timeout_secs
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "(transport default)".to_string()),
            ),
        ]
    }
}

fn trim_trailing_slash(value: &str) -> String {
    value.trim().trim_end_matches('/').to_string()
}

/// Root of everything consulta persists. `CONSULTA_HOME` relocates it.
pub fn config_dir() -> PathBuf {
    if let Ok(home) = std::env::var("CONSULTA_HOME") {
        if !home.is_empty() {
            return PathBuf::from(home);
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("consulta")
}

fn settings_path() -> PathBuf {
    config_dir().join("settings.json")
}

pub fn session_dir() -> PathBuf {
    config_dir().join("session")
}

/// Settings as stored on disk, without environment overrides.
pub fn load_stored_settings() -> Settings {
    let path = settings_path();
    if path.exists() {
        let content = std::fs::read_to_string(&path).unwrap_or_default();
        serde_json::from_str(&content).unwrap_or_default()
    } else {
        Settings::default()
    }
}

pub fn load_settings() -> Settings {
    load_stored_settings().with_env_overrides()
}

pub fn save_settings(settings: &Settings) -> Result<()> {
    let dir = config_dir();
    std::fs::create_dir_all(&dir)?;
    let json = serde_json::to_string_pretty(settings)
        .map_err(|e| ConsultaError::Settings(e.to_string()))?;
    std::fs::write(settings_path(), format!("{json}\n"))?;
    Ok(())
}

pub fn shellexpand_path(path: &str) -> String {
    if path.starts_with('~') {
        if let Some(home) = dirs::home_dir() {
            return path.replacen('~', &home.to_string_lossy(), 1);
        }
    }
    path.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_merges_with_defaults() {
        let json = r#"{"api_base_url": "https://api.example.pe"}"#;
        let s: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(s.api_base_url, "https://api.example.pe");
        assert_eq!(s.report_base_url, "https://documentosvirtuales.com");
        assert!(s.request_timeout_secs.is_none());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let mut settings = Settings::default();
        settings.set("api_base_url", "https://api.example.pe/").unwrap();
        settings.set("request_timeout_secs", "30").unwrap();
        std::fs::write(&path, serde_json::to_string_pretty(&settings).unwrap()).unwrap();
        let loaded: Settings =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded, settings);
        assert_eq!(loaded.api_base_url, "https://api.example.pe");
        assert_eq!(loaded.request_timeout_secs, Some(30));
    }

    #[test]
    fn test_set_rejects_unknown_key() {
        let mut s = Settings::default();
        assert!(matches!(s.set("colour", "blue"), Err(ConsultaError::Settings(_))));
        assert!(s.set("request_timeout_secs", "soon").is_err());
    }

    #[test]
    fn test_timeout_can_be_cleared() {
        let mut s = Settings::default();
        s.set("request_timeout_secs", "10").unwrap();
        s.set("request_timeout_secs", "none").unwrap();
        assert!(s.request_timeout_secs.is_none());
    }
}
