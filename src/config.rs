use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use tracing::warn;

use crate::schedule::ServiceSettings;

const DEFAULT_DATA_DIR: &str = "./voxtask_data";
const DEFAULT_WHISPER_MODEL: &str = "./models/ggml-base.bin";

/// Process-wide settings, read from the environment and `.env`.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub sqlite_url: String,
    pub save_folder: PathBuf,
    pub log_dir: PathBuf,
    pub max_workers: usize,
    pub shutdown_timeout: Duration,
    pub event_capacity: usize,
    pub ytdlp: String,
    pub ffmpeg: String,
    pub ffprobe: String,
    pub proxy: Option<String>,
    pub whisper_model: PathBuf,
    pub translate_api_url: Option<String>,
    pub translate_api_key: Option<String>,
    pub translate_model: Option<String>,
    /// Problems found while reading the settings. Logged by `log_warnings` once
    /// a subscriber is installed.
    pub warnings: Vec<String>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        Self::from_lookup(lookup)
    }

    /// Builds the config from any key lookup; missing keys take defaults.
    pub fn from_lookup<F>(get: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut warnings = Vec::new();
        let data_dir = PathBuf::from(get("VOXTASK_DATA_DIR").unwrap_or_else(|| DEFAULT_DATA_DIR.to_string()));
        let sqlite_url = get("VOXTASK_SQLITE_URL").unwrap_or_else(|| {
            format!(
                "sqlite://{}?mode=rwc",
                data_dir.join("database").join("tasks.db").display()
            )
        });

        Self {
            sqlite_url,
            save_folder: get("VOXTASK_SAVE_FOLDER")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("output")),
            log_dir: get("VOXTASK_LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("logs")),
            max_workers: parse_or(&get, &mut warnings, "VOXTASK_MAX_WORKERS", 2usize).max(1),
            shutdown_timeout: Duration::from_millis(parse_or(&get, &mut warnings, "VOXTASK_SHUTDOWN_TIMEOUT_MS", 3000u64)),
            event_capacity: parse_or(&get, &mut warnings, "VOXTASK_EVENT_CAPACITY", 1024usize).max(1),
            ytdlp: get("VOXTASK_YTDLP").unwrap_or_else(|| "yt-dlp".to_string()),
            ffmpeg: get("VOXTASK_FFMPEG").unwrap_or_else(|| "ffmpeg".to_string()),
            ffprobe: get("VOXTASK_FFPROBE").unwrap_or_else(|| "ffprobe".to_string()),
            proxy: get("VOXTASK_PROXY"),
            whisper_model: get("VOXTASK_WHISPER_MODEL")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_WHISPER_MODEL)),
            translate_api_url: get("VOXTASK_TRANSLATE_API_URL"),
            translate_api_key: get("VOXTASK_TRANSLATE_API_KEY"),
            translate_model: get("VOXTASK_TRANSLATE_MODEL"),
            data_dir,
            warnings,
        }
    }

    pub fn log_warnings(&self) {
        for warning in &self.warnings {
            warn!("{}", warning);
        }
    }

    pub fn service_settings(&self) -> ServiceSettings {
        ServiceSettings {
            max_workers: self.max_workers,
            shutdown_timeout: self.shutdown_timeout,
            ..ServiceSettings::default()
        }
    }

    /// Creates the data, output, log and database directories.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.data_dir, &self.save_folder, &self.log_dir] {
            std::fs::create_dir_all(dir)?;
        }
        if let Some(dir) = sqlite_file(&self.sqlite_url).and_then(Path::parent) {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

// process environment first, then `.env`
fn lookup(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .or_else(|| dotenv::var(key).ok())
        .filter(|value| !value.trim().is_empty())
}

fn parse_or<F, T>(get: &F, warnings: &mut Vec<String>, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + Copy + std::fmt::Display,
{
    match get(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warnings.push(format!("Invalid {}={:?}, using {}", key, raw, default));
            default
        }),
    }
}

/// Database file path of a `sqlite://` url, `None` for in-memory databases.
fn sqlite_file(url: &str) -> Option<&Path> {
    let rest = url.strip_prefix("sqlite://")?;
    let path = rest.split('?').next().unwrap_or(rest);
    (!path.is_empty() && !path.starts_with(":memory:")).then(|| Path::new(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn from_map(pairs: &[(&str, &str)]) -> AppConfig {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = from_map(&[]);
        assert_eq!(config.data_dir, PathBuf::from("./voxtask_data"));
        assert_eq!(
            config.sqlite_url,
            "sqlite://./voxtask_data/database/tasks.db?mode=rwc"
        );
        assert_eq!(config.save_folder, PathBuf::from("./voxtask_data/output"));
        assert_eq!(config.max_workers, 2);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(3));
        assert_eq!(config.event_capacity, 1024);
        assert_eq!(config.ytdlp, "yt-dlp");
        assert_eq!(config.proxy, None);
        assert!(config.warnings.is_empty());
    }

    #[test]
    fn test_overrides_and_bad_numbers() {
        let config = from_map(&[
            ("VOXTASK_DATA_DIR", "/srv/vox"),
            ("VOXTASK_MAX_WORKERS", "4"),
            ("VOXTASK_SHUTDOWN_TIMEOUT_MS", "soon"),
            ("VOXTASK_PROXY", "http://127.0.0.1:7890"),
        ]);
        assert_eq!(config.log_dir, PathBuf::from("/srv/vox/logs"));
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.shutdown_timeout, Duration::from_millis(3000));
        assert_eq!(config.proxy.as_deref(), Some("http://127.0.0.1:7890"));
        assert_eq!(config.service_settings().max_workers, 4);
        assert_eq!(
            config.warnings,
            vec![r#"Invalid VOXTASK_SHUTDOWN_TIMEOUT_MS="soon", using 3000"#.to_string()]
        );
    }

    #[test]
    fn test_ensure_dirs() -> Result<()> {
        let root = TempDir::new()?;
        let data = root.path().join("data");
        let config = from_map(&[("VOXTASK_DATA_DIR", data.to_str().unwrap())]);
        config.ensure_dirs()?;

        assert!(data.join("output").is_dir());
        assert!(data.join("logs").is_dir());
        assert!(data.join("database").is_dir());
        assert_eq!(sqlite_file("sqlite::memory:"), None);
        Ok(())
    }
}
