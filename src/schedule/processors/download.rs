use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{anyhow, Result};
use serde::Deserialize;
use tracing::{debug, info};

use super::{file_name_of, file_size, output_dir, parse_config, JobRunner};
use crate::schedule::error::ServiceError;
use crate::schedule::scheduler::JobContext;
use crate::schedule::types::{DownloadSource, JobOutput, ProgressUpdate, Task, TaskRequest, TaskType};
use crate::utils::process::{probe, Output, ProcessRunner};

const VIDEO_EXTENSIONS: [&str; 3] = ["mp4", "flv", "avi"];
const YOUTUBE_ID_LEN: usize = 11;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DownloadConfig {
    pub quality: String,
    pub format: String,
    pub proxy: Option<String>,
    pub cookies: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub output_dir: Option<String>,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            quality: "best".to_string(),
            format: "mp4".to_string(),
            proxy: None,
            cookies: None,
            headers: BTreeMap::new(),
            output_dir: None,
        }
    }
}

/// Video downloads through `yt-dlp`.
pub struct DownloadRunner {
    ytdlp: String,
    save_folder: PathBuf,
    default_proxy: Option<String>,
    available: OnceLock<bool>,
}

impl DownloadRunner {
    pub fn new(ytdlp: impl Into<String>, save_folder: impl Into<PathBuf>) -> Self {
        Self {
            ytdlp: ytdlp.into(),
            save_folder: save_folder.into(),
            default_proxy: None,
            available: OnceLock::new(),
        }
    }

    /// Proxy used when a task does not set its own.
    pub fn with_proxy(mut self, proxy: Option<String>) -> Self {
        self.default_proxy = proxy.filter(|p| !p.is_empty());
        self
    }

    fn build_args(&self, task: &Task, config: &DownloadConfig, dir: &Path) -> Result<Vec<String>> {
        let source = task
            .source()
            .ok_or_else(|| anyhow!("task {} has no download source", task.id))?;
        let target = match source {
            DownloadSource::Bilibili => format!("https://www.bilibili.com/video/{}", task.url),
            _ => task.url.clone(),
        };
        let stem = file_stem(&task.file_name);

        let mut args = vec![
            "--newline".to_string(),
            "--progress".to_string(),
            "--no-playlist".to_string(),
            "--no-simulate".to_string(),
            "--print".to_string(),
            "after_move:filepath".to_string(),
            "-f".to_string(),
            config.quality.clone(),
            "--merge-output-format".to_string(),
            config.format.clone(),
            "-o".to_string(),
            dir.join(format!("{}.%(ext)s", stem))
                .to_string_lossy()
                .into_owned(),
        ];
        if let Some(proxy) = config.proxy.as_ref().or(self.default_proxy.as_ref()) {
            args.push("--proxy".to_string());
            args.push(proxy.clone());
        }
        if let Some(cookies) = &config.cookies {
            args.push("--cookies".to_string());
            args.push(cookies.clone());
        }
        for (name, value) in &config.headers {
            args.push("--add-header".to_string());
            args.push(format!("{}:{}", name, value));
        }
        args.push(target);
        Ok(args)
    }
}

impl JobRunner for DownloadRunner {
    fn task_type(&self) -> TaskType {
        TaskType::Download
    }

    fn is_available(&self) -> bool {
        *self
            .available
            .get_or_init(|| probe(&self.ytdlp, "--version"))
    }

    fn unavailable_reason(&self) -> String {
        format!("{} is not installed or not on PATH", self.ytdlp)
    }

    fn create_task(&self, request: TaskRequest) -> Result<Task, ServiceError> {
        let config: DownloadConfig = parse_config(&request.config)?;
        let url = request
            .url_str()
            .ok_or_else(|| ServiceError::validation("download url is required"))?
            .to_string();

        let (source, stored_url, id) = match detect_source(&url) {
            Some(DownloadSource::Bilibili) => {
                let id = extract_bv_id(&url)
                    .ok_or_else(|| ServiceError::validation(format!("invalid bilibili link: {}", url)))?;
                (DownloadSource::Bilibili, id.clone(), id)
            }
            Some(DownloadSource::Youtube) => {
                let id = extract_youtube_id(&url);
                (DownloadSource::Youtube, url.clone(), id)
            }
            _ => {
                return Err(ServiceError::validation(format!(
                    "unsupported download link: {}",
                    url
                )))
            }
        };

        let mut task = request.into_task(TaskType::Download);
        task.url = stored_url;
        task.file_name = format!("{}.{}", id, config.format);
        task.set_source(source);
        Ok(task)
    }

    fn run(&self, task: &Task, ctx: &JobContext) -> Result<JobOutput> {
        let config: DownloadConfig = parse_config(&task.config)?;
        let dir = output_dir(task, &self.save_folder);
        std::fs::create_dir_all(&dir)?;

        let args = self.build_args(task, &config, &dir)?;
        ctx.info(format!("Downloading {} into {}", task.url, dir.display()));

        let mut printed: Option<PathBuf> = None;
        ProcessRunner::new(&self.ytdlp)
            .args(&args)
            .run(ctx.token(), |output| match output {
                Output::Stdout(line) if line.starts_with("[download]") => {
                    match parse_progress(line) {
                        Some(update) => ctx.progress(update),
                        None => ctx.info(line.as_str()),
                    }
                }
                Output::Stdout(line) if !line.starts_with('[') && Path::new(line.trim()).is_file() => {
                    printed = Some(PathBuf::from(line.trim()));
                }
                Output::Stdout(line) => ctx.info(line.as_str()),
                Output::Stderr(line) if line.starts_with("WARNING") => ctx.warn(line.as_str()),
                Output::Stderr(line) => debug!("[yt-dlp] {}", line),
            })?;
        ctx.checkpoint()?;

        let stem = file_stem(&task.file_name);
        let path = locate_output(&dir, &stem, printed).ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("download finished but no file found for {}", stem),
            )
        })?;
        info!("Downloaded {} to {}", task.url, path.display());

        let mut output = JobOutput::file(path.to_string_lossy());
        output.file_size = file_size(&path);
        output
            .metadata
            .insert("downloadedFile".to_string(), file_name_of(&path).into());
        Ok(output)
    }
}

pub fn detect_source(url: &str) -> Option<DownloadSource> {
    if url.contains("bilibili.com") || url.contains("BV") {
        Some(DownloadSource::Bilibili)
    } else if url.contains("youtube.com") || url.contains("youtu.be") {
        Some(DownloadSource::Youtube)
    } else {
        None
    }
}

/// `BV` followed by its alphanumeric id, wherever it appears in the link.
pub fn extract_bv_id(url: &str) -> Option<String> {
    let start = url.find("BV")?;
    let id: String = url[start..]
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    (id.len() > 2).then_some(id)
}

/// The 11-character video id after `v=` or a `/`, else the last path segment.
pub fn extract_youtube_id(url: &str) -> String {
    let is_id_char = |c: char| c.is_ascii_alphanumeric() || c == '_' || c == '-';
    let candidates = url
        .match_indices("v=")
        .map(|(i, m)| i + m.len())
        .chain(url.match_indices('/').map(|(i, _)| i + 1));
    for start in candidates {
        let id: String = url[start..].chars().take_while(|c| is_id_char(*c)).collect();
        if id.len() >= YOUTUBE_ID_LEN {
            return id[..YOUTUBE_ID_LEN].to_string();
        }
    }

    let last = url.rsplit('/').next().unwrap_or(url);
    last.split('?').next().unwrap_or(last).to_string()
}

/// Parses `[download]  42.0% of ~10.00MiB at 1.20MiB/s ETA 00:07`.
pub fn parse_progress(line: &str) -> Option<ProgressUpdate> {
    let rest = line.strip_prefix("[download]")?.trim();
    let mut tokens = rest.split_whitespace();
    let percent: f64 = tokens.next()?.strip_suffix('%')?.parse().ok()?;

    let mut update = ProgressUpdate::new(percent);
    while let Some(token) = tokens.next() {
        match token {
            "at" => {
                if let Some(speed) = tokens.next().filter(|s| !s.starts_with("Unknown")) {
                    update = update.with_speed(speed);
                }
            }
            "ETA" => {
                if let Some(eta) = tokens.next().filter(|e| !e.starts_with("Unknown")) {
                    update = update.with_eta(eta);
                }
            }
            _ => {}
        }
    }
    Some(update)
}

/// Finds the downloaded file: the path yt-dlp printed, `<stem>.<ext>`, a file
/// whose name contains `stem`, then the newest video in `dir`.
pub fn locate_output(dir: &Path, stem: &str, printed: Option<PathBuf>) -> Option<PathBuf> {
    if let Some(path) = printed.filter(|p| p.is_file()) {
        return Some(path);
    }
    for ext in VIDEO_EXTENSIONS {
        let path = dir.join(format!("{}.{}", stem, ext));
        if path.is_file() {
            return Some(path);
        }
    }

    let videos: Vec<PathBuf> = std::fs::read_dir(dir)
        .ok()?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && is_video(path))
        .collect();

    if let Some(path) = videos.iter().find(|path| {
        path.file_stem()
            .and_then(|s| s.to_str())
            .is_some_and(|s| s.contains(stem))
    }) {
        return Some(path.clone());
    }

    videos
        .into_iter()
        .filter_map(|path| {
            let modified = std::fs::metadata(&path).and_then(|m| m.modified()).ok()?;
            Some((modified, path))
        })
        .max_by_key(|(modified, _)| *modified)
        .map(|(_, path)| path)
}

fn is_video(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| VIDEO_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

fn file_stem(file_name: &str) -> String {
    Path::new(file_name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn runner() -> DownloadRunner {
        DownloadRunner::new("yt-dlp", "/tmp/voxtask-downloads")
    }

    #[test]
    fn test_detect_source() {
        assert_eq!(
            detect_source("https://www.bilibili.com/video/BV1xx411c7mD"),
            Some(DownloadSource::Bilibili)
        );
        assert_eq!(detect_source("BV1xx411c7mD"), Some(DownloadSource::Bilibili));
        assert_eq!(
            detect_source("https://youtu.be/dQw4w9WgXcQ"),
            Some(DownloadSource::Youtube)
        );
        assert_eq!(detect_source("https://vimeo.com/12345"), None);
    }

    #[test]
    fn test_extract_ids() {
        assert_eq!(
            extract_bv_id("https://www.bilibili.com/video/BV1xx411c7mD?p=2").as_deref(),
            Some("BV1xx411c7mD")
        );
        assert_eq!(extract_bv_id("https://www.bilibili.com/video/"), None);

        assert_eq!(
            extract_youtube_id("https://www.youtube.com/watch?v=dQw4w9WgXcQ&t=42"),
            "dQw4w9WgXcQ"
        );
        assert_eq!(extract_youtube_id("https://youtu.be/dQw4w9WgXcQ"), "dQw4w9WgXcQ");
        assert_eq!(extract_youtube_id("https://youtube.com/shorts?x=1"), "shorts");
    }

    #[test]
    fn test_create_task_by_source() -> Result<()> {
        let runner = runner();

        let task = runner.create_task(TaskRequest::from_url(
            "https://www.bilibili.com/video/BV1xx411c7mD",
        ))?;
        assert_eq!(task.url, "BV1xx411c7mD");
        assert_eq!(task.file_name, "BV1xx411c7mD.mp4");
        assert_eq!(task.source(), Some(DownloadSource::Bilibili));

        let task = runner.create_task(
            TaskRequest::from_url("https://www.youtube.com/watch?v=dQw4w9WgXcQ")
                .with_option("format", "mkv"),
        )?;
        assert_eq!(task.url, "https://www.youtube.com/watch?v=dQw4w9WgXcQ");
        assert_eq!(task.file_name, "dQw4w9WgXcQ.mkv");
        assert_eq!(task.source(), Some(DownloadSource::Youtube));
        Ok(())
    }

    #[test]
    fn test_create_task_rejects_bad_requests() {
        let runner = runner();
        assert!(matches!(
            runner.create_task(TaskRequest::from_url("https://vimeo.com/1")),
            Err(ServiceError::Validation(_))
        ));
        assert!(matches!(
            runner.create_task(TaskRequest::from_url("   ")),
            Err(ServiceError::Validation(_))
        ));
        assert!(matches!(
            runner.create_task(
                TaskRequest::from_url("BV1xx411c7mD").with_option("quality", 5)
            ),
            Err(ServiceError::Validation(_))
        ));
    }

    #[test]
    fn test_parse_progress() {
        let update =
            parse_progress("[download]  42.5% of ~ 10.00MiB at  1.20MiB/s ETA 00:07").unwrap();
        assert_eq!(update.progress, 42.5);
        assert_eq!(update.speed.as_deref(), Some("1.20MiB/s"));
        assert_eq!(update.eta.as_deref(), Some("00:07"));

        let update = parse_progress("[download] 100% of 10.00MiB in 00:00:08").unwrap();
        assert_eq!(update.progress, 100.0);
        assert_eq!(update.speed, None);

        assert!(parse_progress("[download] Destination: /tmp/x.mp4").is_none());
        assert!(parse_progress("[info] 42%").is_none());
    }

    #[test]
    fn test_build_args() -> Result<()> {
        let runner = runner().with_proxy(Some("socks5://127.0.0.1:1080".to_string()));
        let task = runner.create_task(
            TaskRequest::from_url("BV1xx411c7mD")
                .with_option("headers", serde_json::json!({"Referer": "https://www.bilibili.com"})),
        )?;
        let config: DownloadConfig = parse_config(&task.config)?;
        let args = runner.build_args(&task, &config, Path::new("/out"))?;

        assert_eq!(args.last().map(String::as_str), Some("https://www.bilibili.com/video/BV1xx411c7mD"));
        assert!(args.windows(2).any(|w| w == ["--proxy", "socks5://127.0.0.1:1080"]));
        assert!(args.windows(2).any(|w| w == ["-o", "/out/BV1xx411c7mD.%(ext)s"]));
        assert!(args
            .windows(2)
            .any(|w| w == ["--add-header", "Referer:https://www.bilibili.com"]));
        Ok(())
    }

    #[test]
    fn test_locate_output() -> Result<()> {
        let dir = TempDir::new()?;
        assert!(locate_output(dir.path(), "abc", None).is_none());

        std::fs::write(dir.path().join("other.avi"), b"x")?;
        assert_eq!(
            locate_output(dir.path(), "abc", None),
            Some(dir.path().join("other.avi"))
        );

        std::fs::write(dir.path().join("prefix-abc-title.flv"), b"x")?;
        assert_eq!(
            locate_output(dir.path(), "abc", None),
            Some(dir.path().join("prefix-abc-title.flv"))
        );

        std::fs::write(dir.path().join("abc.mp4"), b"x")?;
        assert_eq!(
            locate_output(dir.path(), "abc", None),
            Some(dir.path().join("abc.mp4"))
        );

        let printed = dir.path().join("printed.webm");
        std::fs::write(&printed, b"x")?;
        assert_eq!(
            locate_output(dir.path(), "abc", Some(printed.clone())),
            Some(printed)
        );
        Ok(())
    }
}
