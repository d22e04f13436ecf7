use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{anyhow, Result};
use serde::Deserialize;
use tracing::debug;

use super::{file_name_of, output_dir, parse_config, require_input_file, JobRunner};
use crate::concurrent::CancelToken;
use crate::schedule::error::ServiceError;
use crate::schedule::scheduler::JobContext;
use crate::schedule::types::{JobOutput, ProgressUpdate, Task, TaskRequest, TaskType};
use crate::utils::process::{probe, Output, ProcessRunner};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SplitMode {
    #[default]
    Duration,
    Count,
    Custom,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MediaSplitConfig {
    pub split_mode: SplitMode,
    /// Segment length in seconds for `duration` mode.
    pub duration: f64,
    pub segment_count: u32,
    /// Cut points in seconds for `custom` mode.
    pub custom_points: Vec<f64>,
    /// Container extension of the segments; the input's when unset.
    pub output_format: Option<String>,
    pub keep_audio: bool,
    pub keep_video: bool,
}

impl Default for MediaSplitConfig {
    fn default() -> Self {
        Self {
            split_mode: SplitMode::Duration,
            duration: 300.0,
            segment_count: 2,
            custom_points: Vec::new(),
            output_format: None,
            keep_audio: true,
            keep_video: true,
        }
    }
}

impl MediaSplitConfig {
    fn validate(&self) -> Result<(), ServiceError> {
        match self.split_mode {
            SplitMode::Duration if self.duration <= 0.0 => {
                Err(ServiceError::validation("segment duration must be positive"))
            }
            SplitMode::Count if self.segment_count == 0 => {
                Err(ServiceError::validation("segment count must be at least 1"))
            }
            SplitMode::Custom if self.custom_points.iter().all(|p| *p <= 0.0) => {
                Err(ServiceError::validation("custom split points are required"))
            }
            _ if !self.keep_audio && !self.keep_video => {
                Err(ServiceError::validation("segments must keep audio or video"))
            }
            _ => Ok(()),
        }
    }

    /// Cut points strictly inside `(0, total)`, ascending.
    pub fn split_points(&self, total: f64) -> Vec<f64> {
        let mut points: Vec<f64> = match self.split_mode {
            SplitMode::Duration => {
                let step = self.duration;
                (1..)
                    .map(|k| k as f64 * step)
                    .take_while(|p| *p < total)
                    .collect()
            }
            SplitMode::Count => {
                let count = self.segment_count.max(1);
                (1..count)
                    .map(|k| total * k as f64 / count as f64)
                    .collect()
            }
            SplitMode::Custom => self.custom_points.clone(),
        };
        points.retain(|p| *p > 0.0 && *p < total);
        points.sort_by(|a, b| a.total_cmp(b));
        points.dedup();
        points
    }
}

/// Cuts media files into segments with ffmpeg's segment muxer.
pub struct MediaSplitRunner {
    ffmpeg: String,
    ffprobe: String,
    save_folder: PathBuf,
    available: OnceLock<bool>,
}

impl MediaSplitRunner {
    pub fn new(ffmpeg: impl Into<String>, ffprobe: impl Into<String>, save_folder: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
            save_folder: save_folder.into(),
            available: OnceLock::new(),
        }
    }

    /// Container duration in seconds, from ffprobe.
    pub fn probe_duration(&self, input: &Path, token: &CancelToken) -> Result<f64> {
        let output = ProcessRunner::new(&self.ffprobe)
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
            ])
            .arg(input)
            .run(token, |_| {})?;
        output
            .stdout
            .iter()
            .rev()
            .find_map(|line| line.trim().parse::<f64>().ok())
            .filter(|d| *d > 0.0)
            .ok_or_else(|| anyhow!("could not read duration of {}", input.display()))
    }
}

impl JobRunner for MediaSplitRunner {
    fn task_type(&self) -> TaskType {
        TaskType::MediaSplit
    }

    fn is_available(&self) -> bool {
        *self.available.get_or_init(|| {
            probe(&self.ffmpeg, "-version") && probe(&self.ffprobe, "-version")
        })
    }

    fn unavailable_reason(&self) -> String {
        format!("{} / {} are not installed or not on PATH", self.ffmpeg, self.ffprobe)
    }

    fn create_task(&self, request: TaskRequest) -> Result<Task, ServiceError> {
        let config: MediaSplitConfig = parse_config(&request.config)?;
        config.validate()?;
        let input = require_input_file(&request)?;

        let mut task = request.into_task(TaskType::MediaSplit);
        task.file_name = file_name_of(&input);
        task.total_steps = 2;
        Ok(task)
    }

    fn run(&self, task: &Task, ctx: &JobContext) -> Result<JobOutput> {
        let config: MediaSplitConfig = parse_config(&task.config)?;
        let input = PathBuf::from(&task.input_path);

        ctx.progress(ProgressUpdate::new(0.0).with_step("probing"));
        let total = self.probe_duration(&input, ctx.token())?;
        ctx.checkpoint()?;

        let default_dir = input
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.save_folder.clone());
        let dir = output_dir(task, &default_dir);
        std::fs::create_dir_all(&dir)?;

        let plan = SegmentPlan::new(&input, &dir, &config, total);
        ctx.info(format!(
            "Splitting {:.1}s into {} segment(s)",
            total,
            plan.segment_count()
        ));

        ProcessRunner::new(&self.ffmpeg)
            .args(plan.ffmpeg_args(&input))
            .run(ctx.token(), |output| match output {
                Output::Stdout(line) => {
                    if let Some(seconds) = parse_out_time(line) {
                        let percent = (seconds / total * 100.0).min(100.0);
                        ctx.progress(ProgressUpdate::new(percent).with_step("splitting"));
                    }
                }
                Output::Stderr(line) => debug!("[ffmpeg] {}", line),
            })?;
        ctx.checkpoint()?;

        let segments = plan.collect_segments()?;
        if segments.is_empty() {
            return Err(anyhow!("ffmpeg produced no segments for {}", input.display()));
        }

        let paths: Vec<String> = segments
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        let mut output = JobOutput::files(paths);
        output.duration = Some(total);
        output.file_size = Some(
            segments
                .iter()
                .filter_map(|p| std::fs::metadata(p).ok().map(|m| m.len()))
                .sum(),
        );
        output
            .metadata
            .insert("segments".to_string(), segments.len().into());
        Ok(output)
    }
}

/// Where the segments go and how ffmpeg is told to cut them.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentPlan {
    pub dir: PathBuf,
    pub stem: String,
    pub extension: String,
    pub points: Vec<f64>,
    pub total: f64,
    pub keep_audio: bool,
    pub keep_video: bool,
}

impl SegmentPlan {
    pub fn new(input: &Path, dir: &Path, config: &MediaSplitConfig, total: f64) -> Self {
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "segment".to_string());
        let extension = config
            .output_format
            .clone()
            .filter(|f| !f.is_empty())
            .or_else(|| {
                input
                    .extension()
                    .map(|e| e.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| "mp4".to_string());

        Self {
            dir: dir.to_path_buf(),
            stem,
            extension,
            points: config.split_points(total),
            total,
            keep_audio: config.keep_audio,
            keep_video: config.keep_video,
        }
    }

    pub fn pattern(&self) -> PathBuf {
        self.dir
            .join(format!("{}_%03d.{}", self.stem, self.extension))
    }

    pub fn ffmpeg_args(&self, input: &Path) -> Vec<String> {
        let mut args: Vec<String> = ["-y", "-hide_banner", "-nostats", "-progress", "pipe:1", "-i"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        args.push(input.to_string_lossy().into_owned());
        if !self.keep_video {
            args.push("-vn".to_string());
        }
        if !self.keep_audio {
            args.push("-an".to_string());
        }
        args.extend(["-c", "copy", "-f", "segment"].iter().map(|s| s.to_string()));

        if self.points.is_empty() {
            // one segment covering the whole input
            args.push("-segment_time".to_string());
            args.push(format!("{}", self.total.ceil() + 1.0));
        } else {
            args.push("-segment_times".to_string());
            args.push(
                self.points
                    .iter()
                    .map(|p| format!("{:.3}", p))
                    .collect::<Vec<_>>()
                    .join(","),
            );
        }
        args.extend(["-reset_timestamps", "1"].iter().map(|s| s.to_string()));
        args.push(self.pattern().to_string_lossy().into_owned());
        args
    }

    /// Number of segments ffmpeg produces for this plan.
    pub fn segment_count(&self) -> usize {
        self.points.len() + 1
    }

    /// Segment files ffmpeg wrote for this plan, in order. Files left over from
    /// an earlier split with more segments are not included.
    pub fn collect_segments(&self) -> Result<Vec<PathBuf>> {
        let prefix = format!("{}_", self.stem);
        let suffix = format!(".{}", self.extension);
        let count = self.segment_count();
        let mut segments: Vec<PathBuf> = std::fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                let name = file_name_of(path);
                name.strip_prefix(&prefix)
                    .and_then(|rest| rest.strip_suffix(&suffix))
                    .filter(|index| !index.is_empty() && index.chars().all(|c| c.is_ascii_digit()))
                    .and_then(|index| index.parse::<usize>().ok())
                    .is_some_and(|index| index < count)
            })
            .collect();
        segments.sort();
        Ok(segments)
    }
}

/// Seconds from ffmpeg's `out_time_us=` / `out_time_ms=` progress keys (both microseconds).
pub fn parse_out_time(line: &str) -> Option<f64> {
    let value = line
        .strip_prefix("out_time_us=")
        .or_else(|| line.strip_prefix("out_time_ms="))?;
    let micros: i64 = value.trim().parse().ok()?;
    (micros >= 0).then(|| micros as f64 / 1_000_000.0)
}
