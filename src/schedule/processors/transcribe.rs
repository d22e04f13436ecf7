use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{file_name_of, output_dir, parse_config, require_input_file, JobRunner};
use crate::schedule::error::ServiceError;
use crate::schedule::scheduler::JobContext;
use crate::schedule::types::{JobOutput, Task, TaskRequest, TaskType};
use crate::utils::subtitle::{to_srt, Cue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptFormat {
    #[default]
    Srt,
    Txt,
    Json,
}

impl TranscriptFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            TranscriptFormat::Srt => "srt",
            TranscriptFormat::Txt => "txt",
            TranscriptFormat::Json => "json",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TranscribeConfig {
    pub language: String,
    pub model_size: String,
    pub output_format: TranscriptFormat,
    pub translate: bool,
    pub prompt: Option<String>,
}

impl Default for TranscribeConfig {
    fn default() -> Self {
        Self {
            language: "auto".to_string(),
            model_size: "base".to_string(),
            output_format: TranscriptFormat::Srt,
            translate: false,
            prompt: None,
        }
    }
}

/// Speech to subtitles with whisper. Needs the `whisper` feature and a model file.
pub struct TranscribeRunner {
    #[cfg_attr(not(feature = "whisper"), allow(dead_code))]
    ffmpeg: String,
    model_path: PathBuf,
    save_folder: PathBuf,
    #[cfg(feature = "whisper")]
    models: std::sync::Mutex<std::collections::HashMap<PathBuf, std::sync::Arc<crate::asr::whisper::WhisperAsr>>>,
}

impl TranscribeRunner {
    pub fn new(ffmpeg: impl Into<String>, model_path: impl Into<PathBuf>, save_folder: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            model_path: model_path.into(),
            save_folder: save_folder.into(),
            #[cfg(feature = "whisper")]
            models: Default::default(),
        }
    }

    /// `ggml-<size>.bin` next to the configured model, falling back to the configured model.
    pub fn model_for(&self, model_size: &str) -> PathBuf {
        let sized = self
            .model_path
            .parent()
            .map(|dir| dir.join(format!("ggml-{}.bin", model_size)));
        match sized {
            Some(path) if path.is_file() => path,
            _ => self.model_path.clone(),
        }
    }

    #[cfg(feature = "whisper")]
    fn load_model(&self, path: &Path) -> Result<std::sync::Arc<crate::asr::whisper::WhisperAsr>> {
        use crate::asr::whisper::WhisperAsr;
        use std::sync::Arc;

        let mut models = self.models.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(model) = models.get(path) {
            return Ok(Arc::clone(model));
        }
        let model = Arc::new(WhisperAsr::new(&path.to_string_lossy())?);
        models.insert(path.to_path_buf(), Arc::clone(&model));
        Ok(model)
    }

    #[cfg(feature = "whisper")]
    fn transcribe(&self, input: &Path, config: &TranscribeConfig, task: &Task, ctx: &JobContext) -> Result<(Vec<Cue>, f64)> {
        use crate::asr::{AsrEngine, AsrParams};
        use crate::schedule::types::ProgressUpdate;

        ctx.progress(ProgressUpdate::new(0.0).with_step("converting audio"));
        let scratch = std::env::temp_dir().join("voxtask").join(&task.id);
        let audio = crate::audio::load_for_whisper(input, &self.ffmpeg, &scratch, ctx.token())?;
        let _ = std::fs::remove_dir(&scratch);
        ctx.checkpoint()?;

        ctx.progress(ProgressUpdate::new(5.0).with_step("loading model"));
        let model = self.load_model(&self.model_for(&config.model_size))?;
        ctx.checkpoint()?;

        let mut params = AsrParams::new();
        params
            .set_language(Some(config.language.clone()))
            .set_translate(config.translate)
            .set_initial_prompt(config.prompt.clone())
            .set_n_threads(std::thread::available_parallelism().map(|n| n.get() as i32).unwrap_or(4));

        let reporter = ctx.clone();
        let cues = model.transcribe(
            &audio,
            &params,
            Box::new(move |percent| {
                reporter.progress(
                    ProgressUpdate::new(5.0 + percent as f64 * 0.9).with_step("transcribing"),
                )
            }),
        )?;
        Ok((cues, crate::audio::duration_secs(&audio)))
    }

    #[cfg(not(feature = "whisper"))]
    fn transcribe(&self, _input: &Path, _config: &TranscribeConfig, _task: &Task, _ctx: &JobContext) -> Result<(Vec<Cue>, f64)> {
        anyhow::bail!("voxtask was built without whisper support")
    }
}

impl JobRunner for TranscribeRunner {
    fn task_type(&self) -> TaskType {
        TaskType::Transcribe
    }

    fn is_available(&self) -> bool {
        cfg!(feature = "whisper") && self.model_path.is_file()
    }

    fn unavailable_reason(&self) -> String {
        if cfg!(feature = "whisper") {
            format!("whisper model not found: {}", self.model_path.display())
        } else {
            "voxtask was built without the whisper feature".to_string()
        }
    }

    fn create_task(&self, request: TaskRequest) -> Result<Task, ServiceError> {
        let config: TranscribeConfig = parse_config(&request.config)?;
        let input = require_input_file(&request)?;

        let mut task = request.into_task(TaskType::Transcribe);
        task.file_name = file_name_of(&input);
        task.total_steps = 3;
        task.metadata
            .insert("language".to_string(), config.language.into());
        Ok(task)
    }

    fn run(&self, task: &Task, ctx: &JobContext) -> Result<JobOutput> {
        let config: TranscribeConfig = parse_config(&task.config)?;
        let input = PathBuf::from(&task.input_path);

        let (cues, duration) = self.transcribe(&input, &config, task, ctx)?;
        ctx.checkpoint()?;
        ctx.info(format!("Recognized {} segments", cues.len()));

        let default_dir = input
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.save_folder.clone());
        let dir = output_dir(task, &default_dir);
        std::fs::create_dir_all(&dir)?;
        let path = transcript_path(&input, &dir, config.output_format);
        let body = render_transcript(&cues, config.output_format)?;
        std::fs::write(&path, &body)?;

        let mut output = JobOutput::file(path.to_string_lossy());
        output.file_size = Some(body.len() as u64);
        output.duration = Some(duration);
        output
            .metadata
            .insert("segments".to_string(), cues.len().into());
        Ok(output)
    }
}

pub fn transcript_path(input: &Path, dir: &Path, format: TranscriptFormat) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "transcript".to_string());
    dir.join(format!("{}.{}", stem, format.extension()))
}

pub fn render_transcript(cues: &[Cue], format: TranscriptFormat) -> Result<String> {
    match format {
        TranscriptFormat::Srt => to_srt(cues),
        TranscriptFormat::Txt => Ok(cues
            .iter()
            .map(|cue| cue.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")),
        TranscriptFormat::Json => {
            let segments: Vec<_> = cues
                .iter()
                .map(|cue| json!({"start": cue.start_ms, "end": cue.end_ms, "text": cue.text}))
                .collect();
            let text = cues
                .iter()
                .map(|cue| cue.text.as_str())
                .collect::<Vec<_>>()
                .join(" ");
            Ok(serde_json::to_string_pretty(&json!({
                "text": text,
                "segments": segments,
            }))?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::subtitle::parse_srt;
    use tempfile::TempDir;

    fn cues() -> Vec<Cue> {
        vec![Cue::new(0, 1500, "hello"), Cue::new(1500, 3200, "world")]
    }

    #[test]
    fn test_render_formats() -> Result<()> {
        let srt = render_transcript(&cues(), TranscriptFormat::Srt)?;
        assert_eq!(parse_srt(&srt)?, cues());

        assert_eq!(render_transcript(&cues(), TranscriptFormat::Txt)?, "hello\nworld");

        let json: serde_json::Value =
            serde_json::from_str(&render_transcript(&cues(), TranscriptFormat::Json)?)?;
        assert_eq!(json["text"], "hello world");
        assert_eq!(json["segments"][1]["start"], 1500);
        Ok(())
    }

    #[test]
    fn test_create_task() -> Result<()> {
        let dir = TempDir::new()?;
        let input = dir.path().join("talk.mp4");
        std::fs::write(&input, b"not really a video")?;
        let runner = TranscribeRunner::new("ffmpeg", dir.path().join("ggml-base.bin"), dir.path());

        let task = runner.create_task(
            TaskRequest::from_file(&input).with_option("outputFormat", "txt"),
        )?;
        assert_eq!(task.file_name, "talk.mp4");
        assert_eq!(task.metadata["language"], "auto");
        assert_eq!(
            transcript_path(&input, dir.path(), TranscriptFormat::Txt),
            dir.path().join("talk.txt")
        );

        assert!(matches!(
            runner.create_task(TaskRequest::from_file(dir.path().join("missing.wav"))),
            Err(ServiceError::Validation(_))
        ));
        assert!(matches!(
            runner.create_task(TaskRequest::from_file(&input).with_option("outputFormat", "vtt")),
            Err(ServiceError::Validation(_))
        ));
        Ok(())
    }

    #[test]
    fn test_model_selection_and_availability() -> Result<()> {
        let dir = TempDir::new()?;
        let default_model = dir.path().join("ggml-base.bin");
        let runner = TranscribeRunner::new("ffmpeg", &default_model, dir.path());
        assert!(!runner.is_available());

        std::fs::write(&default_model, b"model")?;
        assert_eq!(runner.is_available(), cfg!(feature = "whisper"));
        assert_eq!(runner.model_for("large-v3"), default_model);

        let large = dir.path().join("ggml-large-v3.bin");
        std::fs::write(&large, b"model")?;
        assert_eq!(runner.model_for("large-v3"), large);
        Ok(())
    }
}
