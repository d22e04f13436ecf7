use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{file_name_of, output_dir, parse_config, require_input_file, JobRunner};
use crate::schedule::error::ServiceError;
use crate::schedule::scheduler::JobContext;
use crate::schedule::types::{JobOutput, ProgressUpdate, Task, TaskRequest, TaskType};
use crate::utils::subtitle::{read_cues, to_srt, Cue};

pub const DEFAULT_API_URL: &str = "https://api.openai.com/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranslateEngine {
    #[default]
    Openai,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TranslateConfig {
    pub engine: TranslateEngine,
    pub source_lang: String,
    pub target_lang: String,
    pub api_key: Option<String>,
    pub api_url: Option<String>,
    pub model_name: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub glossary: BTreeMap<String, String>,
    pub batch_size: usize,
}

impl Default for TranslateConfig {
    fn default() -> Self {
        Self {
            engine: TranslateEngine::Openai,
            source_lang: "auto".to_string(),
            target_lang: "zh-CN".to_string(),
            api_key: None,
            api_url: None,
            model_name: None,
            max_tokens: 2000,
            temperature: 0.3,
            glossary: BTreeMap::new(),
            batch_size: 20,
        }
    }
}

/// Endpoint settings used when a task does not carry its own.
#[derive(Debug, Clone, Default)]
pub struct ApiDefaults {
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    pub model_name: Option<String>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    content: String,
}

/// Subtitle and text translation through an OpenAI-compatible chat endpoint.
pub struct TranslateRunner {
    client: reqwest::Client,
    defaults: ApiDefaults,
    save_folder: PathBuf,
}

impl TranslateRunner {
    pub fn new(defaults: ApiDefaults, save_folder: impl Into<PathBuf>) -> Self {
        Self {
            client: reqwest::Client::new(),
            defaults,
            save_folder: save_folder.into(),
        }
    }

    fn api_key(&self, config: &TranslateConfig) -> Option<String> {
        config
            .api_key
            .clone()
            .or_else(|| self.defaults.api_key.clone())
            .filter(|key| !key.is_empty())
    }

    async fn complete(&self, config: &TranslateConfig, api_key: &str, system: &str, user: &str) -> Result<String> {
        let url = config
            .api_url
            .as_deref()
            .or(self.defaults.api_url.as_deref())
            .unwrap_or(DEFAULT_API_URL);
        let model = config
            .model_name
            .as_deref()
            .or(self.defaults.model_name.as_deref())
            .unwrap_or(DEFAULT_MODEL);

        let request = ChatRequest {
            model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        };

        let response = self
            .client
            .post(url)
            .bearer_auth(api_key)
            .timeout(REQUEST_TIMEOUT)
            .json(&request)
            .send()
            .await
            .with_context(|| format!("translation request to {} failed", url))?
            .error_for_status()?;
        let body: ChatResponse = response.json().await?;
        body.choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| anyhow!("translation response had no choices"))
    }
}

impl JobRunner for TranslateRunner {
    fn task_type(&self) -> TaskType {
        TaskType::Translate
    }

    fn is_available(&self) -> bool {
        true
    }

    fn create_task(&self, request: TaskRequest) -> Result<Task, ServiceError> {
        let config: TranslateConfig = parse_config(&request.config)?;
        let input = require_input_file(&request)?;
        if InputKind::of(&input).is_none() {
            return Err(ServiceError::validation(format!(
                "unsupported translation input: {}",
                input.display()
            )));
        }
        if self.api_key(&config).is_none() {
            return Err(ServiceError::validation("translation api key is required"));
        }

        let mut task = request.into_task(TaskType::Translate);
        task.file_name = file_name_of(&input);
        task.metadata
            .insert("targetLang".to_string(), config.target_lang.into());
        Ok(task)
    }

    fn run(&self, task: &Task, ctx: &JobContext) -> Result<JobOutput> {
        let config: TranslateConfig = parse_config(&task.config)?;
        let api_key = self
            .api_key(&config)
            .ok_or_else(|| anyhow!("translation api key is required"))?;
        let input = PathBuf::from(&task.input_path);
        let kind = InputKind::of(&input)
            .ok_or_else(|| anyhow!("unsupported translation input: {}", input.display()))?;

        let cues = match kind {
            InputKind::Subtitle => read_cues(&input)?,
            InputKind::Text => std::fs::read_to_string(&input)?
                .lines()
                .map(|line| Cue::new(0, 0, line))
                .collect(),
        };
        let lines: Vec<String> = cues.iter().map(|cue| cue.text.clone()).collect();
        ctx.info(format!("Translating {} lines to {}", lines.len(), config.target_lang));

        let handle = tokio::runtime::Handle::try_current()?;
        let system = system_prompt(&config);
        let translated = translate_in_batches(
            &lines,
            config.batch_size,
            |done, total| {
                ctx.checkpoint()?;
                if total > 0 {
                    ctx.progress(
                        ProgressUpdate::new(done as f64 * 100.0 / total as f64)
                            .with_step(format!("batch {}/{}", done, total)),
                    );
                }
                Ok(())
            },
            |batch| {
                let reply = handle.block_on(self.complete(&config, &api_key, &system, &numbered(batch)))?;
                debug!("translation reply: {}", reply);
                parse_numbered(&reply, batch.len())
            },
        )?;

        let body = match kind {
            InputKind::Subtitle => {
                let cues: Vec<Cue> = cues
                    .into_iter()
                    .zip(translated)
                    .map(|(cue, text)| Cue { text, ..cue })
                    .collect();
                to_srt(&cues)?
            }
            InputKind::Text => translated.join("\n"),
        };

        let default_dir = input
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.save_folder.clone());
        let dir = output_dir(task, &default_dir);
        std::fs::create_dir_all(&dir)?;
        let path = translated_path(&input, &dir, &config.target_lang, kind);
        std::fs::write(&path, &body)?;

        let mut output = JobOutput::file(path.to_string_lossy());
        output.file_size = Some(body.len() as u64);
        output
            .metadata
            .insert("lines".to_string(), lines.len().into());
        Ok(output)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Subtitle,
    Text,
}

impl InputKind {
    pub fn of(path: &Path) -> Option<Self> {
        if crate::utils::subtitle::is_subtitle_file(path) {
            return Some(InputKind::Subtitle);
        }
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("txt") => Some(InputKind::Text),
            _ => None,
        }
    }
}

/// `<stem>.<target>.srt` for subtitles, `<stem>.<target>.txt` for text.
pub fn translated_path(input: &Path, dir: &Path, target_lang: &str, kind: InputKind) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "translation".to_string());
    let ext = match kind {
        InputKind::Subtitle => "srt",
        InputKind::Text => "txt",
    };
    dir.join(format!("{}.{}.{}", stem, target_lang, ext))
}

pub fn system_prompt(config: &TranslateConfig) -> String {
    let source = if config.source_lang == "auto" {
        "the detected source language".to_string()
    } else {
        config.source_lang.clone()
    };
    let mut prompt = format!(
        "You are a professional subtitle translator. Translate each numbered line from {} to {}. \
         Reply with exactly the same numbering, one line per entry, and nothing else.",
        source, config.target_lang
    );
    if !config.glossary.is_empty() {
        prompt.push_str("\nUse this glossary:");
        for (term, translation) in &config.glossary {
            prompt.push_str(&format!("\n{} => {}", term, translation));
        }
    }
    prompt
}

pub fn numbered(lines: &[String]) -> String {
    lines
        .iter()
        .enumerate()
        .map(|(i, line)| format!("{}. {}", i + 1, line.replace('\n', " ")))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Reads `N. text` lines back into order. Every number in `1..=expected` must be present.
pub fn parse_numbered(reply: &str, expected: usize) -> Result<Vec<String>> {
    let mut by_number: HashMap<usize, String> = HashMap::new();
    for line in reply.lines().map(str::trim) {
        let digits = line.chars().take_while(char::is_ascii_digit).count();
        if digits == 0 {
            continue;
        }
        let Ok(number) = line[..digits].parse::<usize>() else {
            continue;
        };
        let rest = line[digits..].trim_start();
        let Some(text) = rest
            .strip_prefix('.')
            .or_else(|| rest.strip_prefix(')'))
            .or_else(|| rest.strip_prefix(':'))
        else {
            continue;
        };
        by_number.entry(number).or_insert_with(|| text.trim().to_string());
    }

    (1..=expected)
        .map(|n| {
            by_number
                .remove(&n)
                .ok_or_else(|| anyhow!("translation reply is missing line {} of {}", n, expected))
        })
        .collect()
}

/// Translates non-blank lines in batches of `batch_size`, keeping blank lines.
/// `on_batch` runs before the first batch and after each one with (done, total).
pub fn translate_in_batches<P, T>(
    lines: &[String],
    batch_size: usize,
    mut on_batch: P,
    mut translate: T,
) -> Result<Vec<String>>
where
    P: FnMut(usize, usize) -> Result<()>,
    T: FnMut(&[String]) -> Result<Vec<String>>,
{
    let pending: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, _)| i)
        .collect();
    let chunks: Vec<&[usize]> = pending.chunks(batch_size.max(1)).collect();
    let total = chunks.len();

    let mut result = lines.to_vec();
    on_batch(0, total)?;
    for (done, chunk) in chunks.into_iter().enumerate() {
        let batch: Vec<String> = chunk.iter().map(|&i| lines[i].clone()).collect();
        let translated = translate(&batch)?;
        if translated.len() != batch.len() {
            return Err(anyhow!(
                "translated {} lines, expected {}",
                translated.len(),
                batch.len()
            ));
        }
        for (&i, text) in chunk.iter().zip(translated) {
            result[i] = text;
        }
        on_batch(done + 1, total)?;
    }
    Ok(result)
}
