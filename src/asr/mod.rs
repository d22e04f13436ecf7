use anyhow::Result;

use crate::utils::subtitle::Cue;

pub mod whisper;

#[derive(Debug, Clone)]
pub struct AsrParams {
    /// Whisper language code, `None` or `"auto"` to detect.
    pub language: Option<String>,
    pub translate: bool,
    pub initial_prompt: Option<String>,
    pub n_threads: i32,
}

impl Default for AsrParams {
    fn default() -> Self {
        Self {
            language: None,
            translate: false,
            initial_prompt: None,
            n_threads: 4,
        }
    }
}

impl AsrParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_language(&mut self, language: Option<String>) -> &mut Self {
        self.language = language.filter(|l| !l.is_empty());
        self
    }

    pub fn set_translate(&mut self, translate: bool) -> &mut Self {
        self.translate = translate;
        self
    }

    pub fn set_initial_prompt(&mut self, prompt: Option<String>) -> &mut Self {
        self.initial_prompt = prompt.filter(|p| !p.is_empty());
        self
    }

    pub fn set_n_threads(&mut self, n_threads: i32) -> &mut Self {
        self.n_threads = n_threads.max(1);
        self
    }
}

/// Speech recognition over 16 kHz mono samples. Blocking; runs on a worker thread.
pub trait AsrEngine: Send + Sync {
    fn transcribe(
        &self,
        audio: &[f32],
        params: &AsrParams,
        on_progress: Box<dyn FnMut(i32) + Send + 'static>,
    ) -> Result<Vec<Cue>>;
}
