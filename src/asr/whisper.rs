use anyhow::{anyhow, Result};
use tracing::info;
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

use crate::asr::{AsrEngine, AsrParams};
use crate::utils::subtitle::Cue;

pub struct WhisperAsr {
    whisper_ctx: WhisperContext,
}

impl WhisperAsr {
    pub fn new(model_path: &str) -> Result<Self> {
        info!("Loading whisper model {}", model_path);
        let whisper_ctx = WhisperContext::new_with_params(model_path, WhisperContextParameters::default())
            .map_err(|e| anyhow!("failed to open whisper model {}: {}", model_path, e))?;
        Ok(Self { whisper_ctx })
    }

    fn build_params<'a>(&self, ap: &'a AsrParams) -> FullParams<'a, 'a> {
        let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });

        params.set_language(Some(ap.language.as_deref().unwrap_or("auto")));
        params.set_translate(ap.translate);
        if let Some(prompt) = &ap.initial_prompt {
            params.set_initial_prompt(prompt);
        }
        params.set_n_threads(ap.n_threads);
        params.set_temperature(0.3);

        params.set_print_special(false);
        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_print_timestamps(false);

        // keep context across windows for long recordings
        params.set_no_context(false);
        params.set_single_segment(false);
        params.set_suppress_blank(true);
        params.set_suppress_non_speech_tokens(true);
        params.set_max_initial_ts(1.0);

        params
    }
}

impl AsrEngine for WhisperAsr {
    fn transcribe(
        &self,
        audio: &[f32],
        params: &AsrParams,
        on_progress: Box<dyn FnMut(i32) + Send + 'static>,
    ) -> Result<Vec<Cue>> {
        let mut state = self.whisper_ctx.create_state()?;
        let mut full_params = self.build_params(params);
        full_params.set_progress_callback_safe(on_progress);

        state.full(full_params, audio)?;
        let num_segments = state.full_n_segments()?;

        let mut cues = Vec::with_capacity(num_segments.max(0) as usize);
        for i in 0..num_segments {
            let text = state.full_get_segment_text(i)?;
            // whisper timestamps are in centiseconds
            let start = state.full_get_segment_t0(i)? * 10;
            let end = state.full_get_segment_t1(i)? * 10;
            cues.push(Cue::new(start, end, text.trim()));
        }
        Ok(cues)
    }
}
