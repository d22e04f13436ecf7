pub mod concurrent;
pub mod config;
pub mod schedule;
pub mod storage;
pub mod utils;

#[cfg(feature = "whisper")]
pub mod asr;
#[cfg(feature = "whisper")]
pub mod audio;

use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use config::AppConfig;
use schedule::processors::translate::ApiDefaults;
use schedule::processors::{DownloadRunner, MediaSplitRunner, TranscribeRunner, TranslateRunner};
use schedule::{EventBus, ServiceContext, TaskManager};
use storage::task::TaskService;

/// Everything the front end needs, built once at startup and passed around explicitly.
pub struct AppContext {
    pub config: AppConfig,
    pub db: TaskService,
    pub events: EventBus,
    pub manager: TaskManager,
}

impl AppContext {
    /// Opens the task store and registers every available job runner.
    pub async fn init(config: AppConfig) -> Result<Self> {
        config.ensure_dirs()?;
        let db = TaskService::sqlite(&config.sqlite_url).await?;
        Self::with_store(config, db)
    }

    /// Same as `init` with a caller-provided store.
    pub fn with_store(config: AppConfig, db: TaskService) -> Result<Self> {
        let events = EventBus::new(config.event_capacity);
        let ctx = ServiceContext::new(db.clone(), events.clone(), config.service_settings());
        let mut manager = TaskManager::new(ctx);

        manager.register(Arc::new(
            DownloadRunner::new(&config.ytdlp, &config.save_folder).with_proxy(config.proxy.clone()),
        ))?;
        manager.register(Arc::new(TranscribeRunner::new(
            &config.ffmpeg,
            &config.whisper_model,
            &config.save_folder,
        )))?;
        manager.register(Arc::new(TranslateRunner::new(
            ApiDefaults {
                api_url: config.translate_api_url.clone(),
                api_key: config.translate_api_key.clone(),
                model_name: config.translate_model.clone(),
            },
            &config.save_folder,
        )))?;
        manager.register(Arc::new(MediaSplitRunner::new(
            &config.ffmpeg,
            &config.ffprobe,
            &config.save_folder,
        )))?;

        for task_type in manager.task_types() {
            if !manager.is_available(task_type) {
                warn!("Service {} is unavailable", task_type);
            }
        }
        info!("Application context ready ({})", config.sqlite_url);

        Ok(Self {
            config,
            db,
            events,
            manager,
        })
    }

    /// Cancels in-flight work and stops every service. Returns abandoned jobs.
    pub async fn shutdown(&mut self) -> usize {
        self.manager.cleanup().await
    }
}
