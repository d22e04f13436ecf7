#![allow(clippy::uninlined_format_args)]

use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{info, warn};

use voxtask::config::AppConfig;
use voxtask::schedule::{TaskEvent, TaskRequest, TaskStatus, TaskType};
use voxtask::storage::task::TaskQuery;
use voxtask::utils::logger;
use voxtask::AppContext;

#[derive(Parser, Debug)]
#[command(name = "voxtask")]
#[command(version)]
#[command(about = "Download, transcribe, translate and split media as tracked tasks")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Download a bilibili or youtube video
    Download {
        url: String,
        #[arg(long, default_value = "best")]
        quality: String,
        #[arg(long, default_value = "mp4")]
        format: String,
        #[arg(long)]
        proxy: Option<String>,
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },
    /// Transcribe speech to subtitles
    Transcribe {
        input: PathBuf,
        #[arg(long, default_value = "auto")]
        language: String,
        #[arg(long, default_value = "base")]
        model_size: String,
        /// srt, txt or json
        #[arg(long, default_value = "srt")]
        format: String,
        /// Translate speech to English while transcribing
        #[arg(long)]
        translate: bool,
        #[arg(long)]
        prompt: Option<String>,
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },
    /// Translate a subtitle or text file
    Translate {
        input: PathBuf,
        #[arg(long, default_value = "zh-CN")]
        target: String,
        #[arg(long, default_value = "auto")]
        source: String,
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },
    /// Split a media file into segments
    Split {
        input: PathBuf,
        /// duration, count or custom
        #[arg(long, default_value = "duration")]
        mode: String,
        /// Segment length in seconds
        #[arg(long, default_value_t = 300.0)]
        duration: f64,
        #[arg(long)]
        count: Option<u32>,
        /// Cut points in seconds, comma separated
        #[arg(long, value_delimiter = ',')]
        points: Vec<f64>,
        #[arg(long)]
        format: Option<String>,
        #[arg(long)]
        no_audio: bool,
        #[arg(long)]
        no_video: bool,
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },
    /// List stored tasks, newest first
    List {
        #[arg(long)]
        status: Option<TaskStatus>,
        #[arg(long = "type")]
        task_type: Option<TaskType>,
        #[arg(short, long)]
        keyword: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: u64,
    },
    /// Print one task as JSON
    Show { id: String },
    /// Reset a task and run it again
    Restart { id: String },
    /// Retry a failed task
    Retry { id: String },
    /// Cancel and remove a task
    Delete { id: String },
    /// Task counts by status and type
    Stats,
    /// Remove finished tasks older than the given number of days
    Cleanup {
        #[arg(long, default_value_t = 30)]
        days: i64,
        #[arg(long)]
        include_successful: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::from_env();

    let _guard = match logger::init(&config.log_dir) {
        Ok(guard) => Some(guard),
        Err(e) => {
            logger::init_stderr();
            warn!("File logging disabled: {}", e);
            None
        }
    };
    info!("voxtask {} ({})", env!("CARGO_PKG_VERSION"), env!("GIT_HASH"));
    config.log_warnings();

    let mut app = AppContext::init(config).await?;
    let result = execute(&mut app, cli.command).await;
    app.shutdown().await;
    result
}

async fn execute(app: &mut AppContext, command: Commands) -> Result<()> {
    match command {
        Commands::Download {
            url,
            quality,
            format,
            proxy,
            output_dir,
        } => {
            let mut request = TaskRequest::from_url(url)
                .with_option("quality", quality)
                .with_option("format", format);
            if let Some(proxy) = proxy {
                request = request.with_option("proxy", proxy);
            }
            run_task(app, TaskType::Download, with_output_dir(request, output_dir)).await
        }
        Commands::Transcribe {
            input,
            language,
            model_size,
            format,
            translate,
            prompt,
            output_dir,
        } => {
            let mut request = TaskRequest::from_file(input)
                .with_option("language", language)
                .with_option("modelSize", model_size)
                .with_option("outputFormat", format)
                .with_option("translate", translate);
            if let Some(prompt) = prompt {
                request = request.with_option("prompt", prompt);
            }
            run_task(app, TaskType::Transcribe, with_output_dir(request, output_dir)).await
        }
        Commands::Translate {
            input,
            target,
            source,
            api_key,
            model,
            output_dir,
        } => {
            let mut request = TaskRequest::from_file(input)
                .with_option("targetLang", target)
                .with_option("sourceLang", source);
            if let Some(api_key) = api_key {
                request = request.with_option("apiKey", api_key);
            }
            if let Some(model) = model {
                request = request.with_option("modelName", model);
            }
            run_task(app, TaskType::Translate, with_output_dir(request, output_dir)).await
        }
        Commands::Split {
            input,
            mode,
            duration,
            count,
            points,
            format,
            no_audio,
            no_video,
            output_dir,
        } => {
            let mut request = TaskRequest::from_file(input)
                .with_option("splitMode", mode)
                .with_option("duration", duration)
                .with_option("customPoints", points)
                .with_option("keepAudio", !no_audio)
                .with_option("keepVideo", !no_video);
            if let Some(count) = count {
                request = request.with_option("segmentCount", count);
            }
            if let Some(format) = format {
                request = request.with_option("outputFormat", format);
            }
            run_task(app, TaskType::MediaSplit, with_output_dir(request, output_dir)).await
        }
        Commands::List {
            status,
            task_type,
            keyword,
            limit,
        } => {
            let mut query = TaskQuery::new().limit(limit);
            if let Some(status) = status {
                query = query.status(status);
            }
            if let Some(task_type) = task_type {
                query = query.task_type(task_type);
            }
            if let Some(keyword) = keyword {
                query = query.keyword(keyword);
            }
            for task in app.db.list_by(&query).await {
                println!(
                    "{}  {:<14} {:<9} {:>6}  {}  {}",
                    task.id,
                    task.task_type.as_str(),
                    task.status.as_str(),
                    task.progress_percentage(),
                    task.create_time.format("%Y-%m-%d %H:%M:%S"),
                    task.display_name()
                );
            }
            Ok(())
        }
        Commands::Show { id } => {
            let task = app
                .manager
                .get_task(&id)
                .await
                .ok_or_else(|| anyhow!("task {} not found", id))?;
            println!("{}", serde_json::to_string_pretty(&task)?);
            Ok(())
        }
        Commands::Restart { id } => {
            let mut events = app.events.subscribe();
            if !app.manager.restart(&id).await {
                return Err(anyhow!("task {} could not be restarted", id));
            }
            drive(app, &mut events).await;
            report(app, &id).await
        }
        Commands::Retry { id } => {
            let mut events = app.events.subscribe();
            if !app.manager.retry(&id).await {
                return Err(anyhow!("task {} cannot be retried", id));
            }
            drive(app, &mut events).await;
            report(app, &id).await
        }
        Commands::Delete { id } => {
            if !app.manager.delete_task(&id).await {
                return Err(anyhow!("task {} not found", id));
            }
            println!("deleted {}", id);
            Ok(())
        }
        Commands::Stats => {
            let stats = app.db.statistics().await;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
        Commands::Cleanup {
            days,
            include_successful,
        } => {
            let removed = app.db.cleanup_old(days, !include_successful).await;
            println!("removed {} task(s) older than {} days", removed, days);
            Ok(())
        }
    }
}

fn with_output_dir(request: TaskRequest, output_dir: Option<PathBuf>) -> TaskRequest {
    match output_dir {
        Some(dir) => request.with_option("outputDir", Value::from(dir.to_string_lossy().into_owned())),
        None => request,
    }
}

async fn run_task(app: &mut AppContext, task_type: TaskType, request: TaskRequest) -> Result<()> {
    let mut events = app.events.subscribe();
    let task = app.manager.create_task(task_type, request).await?;
    drive(app, &mut events).await;
    report(app, &task.id).await
}

/// Applies worker messages and prints events until nothing is in flight.
/// Ctrl-C cancels whatever is still running.
async fn drive(app: &mut AppContext, events: &mut broadcast::Receiver<TaskEvent>) {
    loop {
        print_events(events);
        if app.manager.in_flight_count() == 0 {
            app.manager.tick().await;
            print_events(events);
            return;
        }

        if app.manager.wait_or(tokio::signal::ctrl_c()).await {
            warn!("Interrupted, cancelling running tasks");
            for id in app.manager.in_flight_ids() {
                app.manager.cancel(&id).await;
            }
        }
    }
}

fn print_events(events: &mut broadcast::Receiver<TaskEvent>) {
    loop {
        match events.try_recv() {
            Ok(event) => print_event(&event),
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                warn!("Skipped {} events", skipped);
            }
            Err(_) => return,
        }
    }
}

fn print_event(event: &TaskEvent) {
    match event {
        TaskEvent::Created { service, task } => {
            println!("[{}] created {} ({})", service, task.id, task.display_name());
        }
        TaskEvent::Updated { service, task } => {
            let mut line = format!("[{}] {} {} {}", service, short_id(&task.id), task.status, task.progress_percentage());
            if !task.speed.is_empty() {
                line.push_str(&format!(" {}", task.speed));
            }
            if !task.eta.is_empty() {
                line.push_str(&format!(" ETA {}", task.eta));
            }
            if !task.current_step.is_empty() {
                line.push_str(&format!(" ({})", task.current_step));
            }
            println!("{}", line);
        }
        TaskEvent::Finished {
            service,
            task,
            success,
            error_msg,
        } => {
            if *success {
                println!("[{}] {} finished: {}", service, short_id(&task.id), task.output_path);
            } else {
                println!("[{}] {} failed: {}", service, short_id(&task.id), error_msg);
            }
        }
        TaskEvent::Log {
            service,
            level,
            message,
        } => println!("[{}] {} {}", service, level, message),
    }
}

async fn report(app: &AppContext, task_id: &str) -> Result<()> {
    let task = app
        .manager
        .get_task(task_id)
        .await
        .ok_or_else(|| anyhow!("task {} disappeared", task_id))?;
    match task.status {
        TaskStatus::Success => {
            for path in &task.output_paths {
                println!("{}", path);
            }
            Ok(())
        }
        status => Err(anyhow!(
            "task {} ended {}{}",
            task.id,
            status,
            if task.error_msg.is_empty() {
                String::new()
            } else {
                format!(": {}", task.error_msg)
            }
        )),
    }
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}
