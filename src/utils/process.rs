use std::collections::VecDeque;
use std::ffi::{OsStr, OsString};
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use anyhow::Result;
use thiserror::Error;
use tracing::{debug, warn};

use crate::concurrent::{CancelToken, JobCancelled};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const TAIL_LINES: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    Stdout(String),
    Stderr(String),
}

impl Output {
    pub fn line(&self) -> &str {
        match self {
            Output::Stdout(line) | Output::Stderr(line) => line,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with {code}: {detail}")]
    Failed {
        program: String,
        code: String,
        detail: String,
    },
}

/// Last lines seen on each stream of a finished process.
#[derive(Debug, Default)]
pub struct ProcessOutput {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

/// A child process driven from a worker thread, killed when the job's
/// token is cancelled.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    program: String,
    args: Vec<OsString>,
    current_dir: Option<PathBuf>,
}

impl ProcessRunner {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Runs to completion, handing every output line to `on_output` in the
    /// order it was read. Blocks the calling thread.
    pub fn run<F>(&self, token: &CancelToken, mut on_output: F) -> Result<ProcessOutput>
    where
        F: FnMut(&Output),
    {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }
        debug!("Running {} {:?}", self.program, self.args);

        let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        let (tx, rx) = mpsc::channel();
        if let Some(stdout) = child.stdout.take() {
            let tx = tx.clone();
            thread::spawn(move || forward_lines(stdout, tx, Output::Stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            let tx = tx.clone();
            thread::spawn(move || forward_lines(stderr, tx, Output::Stderr));
        }
        drop(tx);

        let mut stdout_tail = VecDeque::with_capacity(TAIL_LINES);
        let mut stderr_tail = VecDeque::with_capacity(TAIL_LINES);
        loop {
            if token.is_cancelled() {
                kill(&mut child, &self.program);
                return Err(JobCancelled.into());
            }
            match rx.recv_timeout(POLL_INTERVAL) {
                Ok(output) => {
                    let tail = match &output {
                        Output::Stdout(_) => &mut stdout_tail,
                        Output::Stderr(_) => &mut stderr_tail,
                    };
                    if tail.len() == TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(output.line().to_string());
                    on_output(&output);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        let status = child.wait()?;
        if token.is_cancelled() {
            return Err(JobCancelled.into());
        }
        if !status.success() {
            let detail = stderr_tail
                .iter()
                .rev()
                .find(|line| !line.trim().is_empty())
                .cloned()
                .unwrap_or_else(|| "no error output".to_string());
            return Err(ProcessError::Failed {
                program: self.program.clone(),
                code: status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                detail,
            }
            .into());
        }

        Ok(ProcessOutput {
            stdout: stdout_tail.into(),
            stderr: stderr_tail.into(),
        })
    }
}

// Reads until EOF so the child never writes into a closed pipe. Bytes that are
// not UTF-8 (ffmpeg echoes container metadata verbatim) are replaced.
fn forward_lines<R: Read>(reader: R, tx: mpsc::Sender<Output>, wrap: fn(String) -> Output) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("Stopped reading child output: {}", e);
                break;
            }
        }
        if buf.last() == Some(&b'\n') {
            buf.pop();
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
        }
        let line = String::from_utf8_lossy(&buf).into_owned();
        if tx.send(wrap(line)).is_err() {
            break;
        }
    }
}

fn kill(child: &mut Child, program: &str) {
    if let Err(e) = child.kill() {
        warn!("Failed to kill {}: {}", program, e);
    }
    let _ = child.wait();
}

/// True when `program arg` starts and exits successfully.
pub fn probe(program: &str, arg: &str) -> bool {
    Command::new(program)
        .arg(arg)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}
