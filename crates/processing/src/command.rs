//! Processor that delegates to an external executable.
//!
//! The input JSON is written to the child's stdin; the child writes the output
//! JSON to stdout and exits 0. While the child runs, the checkpoint is polled and
//! the child is killed if the job is cancelled or times out.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use mediagraph_core::JobKind;

use crate::error::ProcessingError;
use crate::processor::{Checkpoint, Processor};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct CommandProcessor {
    kind: JobKind,
    program: PathBuf,
    args: Vec<String>,
    poll_interval: Duration,
}

impl CommandProcessor {
    pub fn new(kind: JobKind, program: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            program: program.into(),
            args: Vec::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Build from a whitespace-separated command line (`"python3 -m meta2graph"`).
    pub fn from_command_line(kind: JobKind, command_line: &str) -> Option<Self> {
        let mut parts = command_line.split_whitespace();
        let program = parts.next()?;
        Some(Self::new(kind, program).with_args(parts.map(str::to_string)))
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = String>) -> Self {
        self.args = args.into_iter().collect();
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn name(&self) -> String {
        self.program.display().to_string()
    }

    fn wait_cooperatively(&self, child: &mut Child, checkpoint: &dyn Checkpoint) -> Result<ExitStatus, ProcessingError> {
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => {}
                Err(e) => {
                    let _ = child.kill();
                    return Err(ProcessingError::failed(format!("lost track of {}: {e}", self.name())));
                }
            }

            if let Err(interrupted) = checkpoint.check() {
                debug!(program = %self.name(), reason = %interrupted, "stopping child process");
                let _ = child.kill();
                let _ = child.wait();
                return Err(interrupted.into());
            }

            thread::sleep(self.poll_interval);
        }
    }
}

fn drain<R: Read + Send + 'static>(source: Option<R>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut source) = source {
            let _ = source.read_to_end(&mut buf);
        }
        buf
    })
}

impl Processor for CommandProcessor {
    fn kind(&self) -> JobKind {
        self.kind
    }

    fn process(&self, input: &JsonValue, checkpoint: &dyn Checkpoint) -> Result<JsonValue, ProcessingError> {
        checkpoint.check()?;

        let payload = serde_json::to_vec(input)
            .map_err(|e| ProcessingError::invalid_input(format!("input is not serialisable: {e}")))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ProcessingError::failed(format!("failed to start {}: {e}", self.name())))?;

        // Feed stdin and drain both pipes on helper threads so a chatty child
        // cannot block on a full pipe while we poll.
        let stdin = child.stdin.take();
        let writer = thread::spawn(move || {
            if let Some(mut stdin) = stdin {
                let _ = stdin.write_all(&payload);
            }
        });
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = self.wait_cooperatively(&mut child, checkpoint);

        let _ = writer.join();
        let stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default();
        let status = status?;

        if !status.success() {
            warn!(
                program = %self.name(),
                status = %status,
                stderr = %String::from_utf8_lossy(&stderr),
                "processor command failed"
            );
            return Err(ProcessingError::failed(format!("{} exited with {status}", self.name())));
        }

        serde_json::from_slice(&stdout)
            .map_err(|_| ProcessingError::failed(format!("{} produced output that is not JSON", self.name())))
    }
}
