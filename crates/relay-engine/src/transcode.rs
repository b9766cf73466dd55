//! External transcoder invocation over piped stdio.
//!
//! The transcoding process itself is an external collaborator; this module
//! only owns wiring the source stream into its stdin and handing its stdout
//! back to the pipeline. The process runs asynchronously: its exit status is
//! reported out-of-band through logs and does not directly fail the
//! producing fetch, but a broken output stream fails the pipeline as usual.

use std::io;
use std::process::Stdio;

use tokio::io::AsyncRead;
use tokio::process::{ChildStdout, Command};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum TranscodeError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("transcoder stdio pipes unavailable")]
    Stdio,
}

/// Command line of the external transcoder.
#[derive(Debug, Clone)]
pub struct TranscodeSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl TranscodeSpec {
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// ffmpeg invocation extracting an MP3 audio stream from whatever
    /// container arrives on stdin.
    pub fn mp3_audio() -> Self {
        Self::new("ffmpeg", ["-i", "pipe:", "-f", "mp3", "-"])
    }
}

/// Spawns the external transcoding process per transfer.
pub struct Transcoder {
    spec: TranscodeSpec,
}

impl Transcoder {
    pub fn new(spec: TranscodeSpec) -> Self {
        Self { spec }
    }

    /// Start the process, feed `input` to its stdin in the background and
    /// return its stdout as the converted stream.
    ///
    /// Dropping the returned stream tears the process down: its next write
    /// fails and the feeder task reaps it.
    pub fn spawn<R>(&self, input: R) -> Result<ChildStdout, TranscodeError>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        info!(program = %self.spec.program, "starting transcoder");
        let mut child = Command::new(&self.spec.program)
            .args(&self.spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TranscodeError::Spawn {
                program: self.spec.program.clone(),
                source,
            })?;

        let mut stdin = child.stdin.take().ok_or(TranscodeError::Stdio)?;
        let stdout = child.stdout.take().ok_or(TranscodeError::Stdio)?;

        let program = self.spec.program.clone();
        tokio::spawn(async move {
            let mut input = input;
            if let Err(err) = tokio::io::copy(&mut input, &mut stdin).await {
                warn!(program = %program, error = %err, "failed to feed transcoder input");
            }
            // Close stdin so the process can flush its output and exit.
            drop(stdin);
            match child.wait().await {
                Ok(status) if status.success() => {
                    debug!(program = %program, "transcoder exited cleanly")
                }
                Ok(status) => warn!(program = %program, %status, "transcoder exited with failure"),
                Err(err) => warn!(program = %program, error = %err, "failed to reap transcoder"),
            }
        });

        Ok(stdout)
    }
}
