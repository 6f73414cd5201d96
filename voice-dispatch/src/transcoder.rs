use std::{
    fmt::{Debug, Formatter},
    path::PathBuf,
    process::Stdio,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::Command,
};
use tokio_util::sync::CancellationToken;

use crate::{
    event::StreamFailure,
    pcm::{CHANNELS, PcmSource, SAMPLE_RATE},
};

pub type TranscodeEventSender = tokio::sync::broadcast::Sender<TranscodeEvent>;
pub type TranscodeEventReceiver = tokio::sync::broadcast::Receiver<TranscodeEvent>;

/// Keep this much of the decoder's stderr for error reports.
const STDERR_TAIL: usize = 1024;

/// Anything the decoder can read.
pub enum StreamInput {
    /// A file path or URL handed to the decoder as-is.
    Path(String),
    /// Bytes piped into the decoder's stdin.
    Reader(Box<dyn AsyncRead + Send + Unpin>),
}

impl StreamInput {
    pub fn describe(&self) -> String {
        match self {
            StreamInput::Path(path) => path.clone(),
            StreamInput::Reader(_) => "<stdin>".to_string(),
        }
    }
}

impl Debug for StreamInput {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamInput::Path(path) => f.debug_tuple("Path").field(path).finish(),
            StreamInput::Reader(_) => f.debug_tuple("Reader").finish(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct TranscodeArgs {
    /// Start offset, passed through as the decoder's `-ss`.
    pub seek: Duration,
    /// Extra decoder arguments, inserted after the input.
    pub extra: Vec<String>,
}

#[derive(Clone, Debug)]
pub enum TranscodeEvent {
    /// The decoder exited cleanly; its output drains to EOF.
    Finished,
    Error(StreamFailure),
}

static NEXT_TRANSCODE_ID: AtomicU64 = AtomicU64::new(1);

/// Control half of a running decode. Cloning shares the same process.
#[derive(Clone)]
pub struct TranscodeHandle {
    id: u64,
    cancel: CancellationToken,
    events: TranscodeEventSender,
}

impl TranscodeHandle {
    /// Creates a handle and its first event receiver. The receiver exists
    /// before any event can be sent, so nothing is missed.
    pub fn new() -> (Self, TranscodeEventReceiver) {
        let (events, receiver) = tokio::sync::broadcast::channel(16);
        (
            Self {
                id: NEXT_TRANSCODE_ID.fetch_add(1, Ordering::Relaxed),
                cancel: CancellationToken::new(),
                events,
            },
            receiver,
        )
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Terminates the decoder. Idempotent.
    pub fn kill(&self) {
        if !self.cancel.is_cancelled() {
            log::debug!("transcoder {} kill requested", self.id);
            self.cancel.cancel();
        }
    }

    pub fn is_killed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn killed(&self) {
        self.cancel.cancelled().await
    }

    pub fn subscribe(&self) -> TranscodeEventReceiver {
        self.events.subscribe()
    }

    pub fn finish(&self) {
        let _ = self.events.send(TranscodeEvent::Finished);
    }

    pub fn fail(&self, failure: StreamFailure) {
        log::debug!("transcoder {} failed: {}", self.id, failure);
        let _ = self.events.send(TranscodeEvent::Error(failure));
    }
}

/// A started decode: the PCM byte stream plus its control handle.
pub struct Transcode {
    pub output: PcmSource,
    pub handle: TranscodeHandle,
    pub events: TranscodeEventReceiver,
}

/// Turns an arbitrary input into canonical PCM.
///
/// Start failures are returned as `Err`; anything after that arrives as a
/// `TranscodeEvent::Error`. Implementations must terminate their decoder
/// when the handle is killed.
pub trait Transcoder: Send + Sync {
    fn transcode(&self, input: StreamInput, args: &TranscodeArgs) -> anyhow::Result<Transcode>;
}

/// Decodes through an `ffmpeg` child process writing s16le to stdout.
pub struct FfmpegTranscoder {
    program: PathBuf,
}

impl FfmpegTranscoder {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

fn ffmpeg_args(input: &str, args: &TranscodeArgs) -> Vec<String> {
    let mut out: Vec<String> = ["-hide_banner", "-loglevel", "error", "-analyzeduration", "0"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    if !args.seek.is_zero() {
        out.push("-ss".to_string());
        out.push(format!("{:.3}", args.seek.as_secs_f64()));
    }
    out.push("-i".to_string());
    out.push(input.to_string());
    out.extend(args.extra.iter().cloned());
    out.extend([
        "-f".to_string(),
        "s16le".to_string(),
        "-ar".to_string(),
        SAMPLE_RATE.to_string(),
        "-ac".to_string(),
        CHANNELS.to_string(),
        "pipe:1".to_string(),
    ]);
    out
}

fn stderr_tail(buf: Vec<u8>) -> String {
    let start = buf.len().saturating_sub(STDERR_TAIL);
    String::from_utf8_lossy(&buf[start..]).trim().to_string()
}

impl Transcoder for FfmpegTranscoder {
    fn transcode(&self, input: StreamInput, args: &TranscodeArgs) -> anyhow::Result<Transcode> {
        let input_arg = match &input {
            StreamInput::Path(path) => path.clone(),
            StreamInput::Reader(_) => "pipe:0".to_string(),
        };
        let piped_input = matches!(input, StreamInput::Reader(_));

        let mut command = Command::new(&self.program);
        command
            .args(ffmpeg_args(&input_arg, args))
            .stdin(if piped_input {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| anyhow::anyhow!("spawn {}: {}", self.program.display(), e))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(anyhow::anyhow!("decoder stdout not captured"))?;
        let stderr = child.stderr.take();

        let (handle, events) = TranscodeHandle::new();
        log::info!(
            "transcoder {} started: {} (seek {:?})",
            handle.id(),
            input.describe(),
            args.seek
        );

        if let (StreamInput::Reader(mut reader), Some(mut stdin)) = (input, child.stdin.take()) {
            let cancel = handle.cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    copied = tokio::io::copy(&mut reader, &mut stdin) => match copied {
                        Ok(n) => log::debug!("decoder stdin closed after {} bytes", n),
                        // the decoder may stop reading before the input ends
                        Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                        Err(e) => log::warn!("decoder stdin copy error: {}", e),
                    }
                }
            });
        }

        let stderr_task = stderr.map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = stderr.read_to_end(&mut buf).await;
                stderr_tail(buf)
            })
        });

        let supervisor = handle.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = supervisor.killed() => {
                    // kill() also reaps the child
                    if let Err(e) = child.kill().await {
                        log::warn!("transcoder {} kill error: {}", supervisor.id(), e);
                    }
                    log::debug!("transcoder {} terminated", supervisor.id());
                }
                status = child.wait() => match status {
                    Ok(status) if status.success() => {
                        log::debug!("transcoder {} finished", supervisor.id());
                        supervisor.finish();
                    }
                    Ok(status) => {
                        let stderr = match stderr_task {
                            Some(task) => task.await.unwrap_or_default(),
                            None => String::new(),
                        };
                        supervisor.fail(StreamFailure::source(anyhow::anyhow!(
                            "decoder exited with {}: {}",
                            status,
                            stderr
                        )));
                    }
                    Err(e) => {
                        supervisor.fail(StreamFailure::source(anyhow::anyhow!(
                            "wait for decoder: {}",
                            e
                        )));
                    }
                },
            }
        });

        Ok(Transcode {
            output: Box::new(stdout),
            handle,
            events,
        })
    }
}
