use std::{
    fmt::{Display, Formatter},
    path::PathBuf,
    sync::Arc,
};

use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use crate::{
    connection::VoiceConnection,
    dispatcher::{DestroyReason, Dispatcher, DispatcherEvent, DispatcherEventReceiver},
    encoder::Codec,
    event::StreamFailure,
    frame::{AudioFrame, FrameSink},
    options::PlaybackOptions,
    pcm::PcmSource,
    pool::EncoderPool,
    registry::StreamRegistry,
    transcoder::{
        FfmpegTranscoder, StreamInput, Transcode, TranscodeArgs, TranscodeEvent,
        TranscodeEventReceiver, TranscodeHandle, Transcoder,
    },
};

pub type PlayerEventReceiver = tokio::sync::broadcast::Receiver<PlayerEvent>;
pub type PlayerErrorReceiver = tokio::sync::broadcast::Receiver<PlayerError>;

const COMMAND_CHAN_CAP: usize = 256;

#[derive(Clone, Debug)]
pub struct PlayerConfig {
    /// Decoder binary used by `play_unknown_stream`.
    pub ffmpeg_path: PathBuf,
    pub codec: Codec,
    pub bitrate: Option<u32>,
    pub event_capacity: usize,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            codec: Codec::Raw,
            bitrate: None,
            event_capacity: 64,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(u64);

impl StreamId {
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl Display for StreamId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "stream-{}", self.0)
    }
}

/// Which stream `destroy_all_streams` spares.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Keep {
    Stream(StreamId),
    /// Whichever stream was registered last.
    MostRecent,
}

#[derive(Clone, Debug)]
pub enum PlayerEvent {
    /// The session's speaking flag changed.
    Speaking(bool),
    /// The stream played to the end and was removed.
    End(StreamId),
    /// A failure nobody subscribed to through `subscribe_errors`.
    Warn(String),
}

#[derive(Clone, Debug)]
pub struct PlayerError {
    pub stream: StreamId,
    pub failure: StreamFailure,
}

impl Display for PlayerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.stream, self.failure)
    }
}

/// A started playback.
#[derive(Clone)]
pub struct Playback {
    pub id: StreamId,
    pub dispatcher: Dispatcher,
}

/// Owns the streams of one voice session and keeps at most one of them
/// playing.
///
/// All registry changes go through a single command queue, including the
/// ones triggered by dispatcher and decoder events, so a teardown never races
/// a stream's own end-of-stream handling.
pub struct Player {
    cancel: CancellationToken,
    done: CancellationToken,
    tx: tokio::sync::mpsc::Sender<PlayerCommand>,
    events: tokio::sync::broadcast::Sender<PlayerEvent>,
    errors: tokio::sync::broadcast::Sender<PlayerError>,
}

impl Player {
    pub fn new(connection: Arc<dyn VoiceConnection>, config: &PlayerConfig) -> anyhow::Result<Self> {
        let pool = Arc::new(EncoderPool::new(config.codec, config.bitrate));
        // fail here rather than on the first playback if the codec is missing
        let encoder = pool.acquire()?;
        pool.release(encoder);

        let transcoder = Arc::new(FfmpegTranscoder::new(config.ffmpeg_path.clone()));
        Ok(Self::start(
            connection,
            transcoder,
            pool,
            config.event_capacity,
        ))
    }

    /// Builds a player on caller-supplied collaborators.
    pub fn with_parts(
        connection: Arc<dyn VoiceConnection>,
        transcoder: Arc<dyn Transcoder>,
        pool: Arc<EncoderPool>,
    ) -> Self {
        Self::start(
            connection,
            transcoder,
            pool,
            PlayerConfig::default().event_capacity,
        )
    }

    fn start(
        connection: Arc<dyn VoiceConnection>,
        transcoder: Arc<dyn Transcoder>,
        pool: Arc<EncoderPool>,
        event_capacity: usize,
    ) -> Self {
        let cancel = CancellationToken::new();
        let done = CancellationToken::new();
        let (tx, rx) = tokio::sync::mpsc::channel(COMMAND_CHAN_CAP);
        let (events, _) = tokio::sync::broadcast::channel(event_capacity);
        let (errors, _) = tokio::sync::broadcast::channel(event_capacity);

        let state = PlayerState {
            sink: Arc::new(ConnectionSink(Arc::clone(&connection))),
            connection,
            transcoder,
            pool,
            registry: StreamRegistry::new(),
            next_id: 1,
            speaking: false,
            speaker: None,
            tx: tx.downgrade(),
            events: events.clone(),
            errors: errors.clone(),
        };

        let cancel_clone = cancel.clone();
        let done_clone = done.clone();
        tokio::spawn(async move { Self::inner_loop(cancel_clone, done_clone, rx, state).await });

        Self {
            cancel,
            done,
            tx,
            events,
            errors,
        }
    }

    async fn inner_loop(
        cancel: CancellationToken,
        done: CancellationToken,
        mut rx: tokio::sync::mpsc::Receiver<PlayerCommand>,
        mut state: PlayerState,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break;
                },
                cmd = rx.recv() => match cmd {
                    Some(cmd) => {
                        if let Err(e) = Self::inner_command_handler(&mut state, cmd) {
                            log::error!("player command error: {:#}", e);
                        }
                    }
                    None => break,
                },
            }
        }

        Self::destroy_all_internal(&mut state, None, DestroyReason::Shutdown);
        log::info!("player stopped");
        done.cancel();
    }

    fn inner_command_handler(state: &mut PlayerState, cmd: PlayerCommand) -> anyhow::Result<()> {
        match cmd {
            PlayerCommand::PlayUnknown {
                input,
                options,
                result,
            } => {
                result
                    .send(Self::play_unknown_internal(state, input, &options))
                    .map_err(|_| anyhow::anyhow!("send result error: receiver dropped"))?;
            }
            PlayerCommand::PlayPcm {
                source,
                options,
                result,
            } => {
                result
                    .send(Self::play_pcm_internal(state, source, &options))
                    .map_err(|_| anyhow::anyhow!("send result error: receiver dropped"))?;
            }
            PlayerCommand::DestroyStream { id, result } => {
                let destroyed = Self::destroy_stream_internal(state, id, DestroyReason::End);
                let _ = result.send(destroyed);
            }
            PlayerCommand::DestroyAll { except, result } => {
                Self::destroy_all_internal(state, except, DestroyReason::End);
                let _ = result.send(());
            }
            PlayerCommand::CurrentTranscoder { result } => {
                let current = state
                    .registry
                    .last()
                    .and_then(|(_, entry)| entry.transcoder.clone());
                let _ = result.send(current);
            }
            PlayerCommand::StreamIds { result } => {
                let _ = result.send(state.registry.keys());
            }
            PlayerCommand::Dispatcher {
                id,
                dispatcher_id,
                event,
            } => Self::on_dispatcher_event(state, id, dispatcher_id, event),
            PlayerCommand::Transcoder {
                id,
                transcoder_id,
                failure,
            } => Self::on_transcoder_failure(state, id, transcoder_id, failure),
        }

        Ok(())
    }

    fn play_unknown_internal(
        state: &mut PlayerState,
        input: StreamInput,
        options: &PlaybackOptions,
    ) -> anyhow::Result<Playback> {
        options.validate()?;
        let id = state.next_stream_id();
        let description = input.describe();
        let args = TranscodeArgs {
            seek: options.seek_duration(),
            extra: Vec::new(),
        };

        let Transcode {
            output,
            handle,
            events,
        } = match state.transcoder.transcode(input, &args) {
            Ok(transcode) => transcode,
            Err(e) => {
                let failure = StreamFailure::source(anyhow::anyhow!(
                    "start decoder for {}: {:#}",
                    description,
                    e
                ));
                state.report_failure(id, failure);
                return Err(e);
            }
        };

        state.registry.insert(
            id,
            StreamEntry {
                input: description,
                transcoder: Some(handle.clone()),
                dispatcher: None,
            },
        );
        forward_transcoder_events(state.tx.clone(), id, handle, events);
        Self::start_dispatcher(state, id, output, options)
    }

    fn play_pcm_internal(
        state: &mut PlayerState,
        source: PcmSource,
        options: &PlaybackOptions,
    ) -> anyhow::Result<Playback> {
        options.validate()?;
        let id = state.next_stream_id();
        state.registry.insert(
            id,
            StreamEntry {
                input: "<pcm>".to_string(),
                transcoder: None,
                dispatcher: None,
            },
        );
        Self::start_dispatcher(state, id, source, options)
    }

    fn start_dispatcher(
        state: &mut PlayerState,
        id: StreamId,
        source: PcmSource,
        options: &PlaybackOptions,
    ) -> anyhow::Result<Playback> {
        Self::destroy_all_internal(state, Some(Keep::Stream(id)), DestroyReason::Superseded);

        let spawned = Dispatcher::spawn(
            source,
            Arc::clone(&state.sink),
            Arc::clone(&state.pool),
            options,
        );
        let (dispatcher, events) = match spawned {
            Ok(spawned) => spawned,
            Err(e) => {
                Self::destroy_stream_internal(state, id, DestroyReason::Error);
                return Err(e);
            }
        };

        if let Some(entry) = state.registry.get_mut(&id) {
            entry.dispatcher = Some(dispatcher.clone());
            log::info!(
                "{} playing {} with dispatcher {}",
                id,
                entry.input,
                dispatcher.id()
            );
        }
        forward_dispatcher_events(state.tx.clone(), id, dispatcher.clone(), events);

        Ok(Playback { id, dispatcher })
    }

    fn on_dispatcher_event(
        state: &mut PlayerState,
        id: StreamId,
        dispatcher_id: u64,
        event: DispatcherEvent,
    ) {
        let current = state
            .registry
            .get(&id)
            .and_then(|entry| entry.dispatcher.as_ref())
            .map(|d| d.id());
        if current != Some(dispatcher_id) {
            log::debug!("{} ignoring event from old dispatcher {}", id, dispatcher_id);
            return;
        }

        match event {
            DispatcherEvent::Speaking(active) => state.set_speaking(id, active),
            DispatcherEvent::End => {
                Self::destroy_stream_internal(state, id, DestroyReason::End);
                let _ = state.events.send(PlayerEvent::End(id));
            }
            DispatcherEvent::Error(failure) => {
                Self::destroy_stream_internal(state, id, DestroyReason::Error);
                state.report_failure(id, failure);
            }
        }
    }

    fn on_transcoder_failure(
        state: &mut PlayerState,
        id: StreamId,
        transcoder_id: u64,
        failure: StreamFailure,
    ) {
        let current = state
            .registry
            .get(&id)
            .and_then(|entry| entry.transcoder.as_ref())
            .map(|t| t.id());
        if current == Some(transcoder_id) {
            Self::destroy_stream_internal(state, id, DestroyReason::Error);
        }
        // the decoder failed on its own, so the failure is real even if the
        // stream already drained to its end
        state.report_failure(id, failure);
    }

    fn destroy_stream_internal(state: &mut PlayerState, id: StreamId, reason: DestroyReason) -> bool {
        let Some(entry) = state.registry.remove(&id) else {
            return false;
        };
        if let Some(transcoder) = &entry.transcoder {
            transcoder.kill();
        }
        if let Some(dispatcher) = &entry.dispatcher {
            dispatcher.destroy(reason);
        }
        if state.speaker == Some(id) {
            state.set_speaking(id, false);
        }
        log::debug!("{} destroyed: {:?}", id, reason);
        true
    }

    fn destroy_all_internal(state: &mut PlayerState, except: Option<Keep>, reason: DestroyReason) {
        let keep = match except {
            Some(Keep::Stream(id)) => Some(id),
            Some(Keep::MostRecent) => state.registry.last().map(|(id, _)| id),
            None => None,
        };
        for id in state.registry.keys() {
            if Some(id) != keep {
                Self::destroy_stream_internal(state, id, reason);
            }
        }
    }

    /// Decodes `input` and plays it, replacing whatever was playing.
    ///
    /// A decoder that cannot be started is reported like any other failure
    /// and also returned as `Err`.
    pub async fn play_unknown_stream(
        &self,
        input: StreamInput,
        options: PlaybackOptions,
    ) -> anyhow::Result<Playback> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.send(PlayerCommand::PlayUnknown {
            input,
            options,
            result: tx,
        })
        .await?;
        rx.await?
    }

    /// Plays canonical PCM, replacing whatever was playing.
    pub async fn play_pcm_stream(
        &self,
        source: PcmSource,
        options: PlaybackOptions,
    ) -> anyhow::Result<Playback> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.send(PlayerCommand::PlayPcm {
            source,
            options,
            result: tx,
        })
        .await?;
        rx.await?
    }

    /// Stops and forgets one stream. Returns false if it was unknown.
    pub async fn destroy_stream(&self, id: StreamId) -> anyhow::Result<bool> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.send(PlayerCommand::DestroyStream { id, result: tx })
            .await?;
        Ok(rx.await?)
    }

    pub async fn destroy_all_streams(&self, except: Option<Keep>) -> anyhow::Result<()> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.send(PlayerCommand::DestroyAll { except, result: tx })
            .await?;
        Ok(rx.await?)
    }

    /// The decoder of the most recently registered stream, if it has one.
    pub async fn current_transcoder(&self) -> anyhow::Result<Option<TranscodeHandle>> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.send(PlayerCommand::CurrentTranscoder { result: tx })
            .await?;
        Ok(rx.await?)
    }

    /// Registered streams in registration order.
    pub async fn stream_ids(&self) -> anyhow::Result<Vec<StreamId>> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.send(PlayerCommand::StreamIds { result: tx }).await?;
        Ok(rx.await?)
    }

    pub fn subscribe(&self) -> PlayerEventReceiver {
        self.events.subscribe()
    }

    /// Failures are delivered here while at least one receiver is alive;
    /// otherwise they become `PlayerEvent::Warn`.
    pub fn subscribe_errors(&self) -> PlayerErrorReceiver {
        self.errors.subscribe()
    }

    /// Destroys every stream and stops the command loop.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub async fn stopped(&self) {
        self.done.cancelled().await
    }

    async fn send(&self, cmd: PlayerCommand) -> anyhow::Result<()> {
        // commands carry non-Sync readers, so the SendError is not kept
        self.tx
            .send(cmd)
            .await
            .map_err(|_| anyhow::anyhow!("player stopped"))
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.stop();
    }
}

enum PlayerCommand {
    PlayUnknown {
        input: StreamInput,
        options: PlaybackOptions,
        result: tokio::sync::oneshot::Sender<anyhow::Result<Playback>>,
    },
    PlayPcm {
        source: PcmSource,
        options: PlaybackOptions,
        result: tokio::sync::oneshot::Sender<anyhow::Result<Playback>>,
    },
    DestroyStream {
        id: StreamId,
        result: tokio::sync::oneshot::Sender<bool>,
    },
    DestroyAll {
        except: Option<Keep>,
        result: tokio::sync::oneshot::Sender<()>,
    },
    CurrentTranscoder {
        result: tokio::sync::oneshot::Sender<Option<TranscodeHandle>>,
    },
    StreamIds {
        result: tokio::sync::oneshot::Sender<Vec<StreamId>>,
    },
    Dispatcher {
        id: StreamId,
        dispatcher_id: u64,
        event: DispatcherEvent,
    },
    Transcoder {
        id: StreamId,
        transcoder_id: u64,
        failure: StreamFailure,
    },
}

struct StreamEntry {
    input: String,
    transcoder: Option<TranscodeHandle>,
    dispatcher: Option<Dispatcher>,
}

struct PlayerState {
    connection: Arc<dyn VoiceConnection>,
    sink: Arc<dyn FrameSink>,
    transcoder: Arc<dyn Transcoder>,
    pool: Arc<EncoderPool>,
    registry: StreamRegistry<StreamId, StreamEntry>,
    next_id: u64,
    speaking: bool,
    // stream whose dispatcher last reported speaking
    speaker: Option<StreamId>,
    tx: tokio::sync::mpsc::WeakSender<PlayerCommand>,
    events: tokio::sync::broadcast::Sender<PlayerEvent>,
    errors: tokio::sync::broadcast::Sender<PlayerError>,
}

impl PlayerState {
    fn next_stream_id(&mut self) -> StreamId {
        let id = StreamId(self.next_id);
        self.next_id += 1;
        id
    }

    fn set_speaking(&mut self, id: StreamId, active: bool) {
        if active {
            self.speaker = Some(id);
        } else if self.speaker == Some(id) {
            self.speaker = None;
        } else {
            return;
        }
        if self.speaking == active {
            return;
        }
        self.speaking = active;
        self.connection.set_speaking(active);
        let _ = self.events.send(PlayerEvent::Speaking(active));
    }

    fn report_failure(&self, id: StreamId, failure: StreamFailure) {
        if self.errors.receiver_count() > 0 {
            let _ = self.errors.send(PlayerError {
                stream: id,
                failure,
            });
            return;
        }
        let message = format!("{}: {}", id, failure);
        log::warn!("unhandled stream error, {}", message);
        let _ = self.events.send(PlayerEvent::Warn(message));
    }
}

/// Lets dispatchers write to the session without knowing about speaking.
struct ConnectionSink(Arc<dyn VoiceConnection>);

impl FrameSink for ConnectionSink {
    fn send_frame(&self, frame: &AudioFrame) -> anyhow::Result<()> {
        self.0.send_frame(frame)
    }
}

fn forward_dispatcher_events(
    tx: tokio::sync::mpsc::WeakSender<PlayerCommand>,
    id: StreamId,
    dispatcher: Dispatcher,
    mut events: DispatcherEventReceiver,
) {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                biased;
                event = events.recv() => match event {
                    Ok(event) => event,
                    Err(RecvError::Lagged(n)) => {
                        log::warn!("{} missed {} dispatcher events", id, n);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
                // buffered events win the biased select, so nothing is left
                _ = dispatcher.closed() => break,
            };

            let last = matches!(event, DispatcherEvent::End | DispatcherEvent::Error(_));
            let Some(tx) = tx.upgrade() else {
                break;
            };
            let cmd = PlayerCommand::Dispatcher {
                id,
                dispatcher_id: dispatcher.id(),
                event,
            };
            if tx.send(cmd).await.is_err() || last {
                break;
            }
        }
    });
}

fn forward_transcoder_events(
    tx: tokio::sync::mpsc::WeakSender<PlayerCommand>,
    id: StreamId,
    handle: TranscodeHandle,
    mut events: TranscodeEventReceiver,
) {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                biased;
                event = events.recv() => match event {
                    Ok(event) => event,
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                },
                _ = handle.killed() => break,
            };

            match event {
                TranscodeEvent::Finished => {
                    log::debug!("{} decoder finished", id);
                    break;
                }
                TranscodeEvent::Error(failure) => {
                    if let Some(tx) = tx.upgrade() {
                        let _ = tx
                            .send(PlayerCommand::Transcoder {
                                id,
                                transcoder_id: handle.id(),
                                failure,
                            })
                            .await;
                    }
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
#[path = "player_test.rs"]
mod player_test;
