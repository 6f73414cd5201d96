use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{io::DuplexStream, time::timeout};

use super::*;
use crate::{
    encoder::Codec,
    event::FailureKind,
    pcm::{FRAME_SIZE, SAMPLES_PER_FRAME, encode_samples},
};

const WAIT: Duration = Duration::from_secs(5);

fn pcm_frames(frames: usize, value: i16) -> PcmSource {
    Box::new(std::io::Cursor::new(encode_samples(&vec![
        value;
        frames * FRAME_SIZE / 2
    ])))
}

/// A source that never yields data while the writer half is alive.
fn pending_source() -> (DuplexStream, PcmSource) {
    let (writer, reader) = tokio::io::duplex(64);
    (writer, Box::new(reader))
}

#[derive(Default)]
struct RecordingConnection {
    reject: bool,
    frames: Mutex<Vec<AudioFrame>>,
    speaking: Mutex<Vec<bool>>,
}

impl RecordingConnection {
    fn frames(&self) -> Vec<AudioFrame> {
        self.frames.lock().unwrap().clone()
    }

    fn speaking(&self) -> Vec<bool> {
        self.speaking.lock().unwrap().clone()
    }
}

impl FrameSink for RecordingConnection {
    fn send_frame(&self, frame: &AudioFrame) -> anyhow::Result<()> {
        if self.reject {
            anyhow::bail!("transport closed");
        }
        self.frames.lock().unwrap().push(frame.clone());
        Ok(())
    }
}

impl VoiceConnection for RecordingConnection {
    fn set_speaking(&self, active: bool) {
        self.speaking.lock().unwrap().push(active);
    }
}

/// Hands out decodes whose output never produces data; failures are
/// injected through the recorded handles.
#[derive(Default)]
struct ScriptedTranscoder {
    fail_start: bool,
    started: Mutex<Vec<(TranscodeHandle, TranscodeArgs, DuplexStream)>>,
}

impl ScriptedTranscoder {
    fn last_handle(&self) -> TranscodeHandle {
        self.started.lock().unwrap().last().unwrap().0.clone()
    }

    fn last_args(&self) -> TranscodeArgs {
        self.started.lock().unwrap().last().unwrap().1.clone()
    }
}

impl Transcoder for ScriptedTranscoder {
    fn transcode(&self, _input: StreamInput, args: &TranscodeArgs) -> anyhow::Result<Transcode> {
        if self.fail_start {
            anyhow::bail!("no such file");
        }
        let (writer, reader) = tokio::io::duplex(64);
        let (handle, events) = TranscodeHandle::new();
        self.started
            .lock()
            .unwrap()
            .push((handle.clone(), args.clone(), writer));
        Ok(Transcode {
            output: Box::new(reader),
            handle,
            events,
        })
    }
}

struct Harness {
    player: Player,
    connection: Arc<RecordingConnection>,
    transcoder: Arc<ScriptedTranscoder>,
    pool: Arc<EncoderPool>,
}

fn setup(connection: RecordingConnection, transcoder: ScriptedTranscoder) -> Harness {
    let connection = Arc::new(connection);
    let transcoder = Arc::new(transcoder);
    let pool = Arc::new(EncoderPool::new(Codec::Raw, None));
    let player = Player::with_parts(connection.clone(), transcoder.clone(), pool.clone());
    Harness {
        player,
        connection,
        transcoder,
        pool,
    }
}

fn default_setup() -> Harness {
    setup(RecordingConnection::default(), ScriptedTranscoder::default())
}

/// Receives player events until one matches, returning everything seen.
async fn events_until<F>(
    events: &mut PlayerEventReceiver,
    mut done: F,
) -> anyhow::Result<Vec<PlayerEvent>>
where
    F: FnMut(&PlayerEvent) -> bool,
{
    let mut seen = Vec::new();
    loop {
        let event = timeout(WAIT, events.recv()).await??;
        let matched = done(&event);
        seen.push(event);
        if matched {
            return Ok(seen);
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_three_frames_then_entry_removed() -> anyhow::Result<()> {
    let h = default_setup();
    let mut events = h.player.subscribe();

    let playback = h
        .player
        .play_pcm_stream(pcm_frames(3, 100), PlaybackOptions::default())
        .await?;
    assert_eq!(h.player.stream_ids().await?, vec![playback.id]);

    let id = playback.id;
    let seen = events_until(&mut events, |e| matches!(e, PlayerEvent::End(end) if *end == id)).await?;
    let speaking: Vec<bool> = seen
        .iter()
        .filter_map(|e| match e {
            PlayerEvent::Speaking(active) => Some(*active),
            _ => None,
        })
        .collect();
    assert_eq!(speaking, vec![true, false]);
    assert!(h.player.stream_ids().await?.is_empty());

    let frames = h.connection.frames();
    let sequences: Vec<u16> = frames.iter().map(|f| f.sequence).collect();
    let timestamps: Vec<u32> = frames.iter().map(|f| f.timestamp).collect();
    assert_eq!(sequences, vec![0, 1, 2]);
    assert_eq!(
        timestamps,
        vec![0, SAMPLES_PER_FRAME, 2 * SAMPLES_PER_FRAME]
    );
    assert_eq!(h.connection.speaking(), vec![true, false]);

    playback.dispatcher.closed().await;
    assert_eq!(h.pool.outstanding(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_new_stream_supersedes_old() -> anyhow::Result<()> {
    let h = default_setup();
    let mut events = h.player.subscribe();

    let first = h
        .player
        .play_pcm_stream(pcm_frames(100, 1), PlaybackOptions::default())
        .await?;
    events_until(&mut events, |e| matches!(e, PlayerEvent::Speaking(true))).await?;
    let mut first_events = first.dispatcher.subscribe();

    let second = h
        .player
        .play_pcm_stream(pcm_frames(100, 2), PlaybackOptions::default())
        .await?;
    assert!(first.dispatcher.is_destroyed());
    assert_eq!(
        first.dispatcher.state().destroyed,
        Some(DestroyReason::Superseded)
    );
    assert_eq!(h.player.stream_ids().await?, vec![second.id]);

    first.dispatcher.closed().await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(first_events.try_recv().is_err(), "old stream went quiet");
    assert!(!second.dispatcher.is_destroyed());
    assert_eq!(h.connection.speaking(), vec![true, false, true]);

    h.player.stop();
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_destroy_stream_is_idempotent() -> anyhow::Result<()> {
    let h = default_setup();
    let (_writer, source) = pending_source();
    let playback = h
        .player
        .play_pcm_stream(source, PlaybackOptions::default())
        .await?;

    assert!(h.player.destroy_stream(playback.id).await?);
    let after_once = h.player.stream_ids().await?;
    assert!(!h.player.destroy_stream(playback.id).await?);
    assert_eq!(h.player.stream_ids().await?, after_once);
    assert!(after_once.is_empty());

    assert!(playback.dispatcher.is_destroyed());
    assert_eq!(playback.dispatcher.state().destroyed, Some(DestroyReason::End));
    playback.dispatcher.closed().await;
    assert_eq!(h.pool.outstanding(), 0);

    // unknown ids are ignored
    assert!(!h.player.destroy_stream(StreamId(999)).await?);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_destroy_all_streams_keep_rules() -> anyhow::Result<()> {
    let h = default_setup();
    let (_w1, first) = pending_source();
    let (_w2, second) = pending_source();

    h.player
        .play_pcm_stream(first, PlaybackOptions::default())
        .await?;
    let last = h
        .player
        .play_pcm_stream(second, PlaybackOptions::default())
        .await?;

    h.player.destroy_all_streams(Some(Keep::MostRecent)).await?;
    assert_eq!(h.player.stream_ids().await?, vec![last.id]);

    h.player.destroy_all_streams(Some(Keep::Stream(last.id))).await?;
    assert_eq!(h.player.stream_ids().await?, vec![last.id]);
    assert!(!last.dispatcher.is_destroyed());

    h.player.destroy_all_streams(None).await?;
    assert!(h.player.stream_ids().await?.is_empty());
    assert!(last.dispatcher.is_destroyed());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_decoder_error_without_listener_warns() -> anyhow::Result<()> {
    let h = default_setup();
    let mut events = h.player.subscribe();

    let options = PlaybackOptions::default().with_seek(Duration::from_millis(1500));
    let playback = h
        .player
        .play_unknown_stream(StreamInput::Path("song.ogg".to_string()), options)
        .await?;
    assert_eq!(h.transcoder.last_args().seek, Duration::from_millis(1500));

    let handle = h.transcoder.last_handle();
    handle.fail(StreamFailure::source(anyhow::anyhow!("corrupt header")));

    let seen = events_until(&mut events, |e| matches!(e, PlayerEvent::Warn(_))).await?;
    match seen.last() {
        Some(PlayerEvent::Warn(message)) => {
            assert!(message.contains("corrupt header"));
            assert!(message.contains(&playback.id.to_string()));
        }
        other => panic!("expected a warning, got {:?}", other),
    }

    assert!(h.player.stream_ids().await?.is_empty());
    assert!(handle.is_killed());
    assert!(playback.dispatcher.is_destroyed());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_decoder_error_goes_to_error_listener() -> anyhow::Result<()> {
    let h = default_setup();
    let mut events = h.player.subscribe();
    let mut errors = h.player.subscribe_errors();

    let playback = h
        .player
        .play_unknown_stream(
            StreamInput::Path("song.ogg".to_string()),
            PlaybackOptions::default(),
        )
        .await?;
    h.transcoder
        .last_handle()
        .fail(StreamFailure::source(anyhow::anyhow!("decoder crashed")));

    let error = timeout(WAIT, errors.recv()).await??;
    assert_eq!(error.stream, playback.id);
    assert_eq!(error.failure.kind, FailureKind::Source);

    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, PlayerEvent::Warn(_)), "unexpected {:?}", event);
    }
    assert!(h.player.stream_ids().await?.is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_decoder_start_failure() -> anyhow::Result<()> {
    let h = setup(
        RecordingConnection::default(),
        ScriptedTranscoder {
            fail_start: true,
            ..Default::default()
        },
    );
    let mut events = h.player.subscribe();

    let result = h
        .player
        .play_unknown_stream(
            StreamInput::Path("missing.mp3".to_string()),
            PlaybackOptions::default(),
        )
        .await;
    assert!(result.is_err());

    let seen = events_until(&mut events, |e| matches!(e, PlayerEvent::Warn(_))).await?;
    assert!(matches!(seen.last(), Some(PlayerEvent::Warn(m)) if m.contains("no such file")));
    assert!(h.player.stream_ids().await?.is_empty());
    assert_eq!(h.pool.outstanding(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_current_transcoder() -> anyhow::Result<()> {
    let h = default_setup();
    assert!(h.player.current_transcoder().await?.is_none());

    h.player
        .play_unknown_stream(
            StreamInput::Path("song.ogg".to_string()),
            PlaybackOptions::default(),
        )
        .await?;
    let started = h.transcoder.last_handle();
    let current = h.player.current_transcoder().await?;
    assert_eq!(current.map(|t| t.id()), Some(started.id()));

    // a plain PCM stream replaces it and has no decoder
    let (_writer, source) = pending_source();
    h.player
        .play_pcm_stream(source, PlaybackOptions::default())
        .await?;
    assert!(h.player.current_transcoder().await?.is_none());
    assert!(started.is_killed());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_sink_failure_clears_speaking() -> anyhow::Result<()> {
    let h = setup(
        RecordingConnection {
            reject: true,
            ..Default::default()
        },
        ScriptedTranscoder::default(),
    );
    let mut errors = h.player.subscribe_errors();

    let playback = h
        .player
        .play_pcm_stream(pcm_frames(5, 1), PlaybackOptions::default())
        .await?;

    let error = timeout(WAIT, errors.recv()).await??;
    assert_eq!(error.stream, playback.id);
    assert_eq!(error.failure.kind, FailureKind::Sink);

    assert!(h.player.stream_ids().await?.is_empty());
    assert_eq!(h.connection.speaking(), vec![true, false]);
    playback.dispatcher.closed().await;
    assert_eq!(h.pool.outstanding(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_invalid_options_rejected() -> anyhow::Result<()> {
    let h = default_setup();
    let result = h
        .player
        .play_pcm_stream(pcm_frames(1, 0), PlaybackOptions::default().with_volume(-1.0))
        .await;
    assert!(result.is_err());
    assert!(h.player.stream_ids().await?.is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_stop_destroys_streams() -> anyhow::Result<()> {
    let h = default_setup();
    let (_writer, source) = pending_source();
    let playback = h
        .player
        .play_pcm_stream(source, PlaybackOptions::default())
        .await?;

    h.player.stop();
    timeout(WAIT, h.player.stopped()).await?;
    assert_eq!(
        playback.dispatcher.state().destroyed,
        Some(DestroyReason::Shutdown)
    );
    playback.dispatcher.closed().await;
    assert_eq!(h.pool.outstanding(), 0);

    let (_writer, source) = pending_source();
    assert!(
        h.player
            .play_pcm_stream(source, PlaybackOptions::default())
            .await
            .is_err()
    );
    Ok(())
}
