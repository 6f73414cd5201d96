use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use futures::{Stream, StreamExt};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;

use crate::{
    encoder::FrameEncoder,
    event::StreamFailure,
    frame::{AudioFrame, FrameSink},
    options::{PlaybackOptions, check_volume},
    pcm::{
        CHANNELS, FRAME_DURATION, FRAME_SAMPLES, FRAME_SIZE, PcmSource, SAMPLES_PER_FRAME,
        decode_samples, read_frame,
    },
    pool::EncoderPool,
};

pub type DispatcherEventSender = tokio::sync::broadcast::Sender<DispatcherEvent>;
pub type DispatcherEventReceiver = tokio::sync::broadcast::Receiver<DispatcherEvent>;

/// Speaking toggles at most twice per pause, so a small buffer is plenty.
const EVENT_CHAN_CAP: usize = 64;

/// Exponent mapping perceived loudness to linear gain.
const LOGARITHMIC_VOLUME_EXP: f64 = 1.660964;

static NEXT_DISPATCHER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Debug)]
pub enum DispatcherEvent {
    /// Emitted only when the value changes.
    Speaking(bool),
    /// The source is exhausted and the last frame has been sent.
    End,
    Error(StreamFailure),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DestroyReason {
    End,
    Superseded,
    Shutdown,
    Error,
}

/// Sequence/timestamp counters of one stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct FrameClock {
    pub(crate) frame_count: u64,
    pub(crate) sequence: u16,
    pub(crate) timestamp: u32,
}

impl FrameClock {
    pub(crate) fn advance(&mut self) {
        self.frame_count += 1;
        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(SAMPLES_PER_FRAME);
    }
}

/// Snapshot of a dispatcher, see `Dispatcher::state`.
#[derive(Clone, Debug, PartialEq)]
pub struct DispatcherState {
    pub channels: u16,
    pub frame_count: u64,
    /// Sequence number of the next frame.
    pub sequence: u16,
    /// Timestamp of the next frame, in samples.
    pub timestamp: u32,
    pub paused_time: Duration,
    pub volume: f64,
    pub passes: u32,
    pub seek_offset: Duration,
    pub paused: bool,
    pub speaking: bool,
    pub destroyed: Option<DestroyReason>,
}

/// Written by the handle, read by the pacing loop on every tick.
#[derive(Clone, Debug)]
struct Controls {
    paused_at: Option<Instant>,
    paused_total: Duration,
    volume: f64,
    bitrate: Option<u32>,
}

impl Controls {
    fn is_paused(&self) -> bool {
        self.paused_at.is_some()
    }

    fn paused_time(&self) -> Duration {
        self.paused_total + self.paused_at.map(|at| at.elapsed()).unwrap_or_default()
    }
}

/// Written by the pacing loop after every frame.
#[derive(Clone, Debug, Default)]
struct Progress {
    clock: FrameClock,
    speaking: bool,
    ended: bool,
    failed: bool,
}

struct Inner {
    id: u64,
    passes: u32,
    seek_offset: Duration,
    started_at: Instant,
    cancel: CancellationToken,
    done: CancellationToken,
    reason: Mutex<Option<DestroyReason>>,
    // held around every frame send and signal
    emit: Arc<Mutex<()>>,
    controls: tokio::sync::watch::Sender<Controls>,
    progress: tokio::sync::watch::Receiver<Progress>,
    events: DispatcherEventSender,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Paces one PCM source into codec frames, one frame per 20ms tick.
///
/// Clones share the same stream. Dropping the last handle destroys it.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    /// Starts pacing `source` into `sink` right away.
    ///
    /// The returned receiver is subscribed before the loop starts and sees
    /// every event; `subscribe` adds more observers.
    pub fn spawn(
        source: PcmSource,
        sink: Arc<dyn FrameSink>,
        pool: Arc<EncoderPool>,
        options: &PlaybackOptions,
    ) -> anyhow::Result<(Self, DispatcherEventReceiver)> {
        options.validate()?;
        let mut encoder = pool.acquire()?;
        if let Some(bitrate) = options.bitrate {
            if let Err(e) = encoder.set_bitrate(bitrate) {
                pool.release(encoder);
                return Err(e);
            }
        }

        let id = NEXT_DISPATCHER_ID.fetch_add(1, Ordering::Relaxed);
        let (events, receiver) = tokio::sync::broadcast::channel(EVENT_CHAN_CAP);
        let (controls_tx, controls_rx) = tokio::sync::watch::channel(Controls {
            paused_at: None,
            paused_total: Duration::ZERO,
            volume: options.volume,
            bitrate: options.bitrate,
        });
        let (progress_tx, progress_rx) = tokio::sync::watch::channel(Progress::default());
        let cancel = CancellationToken::new();
        let done = CancellationToken::new();
        let emit = Arc::new(Mutex::new(()));

        let dispatch = DispatchLoop {
            id,
            source,
            encoder,
            pool,
            sink,
            passes: options.passes,
            cancel: cancel.clone(),
            done: done.clone(),
            emit: Arc::clone(&emit),
            controls: controls_rx,
            progress: progress_tx,
            events: events.clone(),
            clock: FrameClock::default(),
            speaking: false,
            applied_bitrate: options.bitrate,
            pending: None,
            pcm: vec![0u8; FRAME_SIZE],
            samples: Vec::with_capacity(FRAME_SAMPLES),
        };

        log::info!(
            "dispatcher {} started, seek: {:?}, volume: {}, passes: {}",
            id,
            options.seek_duration(),
            options.volume,
            options.passes
        );
        tokio::spawn(dispatch.run());

        let dispatcher = Self {
            inner: Arc::new(Inner {
                id,
                passes: options.passes,
                seek_offset: options.seek_duration(),
                started_at: Instant::now(),
                cancel,
                done,
                reason: Mutex::new(None),
                emit,
                controls: controls_tx,
                progress: progress_rx,
                events,
            }),
        };
        Ok((dispatcher, receiver))
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn subscribe(&self) -> DispatcherEventReceiver {
        self.inner.events.subscribe()
    }

    /// Events as a stream; lagged events are skipped.
    pub fn event_stream(&self) -> impl Stream<Item = DispatcherEvent> + Send + 'static {
        BroadcastStream::new(self.subscribe()).filter_map(|r| async move { r.ok() })
    }

    /// No frame is sent once this returns; a frame read but not yet sent is
    /// held back and goes out first after `resume`.
    pub fn pause(&self) {
        let _emit = self.inner.emit.lock().unwrap_or_else(PoisonError::into_inner);
        self.inner.controls.send_modify(|c| {
            if c.paused_at.is_none() {
                c.paused_at = Some(Instant::now());
            }
        });
        log::debug!("dispatcher {} paused", self.inner.id);
    }

    pub fn resume(&self) {
        self.inner.controls.send_modify(|c| {
            if let Some(at) = c.paused_at.take() {
                c.paused_total += at.elapsed();
            }
        });
        log::debug!("dispatcher {} resumed", self.inner.id);
    }

    pub fn is_paused(&self) -> bool {
        self.inner.controls.borrow().is_paused()
    }

    /// Linear gain, applied from the next frame on.
    pub fn set_volume(&self, volume: f64) -> anyhow::Result<()> {
        check_volume(volume)?;
        self.inner.controls.send_modify(|c| c.volume = volume);
        Ok(())
    }

    pub fn volume(&self) -> f64 {
        self.inner.controls.borrow().volume
    }

    pub fn set_volume_decibels(&self, db: f64) -> anyhow::Result<()> {
        self.set_volume(10f64.powf(db / 20.0))
    }

    pub fn volume_decibels(&self) -> f64 {
        20.0 * self.volume().log10()
    }

    /// Sets the gain on a perceptual scale, where 0.5 sounds half as loud.
    pub fn set_volume_logarithmic(&self, volume: f64) -> anyhow::Result<()> {
        check_volume(volume)?;
        self.set_volume(volume.powf(LOGARITHMIC_VOLUME_EXP))
    }

    pub fn volume_logarithmic(&self) -> f64 {
        self.volume().powf(1.0 / LOGARITHMIC_VOLUME_EXP)
    }

    /// Applied to the encoder before the next frame.
    pub fn set_bitrate(&self, bitrate: u32) -> anyhow::Result<()> {
        if bitrate == 0 {
            anyhow::bail!("bitrate must be positive");
        }
        self.inner.controls.send_modify(|c| c.bitrate = Some(bitrate));
        Ok(())
    }

    /// Stops the pacing loop. No frame or signal is emitted once this
    /// returns; the encoder goes back to the pool when the loop exits.
    /// Repeated calls are no-ops.
    pub fn destroy(&self, reason: DestroyReason) {
        let _emit = self.inner.emit.lock().unwrap_or_else(PoisonError::into_inner);
        if self.inner.cancel.is_cancelled() || self.inner.done.is_cancelled() {
            return;
        }
        *self
            .inner
            .reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(reason);
        log::debug!("dispatcher {} destroyed: {:?}", self.inner.id, reason);
        self.inner.cancel.cancel();
    }

    /// Also true once the loop has ended on its own.
    pub fn is_destroyed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// True once the pacing loop has exited and released its encoder.
    pub fn is_finished(&self) -> bool {
        self.inner.done.is_cancelled()
    }

    pub async fn closed(&self) {
        self.inner.done.cancelled().await
    }

    pub fn state(&self) -> DispatcherState {
        let progress = self.inner.progress.borrow().clone();
        let controls = self.inner.controls.borrow().clone();
        DispatcherState {
            channels: CHANNELS,
            frame_count: progress.clock.frame_count,
            sequence: progress.clock.sequence,
            timestamp: progress.clock.timestamp,
            paused_time: controls.paused_time(),
            volume: controls.volume,
            passes: self.inner.passes,
            seek_offset: self.inner.seek_offset,
            paused: controls.is_paused(),
            speaking: progress.speaking,
            destroyed: self.destroy_reason(&progress),
        }
    }

    fn destroy_reason(&self, progress: &Progress) -> Option<DestroyReason> {
        let requested = *self
            .inner
            .reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        requested.or(if progress.failed {
            Some(DestroyReason::Error)
        } else if progress.ended {
            Some(DestroyReason::End)
        } else {
            None
        })
    }

    /// Audio emitted so far.
    pub fn stream_time(&self) -> Duration {
        let frames = self.inner.progress.borrow().clock.frame_count;
        Duration::from_micros(frames * FRAME_DURATION.as_micros() as u64)
    }

    /// Wall time since the dispatcher started, pauses included.
    pub fn total_stream_time(&self) -> Duration {
        self.inner.started_at.elapsed()
    }

    pub fn paused_time(&self) -> Duration {
        self.inner.controls.borrow().paused_time()
    }

    /// Position in the source: seek offset plus emitted audio.
    pub fn position(&self) -> Duration {
        self.inner.seek_offset + self.stream_time()
    }
}

enum Step {
    Continue,
    End,
    Cancelled,
}

enum Outcome {
    End,
    Destroyed,
    Failed(StreamFailure),
}

struct DispatchLoop {
    id: u64,
    source: PcmSource,
    encoder: Box<dyn FrameEncoder>,
    pool: Arc<EncoderPool>,
    sink: Arc<dyn FrameSink>,
    passes: u32,
    cancel: CancellationToken,
    done: CancellationToken,
    emit: Arc<Mutex<()>>,
    controls: tokio::sync::watch::Receiver<Controls>,
    progress: tokio::sync::watch::Sender<Progress>,
    events: DispatcherEventSender,
    clock: FrameClock,
    speaking: bool,
    applied_bitrate: Option<u32>,
    // bytes held in `pcm` by a pause that landed after the read
    pending: Option<usize>,
    pcm: Vec<u8>,
    samples: Vec<i16>,
}

impl DispatchLoop {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval(FRAME_DURATION);
        // late ticks catch up against the fixed schedule
        ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
        let mut controls_open = true;

        let outcome = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break Outcome::Destroyed,
                changed = self.controls.changed(), if controls_open => {
                    if changed.is_err() {
                        controls_open = false;
                    } else if self.controls.borrow_and_update().is_paused() {
                        self.signal_speaking(false);
                    }
                }
                _ = ticker.tick() => match self.tick().await {
                    Ok(Step::Continue) => {}
                    Ok(Step::End) => break Outcome::End,
                    Ok(Step::Cancelled) => break Outcome::Destroyed,
                    Err(failure) => break Outcome::Failed(failure),
                },
            }
        };

        self.finish(outcome);
    }

    async fn tick(&mut self) -> Result<Step, StreamFailure> {
        let (paused, bitrate) = {
            let controls = self.controls.borrow();
            (controls.is_paused(), controls.bitrate)
        };
        if paused {
            self.signal_speaking(false);
            return Ok(Step::Continue);
        }

        if bitrate != self.applied_bitrate {
            if let Some(bitrate) = bitrate {
                self.encoder
                    .set_bitrate(bitrate)
                    .map_err(StreamFailure::encode)?;
            }
            self.applied_bitrate = bitrate;
        }

        let filled = match self.pending.take() {
            Some(filled) => filled,
            None => {
                let filled = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Ok(Step::Cancelled),
                    read = read_frame(&mut self.source, &mut self.pcm) => {
                        read.map_err(StreamFailure::source)?
                    }
                };
                // the read may have blocked across a pause
                if self.controls.borrow().is_paused() {
                    self.pending = Some(filled);
                    self.signal_speaking(false);
                    return Ok(Step::Continue);
                }
                filled
            }
        };
        if filled == 0 {
            return Ok(Step::End);
        }

        let volume = self.controls.borrow().volume;
        decode_samples(&self.pcm, volume, &mut self.samples);
        if self.cancel.is_cancelled() {
            return Ok(Step::Cancelled);
        }
        let data = self
            .encoder
            .encode(&self.samples)
            .map_err(StreamFailure::encode)?;
        let frame = AudioFrame {
            sequence: self.clock.sequence,
            timestamp: self.clock.timestamp,
            data,
        };

        {
            let emit = Arc::clone(&self.emit);
            let _emit = emit.lock().unwrap_or_else(PoisonError::into_inner);
            if self.cancel.is_cancelled() {
                return Ok(Step::Cancelled);
            }
            if self.controls.borrow().is_paused() {
                self.pending = Some(filled);
                self.set_speaking(false);
                return Ok(Step::Continue);
            }
            self.set_speaking(true);
            for _ in 0..self.passes {
                if self.cancel.is_cancelled() {
                    return Ok(Step::Cancelled);
                }
                self.sink
                    .send_frame(&frame)
                    .map_err(StreamFailure::sink)?;
            }
            self.clock.advance();
            let clock = self.clock;
            self.progress.send_modify(|p| p.clock = clock);
        }

        if filled < FRAME_SIZE {
            log::debug!(
                "dispatcher {} padded final frame ({} of {} bytes)",
                self.id,
                filled,
                FRAME_SIZE
            );
            return Ok(Step::End);
        }
        Ok(Step::Continue)
    }

    /// Like `set_speaking`, for callers not already holding the emit lock.
    fn signal_speaking(&mut self, active: bool) {
        let emit = Arc::clone(&self.emit);
        let _emit = emit.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.cancel.is_cancelled() {
            self.set_speaking(active);
        }
    }

    fn set_speaking(&mut self, active: bool) {
        if self.speaking == active {
            return;
        }
        self.speaking = active;
        self.progress.send_modify(|p| p.speaking = active);
        let _ = self.events.send(DispatcherEvent::Speaking(active));
    }

    fn finish(mut self, outcome: Outcome) {
        let emit = Arc::clone(&self.emit);
        let guard = emit.lock().unwrap_or_else(PoisonError::into_inner);
        // a destroy that won the lock silences the ending
        let outcome = if self.cancel.is_cancelled() {
            Outcome::Destroyed
        } else {
            outcome
        };
        match outcome {
            Outcome::Destroyed => {
                log::debug!(
                    "dispatcher {} stopped after {} frames",
                    self.id,
                    self.clock.frame_count
                );
            }
            Outcome::End => {
                log::info!(
                    "dispatcher {} reached end of stream after {} frames",
                    self.id,
                    self.clock.frame_count
                );
                self.set_speaking(false);
                self.progress.send_modify(|p| p.ended = true);
                let _ = self.events.send(DispatcherEvent::End);
            }
            Outcome::Failed(failure) => {
                log::error!("dispatcher {} failed: {}", self.id, failure);
                self.set_speaking(false);
                self.progress.send_modify(|p| p.failed = true);
                let _ = self.events.send(DispatcherEvent::Error(failure));
            }
        }
        // later destroy calls are no-ops
        self.cancel.cancel();
        drop(guard);

        self.progress.send_modify(|p| p.speaking = false);
        self.pool.release(self.encoder);
        self.done.cancel();
    }
}

#[cfg(test)]
#[path = "dispatcher_test.rs"]
mod dispatcher_test;
