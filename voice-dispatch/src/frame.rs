use std::{
    fmt::{Display, Formatter},
    sync::atomic::{AtomicU64, Ordering},
};

use bytes::Bytes;
use tokio::sync::mpsc::error::TrySendError;

pub type AudioFrameSender = tokio::sync::mpsc::Sender<AudioFrame>;
pub type AudioFrameReceiver = tokio::sync::mpsc::Receiver<AudioFrame>;

/// One encoded 20ms frame plus the ordering metadata the transport stamps
/// into its packet header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AudioFrame {
    pub sequence: u16,
    pub timestamp: u32,
    pub data: Bytes,
}

impl Display for AudioFrame {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(
            f,
            "AudioFrame sequence: {}, timestamp: {}, data_len: {}",
            self.sequence,
            self.timestamp,
            self.data.len()
        )
    }
}

/// Outbound side of the transport. Called from the pacing loop, so it must
/// not block.
pub trait FrameSink: Send + Sync {
    fn send_frame(&self, frame: &AudioFrame) -> anyhow::Result<()>;
}

/// Forwards frames into a bounded channel.
///
/// A full queue drops the frame rather than stalling the pacing loop; a
/// closed queue is reported as a sink failure.
pub struct ChannelSink {
    tx: AudioFrameSender,
    dropped: AtomicU64,
}

/// Log "queue full" at most every N drops.
const DROP_LOG_INTERVAL: u64 = 50;

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, AudioFrameReceiver) {
        let (tx, rx) = tokio::sync::mpsc::channel(capacity);
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl FrameSink for ChannelSink {
    fn send_frame(&self, frame: &AudioFrame) -> anyhow::Result<()> {
        match self.tx.try_send(frame.clone()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped % DROP_LOG_INTERVAL == 1 {
                    log::debug!("frame queue full, dropped {} frames", dropped);
                }
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(anyhow::anyhow!("frame receiver closed")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(sequence: u16) -> AudioFrame {
        AudioFrame {
            sequence,
            timestamp: sequence as u32 * 960,
            data: Bytes::from_static(&[1, 2, 3]),
        }
    }

    #[test]
    fn test_channel_sink_drops_when_full() -> anyhow::Result<()> {
        let (sink, mut rx) = ChannelSink::new(1);
        sink.send_frame(&frame(0))?;
        sink.send_frame(&frame(1))?;
        assert_eq!(sink.dropped(), 1);
        assert_eq!(rx.try_recv()?.sequence, 0);
        assert!(rx.try_recv().is_err());
        Ok(())
    }

    #[test]
    fn test_channel_sink_closed_is_error() {
        let (sink, rx) = ChannelSink::new(4);
        drop(rx);
        assert!(sink.send_frame(&frame(0)).is_err());
    }
}
