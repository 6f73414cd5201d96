use crate::frame::{AudioFrame, AudioFrameReceiver, ChannelSink, FrameSink};

/// The voice session the player streams into. Frames go out through the
/// `FrameSink` half; `set_speaking` is the presence hook.
pub trait VoiceConnection: FrameSink {
    fn set_speaking(&self, active: bool);
}

/// A connection that hands frames to a local channel and publishes the
/// speaking flag through a watch channel.
pub struct ChannelConnection {
    sink: ChannelSink,
    speaking: tokio::sync::watch::Sender<bool>,
}

impl ChannelConnection {
    pub fn new(capacity: usize) -> (Self, AudioFrameReceiver) {
        let (sink, frames) = ChannelSink::new(capacity);
        let (speaking, _) = tokio::sync::watch::channel(false);
        (Self { sink, speaking }, frames)
    }

    pub fn is_speaking(&self) -> bool {
        *self.speaking.borrow()
    }

    pub fn watch_speaking(&self) -> tokio::sync::watch::Receiver<bool> {
        self.speaking.subscribe()
    }

    pub fn dropped_frames(&self) -> u64 {
        self.sink.dropped()
    }
}

impl FrameSink for ChannelConnection {
    fn send_frame(&self, frame: &AudioFrame) -> anyhow::Result<()> {
        self.sink.send_frame(frame)
    }
}

impl VoiceConnection for ChannelConnection {
    fn set_speaking(&self, active: bool) {
        self.speaking.send_if_modified(|current| {
            if *current == active {
                return false;
            }
            *current = active;
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speaking_flag() {
        let (connection, _frames) = ChannelConnection::new(4);
        let watch = connection.watch_speaking();
        assert!(!connection.is_speaking());

        connection.set_speaking(true);
        assert!(connection.is_speaking());
        assert!(watch.has_changed().unwrap_or(false));
    }
}
