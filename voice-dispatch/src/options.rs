use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Options accepted by every playback entry point.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackOptions {
    /// Start offset into the source, in seconds.
    pub seek: f64,
    /// Linear gain applied to every sample.
    pub volume: f64,
    /// How many times each frame is sent.
    pub passes: u32,
    // bps, None = encoder default
    pub bitrate: Option<u32>,
}

impl Default for PlaybackOptions {
    fn default() -> Self {
        Self {
            seek: 0.0,
            volume: 1.0,
            passes: 1,
            bitrate: None,
        }
    }
}

impl PlaybackOptions {
    pub fn with_seek(mut self, seek: Duration) -> Self {
        self.seek = seek.as_secs_f64();
        self
    }

    pub fn with_volume(mut self, volume: f64) -> Self {
        self.volume = volume;
        self
    }

    pub fn with_passes(mut self, passes: u32) -> Self {
        self.passes = passes;
        self
    }

    pub fn with_bitrate(mut self, bitrate: u32) -> Self {
        self.bitrate = Some(bitrate);
        self
    }

    pub fn seek_duration(&self) -> Duration {
        Duration::try_from_secs_f64(self.seek).unwrap_or_default()
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.seek.is_finite() || self.seek < 0.0 {
            anyhow::bail!("seek must be a non-negative number of seconds, got {}", self.seek);
        }
        check_volume(self.volume)?;
        if self.passes < 1 {
            anyhow::bail!("passes must be at least 1");
        }
        if self.bitrate == Some(0) {
            anyhow::bail!("bitrate must be positive");
        }
        Ok(())
    }
}

pub(crate) fn check_volume(volume: f64) -> anyhow::Result<()> {
    if !volume.is_finite() || volume < 0.0 {
        anyhow::bail!("volume must be a non-negative number, got {}", volume);
    }
    Ok(())
}
