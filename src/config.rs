use std::{path::PathBuf, sync::LazyLock};

use voice_dispatch::{encoder::Codec, player::PlayerConfig};

pub struct RelayConfig {
    ffmpeg: PathBuf,
    codec: Codec,
    bitrate: Option<u32>,
}

impl RelayConfig {
    pub fn from_env() -> Self {
        let ffmpeg = std::env::var("VOICE_RELAY_FFMPEG").unwrap_or_else(|_| "ffmpeg".to_string());
        let codec = match std::env::var("VOICE_RELAY_CODEC") {
            Ok(value) => value.parse().unwrap_or_else(|e| {
                log::warn!("ignoring VOICE_RELAY_CODEC: {:#}", e);
                Codec::Raw
            }),
            Err(_) => Codec::Raw,
        };
        let bitrate = std::env::var("VOICE_RELAY_BITRATE")
            .ok()
            .and_then(|value| match value.parse::<u32>() {
                Ok(bitrate) if bitrate > 0 => Some(bitrate),
                _ => {
                    log::warn!("ignoring VOICE_RELAY_BITRATE={}", value);
                    None
                }
            });

        Self {
            ffmpeg: PathBuf::from(ffmpeg),
            codec,
            bitrate,
        }
    }

    pub fn ffmpeg(&self) -> &PathBuf {
        &self.ffmpeg
    }

    pub fn player_config(&self) -> PlayerConfig {
        PlayerConfig {
            ffmpeg_path: self.ffmpeg.clone(),
            codec: self.codec,
            bitrate: self.bitrate,
            ..Default::default()
        }
    }
}

pub fn config() -> &'static RelayConfig {
    static CONFIG: LazyLock<RelayConfig> = LazyLock::new(RelayConfig::from_env);
    &CONFIG
}
