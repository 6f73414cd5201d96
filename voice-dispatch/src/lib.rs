/// Registers the FFmpeg codecs the Opus encoder needs. Call once at startup;
/// without the `opus` feature there is nothing to register.
pub fn init() -> anyhow::Result<()> {
    #[cfg(feature = "opus")]
    ffmpeg_next::init().map_err(|e| anyhow::anyhow!("ffmpeg_next init: {}", e))?;
    Ok(())
}

pub mod connection;
pub mod dispatcher;
pub mod encoder;
pub mod event;
pub mod frame;
pub mod options;
pub mod pcm;
pub mod player;
pub mod pool;
pub mod registry;
pub mod transcoder;
