use std::{
    fmt::{Display, Formatter},
    str::FromStr,
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::pcm::{FRAME_SAMPLES, encode_samples};

/// Default Opus bitrate in bits per second.
pub const DEFAULT_BITRATE: u32 = 64_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    /// Canonical PCM bytes, unchanged.
    Raw,
    /// Opus through ffmpeg's libopus (feature `opus`).
    Opus,
}

impl Display for Codec {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Codec::Raw => write!(f, "raw"),
            Codec::Opus => write!(f, "opus"),
        }
    }
}

impl FromStr for Codec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "raw" | "pcm" | "s16le" => Ok(Codec::Raw),
            "opus" | "libopus" => Ok(Codec::Opus),
            other => Err(anyhow::anyhow!("unknown codec: {}", other)),
        }
    }
}

/// Turns one frame of canonical PCM into one codec frame.
///
/// An encoder is used by one dispatcher at a time; the pool hands it out and
/// takes it back.
pub trait FrameEncoder: Send {
    fn codec(&self) -> Codec;

    /// `pcm` holds exactly one frame of interleaved samples.
    fn encode(&mut self, pcm: &[i16]) -> anyhow::Result<Bytes>;

    fn set_bitrate(&mut self, _bitrate: u32) -> anyhow::Result<()> {
        Ok(())
    }

    /// Clears per-stream state before the encoder goes back to the pool.
    fn reset(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

pub fn new_encoder(codec: Codec, bitrate: Option<u32>) -> anyhow::Result<Box<dyn FrameEncoder>> {
    match codec {
        Codec::Raw => Ok(Box::new(RawPcmEncoder)),
        #[cfg(feature = "opus")]
        Codec::Opus => Ok(Box::new(opus::OpusEncoder::new(
            bitrate.unwrap_or(DEFAULT_BITRATE),
        )?)),
        #[cfg(not(feature = "opus"))]
        Codec::Opus => {
            let _ = bitrate;
            Err(anyhow::anyhow!(
                "codec opus requires the `opus` feature of voice-dispatch"
            ))
        }
    }
}

fn check_frame_len(pcm: &[i16]) -> anyhow::Result<()> {
    if pcm.len() != FRAME_SAMPLES {
        anyhow::bail!(
            "invalid frame length {} samples, expected {}",
            pcm.len(),
            FRAME_SAMPLES
        );
    }
    Ok(())
}

/// Passes canonical PCM through untouched. Useful for transports that do
/// their own compression and for tests.
pub struct RawPcmEncoder;

impl FrameEncoder for RawPcmEncoder {
    fn codec(&self) -> Codec {
        Codec::Raw
    }

    fn encode(&mut self, pcm: &[i16]) -> anyhow::Result<Bytes> {
        check_frame_len(pcm)?;
        Ok(Bytes::from(encode_samples(pcm)))
    }
}

#[cfg(feature = "opus")]
pub mod opus {
    use bytes::Bytes;
    use ffmpeg_next::{
        ChannelLayout, Dictionary, Rational,
        format::{Sample, sample::Type},
    };

    use super::{Codec, FrameEncoder, check_frame_len};
    use crate::pcm::{SAMPLE_RATE, SAMPLES_PER_FRAME};

    pub struct OpusEncoder {
        inner: ffmpeg_next::codec::encoder::Audio,
        bitrate: u32,
        pts: i64,
    }

    // The codec context is only ever touched by the dispatcher holding it.
    unsafe impl Send for OpusEncoder {}

    impl OpusEncoder {
        pub fn new(bitrate: u32) -> anyhow::Result<Self> {
            let codec = ffmpeg_next::encoder::find_by_name("libopus")
                .ok_or(anyhow::anyhow!("codec not found: libopus"))?;
            let ctx = ffmpeg_next::codec::Context::new_with_codec(codec);
            let mut encoder = ctx.encoder().audio()?;
            encoder.set_rate(SAMPLE_RATE as i32);
            encoder.set_channel_layout(ChannelLayout::STEREO);
            encoder.set_format(Sample::I16(Type::Packed));
            encoder.set_bit_rate(bitrate as usize);
            encoder.set_time_base(Rational(1, SAMPLE_RATE as i32));

            let mut opts = Dictionary::new();
            opts.set("application", "audio");
            opts.set("frame_duration", "20");
            let inner = encoder.open_with(opts)?;
            log::debug!("libopus encoder opened, bitrate: {}", bitrate);

            Ok(Self {
                inner,
                bitrate,
                pts: 0,
            })
        }

        fn receive_packet(&mut self) -> anyhow::Result<Option<Bytes>> {
            let mut packet = ffmpeg_next::codec::packet::Packet::empty();
            match self.inner.receive_packet(&mut packet) {
                Ok(()) => Ok(Some(
                    packet.data().map(Bytes::copy_from_slice).unwrap_or_default(),
                )),
                Err(ffmpeg_next::Error::Other { errno })
                    if errno == ffmpeg_next::util::error::EAGAIN =>
                {
                    Ok(None)
                }
                Err(ffmpeg_next::Error::Eof) => Ok(None),
                Err(err) => Err(err.into()),
            }
        }
    }

    impl FrameEncoder for OpusEncoder {
        fn codec(&self) -> Codec {
            Codec::Opus
        }

        fn encode(&mut self, pcm: &[i16]) -> anyhow::Result<Bytes> {
            check_frame_len(pcm)?;
            let mut frame = ffmpeg_next::frame::Audio::new(
                Sample::I16(Type::Packed),
                SAMPLES_PER_FRAME as usize,
                ChannelLayout::STEREO,
            );
            frame.set_rate(SAMPLE_RATE);
            frame.set_pts(Some(self.pts));
            for (dst, sample) in frame.data_mut(0).chunks_exact_mut(2).zip(pcm) {
                dst.copy_from_slice(&sample.to_le_bytes());
            }
            self.pts += SAMPLES_PER_FRAME as i64;

            self.inner.send_frame(&frame)?;
            self.receive_packet()?
                .ok_or(anyhow::anyhow!("libopus produced no packet for frame"))
        }

        fn set_bitrate(&mut self, bitrate: u32) -> anyhow::Result<()> {
            if bitrate == self.bitrate {
                return Ok(());
            }
            // libopus options are fixed once the context is open
            *self = Self::new(bitrate)?;
            Ok(())
        }

        fn reset(&mut self) -> anyhow::Result<()> {
            self.pts = 0;
            Ok(())
        }
    }
}
