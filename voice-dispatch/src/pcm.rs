use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};

/// Canonical PCM: signed 16-bit little-endian, 48 kHz, interleaved stereo.
pub const SAMPLE_RATE: u32 = 48_000;
pub const CHANNELS: u16 = 2;
pub const BYTES_PER_SAMPLE: usize = 2;

/// Samples per channel in one 20ms codec frame.
pub const SAMPLES_PER_FRAME: u32 = 960;
pub const FRAME_DURATION: Duration = Duration::from_millis(20);

/// Interleaved sample count of one frame.
pub const FRAME_SAMPLES: usize = SAMPLES_PER_FRAME as usize * CHANNELS as usize;
/// Byte length of one frame of canonical PCM.
pub const FRAME_SIZE: usize = FRAME_SAMPLES * BYTES_PER_SAMPLE;

/// Pull-based canonical PCM byte stream.
pub type PcmSource = Box<dyn AsyncRead + Send + Unpin>;

/// Fills `buf` from `source` until it is full or the source is exhausted.
///
/// Returns the number of bytes actually read; the remainder of `buf` is
/// zeroed so a short final read yields a silence-padded frame.
pub async fn read_frame<R>(source: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]).await {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    buf[filled..].fill(0);
    Ok(filled)
}

/// Decodes little-endian bytes into `out`, scaling every sample by `volume`.
pub fn decode_samples(buf: &[u8], volume: f64, out: &mut Vec<i16>) {
    out.clear();
    out.extend(
        buf.chunks_exact(BYTES_PER_SAMPLE)
            .map(|b| i16::from_le_bytes([b[0], b[1]])),
    );
    if volume != 1.0 {
        for sample in out.iter_mut() {
            *sample = scale_sample(*sample, volume);
        }
    }
}

fn scale_sample(sample: i16, volume: f64) -> i16 {
    let scaled = (sample as f64 * volume).round();
    scaled.clamp(i16::MIN as f64, i16::MAX as f64) as i16
}

/// Encodes samples back to canonical little-endian bytes.
pub fn encode_samples(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_size() {
        assert_eq!(FRAME_SIZE, 3840);
        assert_eq!(
            FRAME_DURATION.as_micros() as u64,
            SAMPLES_PER_FRAME as u64 * 1_000_000 / SAMPLE_RATE as u64
        );
    }

    #[tokio::test]
    async fn test_read_frame_pads_short_read() -> anyhow::Result<()> {
        let mut source = std::io::Cursor::new(vec![7u8; 10]);
        let mut buf = vec![1u8; 16];
        let n = read_frame(&mut source, &mut buf).await?;
        assert_eq!(n, 10);
        assert!(buf[..10].iter().all(|b| *b == 7));
        assert!(buf[10..].iter().all(|b| *b == 0));

        let n = read_frame(&mut source, &mut buf).await?;
        assert_eq!(n, 0);
        Ok(())
    }

    #[test]
    fn test_decode_samples_volume() {
        let bytes = encode_samples(&[1000, -1000, i16::MAX, i16::MIN]);
        let mut out = Vec::new();

        decode_samples(&bytes, 1.0, &mut out);
        assert_eq!(out, vec![1000, -1000, i16::MAX, i16::MIN]);

        decode_samples(&bytes, 0.5, &mut out);
        assert_eq!(out, vec![500, -500, 16384, -16384]);

        // clipped, not wrapped
        decode_samples(&bytes, 2.0, &mut out);
        assert_eq!(out, vec![2000, -2000, i16::MAX, i16::MIN]);

        decode_samples(&bytes, 0.0, &mut out);
        assert!(out.iter().all(|s| *s == 0));
    }
}
