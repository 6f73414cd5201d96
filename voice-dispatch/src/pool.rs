use std::sync::{
    Mutex, PoisonError,
    atomic::{AtomicUsize, Ordering},
};

use crate::encoder::{Codec, FrameEncoder, new_encoder};

type EncoderFactory = Box<dyn Fn() -> anyhow::Result<Box<dyn FrameEncoder>> + Send + Sync>;

/// Session-scoped pool of encoders.
///
/// `acquire` never blocks: an empty pool allocates a new encoder. Every
/// acquired encoder must come back through `release`; `outstanding` counts
/// the ones that have not.
pub struct EncoderPool {
    factory: EncoderFactory,
    idle: Mutex<Vec<Box<dyn FrameEncoder>>>,
    outstanding: AtomicUsize,
    created: AtomicUsize,
}

impl EncoderPool {
    pub fn new(codec: Codec, bitrate: Option<u32>) -> Self {
        Self::with_factory(move || new_encoder(codec, bitrate))
    }

    pub fn with_factory<F>(factory: F) -> Self
    where
        F: Fn() -> anyhow::Result<Box<dyn FrameEncoder>> + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
            idle: Mutex::new(Vec::new()),
            outstanding: AtomicUsize::new(0),
            created: AtomicUsize::new(0),
        }
    }

    pub fn acquire(&self) -> anyhow::Result<Box<dyn FrameEncoder>> {
        let reused = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        let encoder = match reused {
            Some(encoder) => encoder,
            None => {
                let encoder = (self.factory)()?;
                let created = self.created.fetch_add(1, Ordering::Relaxed) + 1;
                log::debug!("encoder pool allocated {} encoder #{}", encoder.codec(), created);
                encoder
            }
        };
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        Ok(encoder)
    }

    pub fn release(&self, mut encoder: Box<dyn FrameEncoder>) {
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
        if let Err(e) = encoder.reset() {
            // a broken encoder is not worth keeping
            log::warn!("encoder reset failed, discarding: {:#}", e);
            return;
        }
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(encoder);
    }

    /// Encoders handed out and not yet released.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    pub fn idle(&self) -> usize {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_reuses_released_encoders() -> anyhow::Result<()> {
        let pool = EncoderPool::new(Codec::Raw, None);
        let first = pool.acquire()?;
        assert_eq!(pool.outstanding(), 1);
        pool.release(first);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.idle(), 1);

        let again = pool.acquire()?;
        assert_eq!(pool.created(), 1);
        pool.release(again);
        Ok(())
    }

    #[test]
    fn test_pool_grows_instead_of_blocking() -> anyhow::Result<()> {
        let pool = EncoderPool::new(Codec::Raw, None);
        let a = pool.acquire()?;
        let b = pool.acquire()?;
        assert_eq!(pool.created(), 2);
        assert_eq!(pool.outstanding(), 2);
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.idle(), 2);
        assert_eq!(pool.outstanding(), 0);
        Ok(())
    }

    #[test]
    fn test_pool_factory_error() {
        let pool = EncoderPool::with_factory(|| Err(anyhow::anyhow!("no codec")));
        assert!(pool.acquire().is_err());
        assert_eq!(pool.outstanding(), 0);
    }
}
