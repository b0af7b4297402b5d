use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Send buffers sized to the negotiated MTU.
///
/// Every resize starts a new generation. Buffers rented under an older generation
/// are dropped instead of being returned, so a reconnect with a different MTU never
/// hands out a buffer of the wrong size.
#[derive(Debug)]
pub struct BufferPool {
    inner: Mutex<PoolInner>,
    max_pooled: usize,
}

#[derive(Debug)]
struct PoolInner {
    mtu: usize,
    generation: u32,
    free: Vec<Vec<u8>>,
}

impl BufferPool {
    pub fn new(mtu: usize, max_pooled: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(PoolInner {
                mtu,
                generation: 0,
                free: Vec::with_capacity(max_pooled),
            }),
            max_pooled,
        })
    }
    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
    pub fn mtu(&self) -> usize {
        self.lock().mtu
    }
    pub fn generation(&self) -> u32 {
        self.lock().generation
    }
    pub fn pooled(&self) -> usize {
        self.lock().free.len()
    }
    /// Drops all pooled buffers and starts a new generation sized to `mtu`.
    pub fn resize(&self, mtu: usize) {
        let mut inner = self.lock();
        inner.mtu = mtu;
        inner.generation = inner.generation.wrapping_add(1);
        inner.free.clear();
        log::debug!(
            "buffer pool resized to {mtu} bytes (generation {})",
            inner.generation
        );
    }
    pub fn rent(self: &Arc<Self>) -> PooledBuffer {
        let mut inner = self.lock();
        let buf = match inner.free.pop() {
            Some(buf) => buf,
            None => {
                log::trace!("no buffer in pool: creating new buffer");
                Vec::with_capacity(inner.mtu)
            }
        };
        PooledBuffer {
            buf,
            mtu: inner.mtu,
            generation: inner.generation,
            pool: Arc::clone(self),
        }
    }
    fn give_back(&self, mut buf: Vec<u8>, generation: u32) {
        let mut inner = self.lock();
        if generation != inner.generation {
            log::trace!("discarding buffer from generation {generation}");
            return;
        }
        if inner.free.len() < self.max_pooled {
            buf.clear();
            inner.free.push(buf);
        }
    }
}

/// A buffer rented from a [`BufferPool`], returned to it on drop.
#[derive(Debug)]
pub struct PooledBuffer {
    buf: Vec<u8>,
    mtu: usize,
    generation: u32,
    pool: Arc<BufferPool>,
}

impl PooledBuffer {
    pub fn mtu(&self) -> usize {
        self.mtu
    }
    pub fn generation(&self) -> u32 {
        self.generation
    }
    /// False once the pool has been resized since this buffer was rented.
    pub fn is_current(&self) -> bool {
        self.generation == self.pool.generation()
    }
    pub fn remaining(&self) -> usize {
        self.mtu.saturating_sub(self.buf.len())
    }
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }
    pub fn len(&self) -> usize {
        self.buf.len()
    }
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
    pub(crate) fn as_vec_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.pool
            .give_back(std::mem::take(&mut self.buf), self.generation);
    }
}
