use std::sync::Arc;
use std::sync::Mutex;

/// Fixed-size byte buffers recycled across splice loops.
///
/// Shared by the tunnel and websocket handlers; injectable so embedders can
/// substitute their own allocator-aware pool.
pub trait BufferPool: Send + Sync {
    fn get(&self) -> Vec<u8>;
    fn put(&self, buf: Vec<u8>);
}

/// Free-list pool of `size`-byte buffers, bounded so a burst of tunnels does
/// not pin memory forever.
pub struct FixedBufferPool {
    size: usize,
    max_idle: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl FixedBufferPool {
    pub fn new(size: usize) -> Self {
        FixedBufferPool {
            size,
            max_idle: 64,
            free: Mutex::new(Vec::new()),
        }
    }
}

impl BufferPool for FixedBufferPool {
    fn get(&self) -> Vec<u8> {
        if let Ok(mut free) = self.free.lock()
            && let Some(buf) = free.pop()
        {
            return buf;
        }
        vec![0u8; self.size]
    }

    fn put(&self, buf: Vec<u8>) {
        if buf.len() != self.size {
            return;
        }
        if let Ok(mut free) = self.free.lock()
            && free.len() < self.max_idle
        {
            free.push(buf);
        }
    }
}

/// Pool used when a handler is constructed without an explicit one: 2 KiB
/// buffers, matching the splice granularity of the tunnel loops.
pub fn default_buffer_pool() -> Arc<dyn BufferPool> {
    Arc::new(FixedBufferPool::new(2048))
}
