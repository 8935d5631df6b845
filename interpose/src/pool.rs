use std::collections::HashMap;
use std::collections::VecDeque;
use std::io::ErrorKind;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;
use tokio::net::TcpStream;
use tracing::debug;

/// Pool-internal errors. Callers convert them into dial-or-close decisions;
/// they are never surfaced to the downstream client.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("pool is closed")]
    Closed,
    #[error("no idle connection")]
    NoIdleConn,
    #[error("beyond max capacity, connection closed")]
    BeyondCapacity,
    #[error("cannot identify connection peer: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Copy, Debug)]
pub struct PoolOptions {
    /// Idle-connection capacity per destination address.
    pub idle_max_cap: usize,
    /// How long an idle connection stays eligible for reuse.
    pub idle_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        PoolOptions {
            idle_max_cap: 30,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

struct IdleConn {
    stream: TcpStream,
    expires_at: Instant,
}

/// Idle TCP connections keyed by destination `host:port`.
///
/// The pool never dials: a miss is the caller's cue to dial. Connections are
/// probed on the way out, so anything handed back by [`ConnectionPool::get`]
/// was alive a moment ago.
pub struct ConnectionPool {
    idle: Mutex<HashMap<String, VecDeque<IdleConn>>>,
    options: PoolOptions,
    closed: AtomicBool,
}

impl Default for ConnectionPool {
    fn default() -> Self {
        ConnectionPool::new(PoolOptions::default())
    }
}

impl ConnectionPool {
    pub fn new(options: PoolOptions) -> Self {
        ConnectionPool {
            idle: Mutex::new(HashMap::new()),
            options,
            closed: AtomicBool::new(false),
        }
    }

    /// Pops an idle connection for `addr`, skipping (and closing) any entry
    /// that has expired or fails the liveness probe.
    pub fn get(&self, addr: &str) -> Result<TcpStream, PoolError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }

        let mut idle = self.idle.lock().map_err(|_| PoolError::NoIdleConn)?;
        let queue = idle.get_mut(addr).ok_or(PoolError::NoIdleConn)?;
        let now = Instant::now();
        while let Some(entry) = queue.pop_front() {
            if entry.expires_at <= now {
                continue;
            }
            if probe(&entry.stream) {
                return Ok(entry.stream);
            }
            // Dropped on the floor: the peer closed it, timed it out, or left
            // stray bytes in the buffer.
        }
        Err(PoolError::NoIdleConn)
    }

    /// Parks a connection for reuse, keyed by its peer address. On a full
    /// queue (or a closed pool) the connection is closed instead.
    pub fn put(&self, stream: TcpStream) -> Result<(), PoolError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }

        let addr = stream.peer_addr()?.to_string();
        let mut idle = self.idle.lock().map_err(|_| PoolError::BeyondCapacity)?;
        let queue = idle.entry(addr).or_default();
        if queue.len() >= self.options.idle_max_cap {
            return Err(PoolError::BeyondCapacity);
        }
        queue.push_back(IdleConn {
            stream,
            expires_at: Instant::now() + self.options.idle_timeout,
        });
        Ok(())
    }

    /// Marks the pool closed and closes every idle connection. Subsequent
    /// `get`/`put`/`release` calls fail with [`PoolError::Closed`].
    pub fn release(&self) -> Result<(), PoolError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(PoolError::Closed);
        }
        if let Ok(mut idle) = self.idle.lock() {
            let drained: usize = idle.values().map(VecDeque::len).sum();
            idle.clear();
            debug!(drained, "connection pool released");
        }
        Ok(())
    }
}

/// Liveness probe: an idle connection should have nothing to read. Data,
/// EOF, or a socket error all disqualify it.
fn probe(stream: &TcpStream) -> bool {
    let mut scratch = [0u8; 1];
    match stream.try_read(&mut scratch) {
        Err(err) if err.kind() == ErrorKind::WouldBlock => true,
        _ => false,
    }
}
