//! Outbound replica connection pool
//!
//! Bounds concurrent pushes with semaphore permits and recycles frame
//! buffers. Frames are `u32 BE length ++ payload`.

use bytes::{BufMut, BytesMut};
use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;
use std::io::Write;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Largest payload accepted for one push
pub const FRAME_PAYLOAD_MAX: usize = 1024 * 1024;

/// Error type for replica pushes
#[derive(Debug)]
pub enum ReplicationError {
    /// Every connection permit is in use
    Saturated,
    /// Payload exceeds FRAME_PAYLOAD_MAX
    PayloadTooLarge(usize),
    /// Replica address could not be resolved
    BadAddress(String),
    /// Connect or write failed
    Io { replica: String, source: std::io::Error },
}

impl std::fmt::Display for ReplicationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicationError::Saturated => write!(f, "replica connection pool saturated"),
            ReplicationError::PayloadTooLarge(n) => {
                write!(f, "replication payload too large: {} bytes", n)
            }
            ReplicationError::BadAddress(addr) => write!(f, "bad replica address: {}", addr),
            ReplicationError::Io { replica, source } => {
                write!(f, "push to {} failed: {}", replica, source)
            }
        }
    }
}

impl std::error::Error for ReplicationError {}

/// Delivers one frame to one replica
pub trait ReplicaTransport: Send + Sync {
    fn send(&self, replica: &str, frame: &[u8], timeout: Duration) -> Result<(), ReplicationError>;
}

/// Plain TCP: connect, write the frame, close
#[derive(Debug, Clone, Default)]
pub struct TcpTransport;

impl ReplicaTransport for TcpTransport {
    fn send(&self, replica: &str, frame: &[u8], timeout: Duration) -> Result<(), ReplicationError> {
        let addr = replica
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| ReplicationError::BadAddress(replica.to_string()))?;

        let io_err = |source| ReplicationError::Io {
            replica: replica.to_string(),
            source,
        };
        let mut stream = TcpStream::connect_timeout(&addr, timeout).map_err(io_err)?;
        stream.set_write_timeout(Some(timeout)).map_err(io_err)?;
        stream.write_all(frame).map_err(io_err)?;
        stream.flush().map_err(io_err)
    }
}

/// Records frames in memory; replicas listed in `fail` reject every push
#[derive(Debug, Default)]
pub struct InMemoryTransport {
    frames: Mutex<Vec<(String, Vec<u8>)>>,
    fail: Mutex<Vec<String>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every push to `replica` fail
    pub fn fail_replica(&self, replica: &str) {
        self.fail.lock().push(replica.to_string());
    }

    /// Let pushes to `replica` succeed again
    pub fn heal_replica(&self, replica: &str) {
        self.fail.lock().retain(|r| r != replica);
    }

    /// Frames delivered so far, in order
    pub fn frames(&self) -> Vec<(String, Vec<u8>)> {
        self.frames.lock().clone()
    }

    pub fn frames_to(&self, replica: &str) -> usize {
        self.frames.lock().iter().filter(|(r, _)| r == replica).count()
    }
}

impl ReplicaTransport for InMemoryTransport {
    fn send(&self, replica: &str, frame: &[u8], _timeout: Duration) -> Result<(), ReplicationError> {
        if self.fail.lock().iter().any(|r| r == replica) {
            return Err(ReplicationError::Io {
                replica: replica.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "injected"),
            });
        }
        self.frames.lock().push((replica.to_string(), frame.to_vec()));
        Ok(())
    }
}

pub struct ReplicaConnectionPool {
    buffers: ArrayQueue<BytesMut>,
    buffer_capacity: usize,
    permits: Arc<Semaphore>,
    transport: Arc<dyn ReplicaTransport>,
    timeout: Duration,
    pushes: AtomicU64,
    failures: AtomicU64,
}

impl ReplicaConnectionPool {
    pub fn new(
        max_connections: usize,
        buffer_pool_size: usize,
        timeout: Duration,
        transport: Arc<dyn ReplicaTransport>,
    ) -> Self {
        debug_assert!(max_connections > 0, "Precondition: at least one connection");

        let buffer_capacity = 8192;
        let buffers = ArrayQueue::new(buffer_pool_size.max(1));
        for _ in 0..buffer_pool_size.max(1) {
            let _ = buffers.push(BytesMut::with_capacity(buffer_capacity));
        }

        ReplicaConnectionPool {
            buffers,
            buffer_capacity,
            permits: Arc::new(Semaphore::new(max_connections)),
            transport,
            timeout,
            pushes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Pool over TCP with the given limits
    pub fn tcp(max_connections: usize, buffer_pool_size: usize, timeout: Duration) -> Self {
        Self::new(
            max_connections,
            buffer_pool_size,
            timeout,
            Arc::new(TcpTransport),
        )
    }

    /// Frame `payload` and push it to `replica`.
    ///
    /// Never waits for a permit: a saturated pool fails the push so the
    /// caller can retry on its next pass.
    pub fn push(&self, replica: &str, payload: &[u8]) -> Result<(), ReplicationError> {
        if payload.len() > FRAME_PAYLOAD_MAX {
            return Err(ReplicationError::PayloadTooLarge(payload.len()));
        }

        let _permit = self
            .permits
            .clone()
            .try_acquire_owned()
            .map_err(|_| ReplicationError::Saturated)?;

        let mut buf = self.acquire_buffer();
        buf.put_u32(payload.len() as u32);
        buf.put_slice(payload);

        let result = self.transport.send(replica, &buf, self.timeout);
        self.release_buffer(buf);

        match &result {
            Ok(()) => self.pushes.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.failures.fetch_add(1, Ordering::Relaxed),
        };
        result
    }

    fn acquire_buffer(&self) -> BytesMut {
        self.buffers
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.buffer_capacity))
    }

    fn release_buffer(&self, mut buf: BytesMut) {
        buf.clear();
        if buf.capacity() <= self.buffer_capacity * 2 {
            let _ = self.buffers.push(buf);
        }
    }

    /// Permits currently free
    pub fn available_connections(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn pushes(&self) -> u64 {
        self.pushes.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for ReplicaConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaConnectionPool")
            .field("available_connections", &self.available_connections())
            .field("pushes", &self.pushes())
            .field("failures", &self.failures())
            .finish()
    }
}
