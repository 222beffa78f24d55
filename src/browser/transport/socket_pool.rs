//! Socket-pool transport — once the child advertises a multi-IPC socket
//! path, commands are serviced over a fixed pool of duplex Unix-domain
//! socket sessions instead of the single shared pipe.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::warn;

use crate::retry::{retry_with_backoff, RetryConfig};

/// The child prints its socket-pool advertisement before its listener backlog
/// is guaranteed to accept connections, so the first dial or two can race a
/// `ECONNREFUSED`/`ENOENT`. A handful of short backoff attempts absorbs that
/// without pushing the race up into the supervisor.
fn socket_connect_retry_config() -> RetryConfig {
    RetryConfig {
        max_attempts: 5,
        initial_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(200),
        multiplier: 2.0,
    }
}

#[derive(thiserror::Error, Debug)]
pub enum PoolError {
    #[error("timed out waiting for a free session")]
    AcquireTimeout,
    #[error("command timed out waiting for a response")]
    CommandTimeout,
    #[error("session disconnected")]
    SessionClosed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// One duplex connection to the child's socket-pool listener.
struct Session {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Session {
    async fn connect(socket_path: &Path) -> Result<Self, PoolError> {
        let cfg = socket_connect_retry_config();
        let stream =
            retry_with_backoff(&cfg, || UnixStream::connect(socket_path)).await?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        })
    }

    /// Send one envelope line and read exactly one response line, bounded by
    /// `deadline` — the per-command read deadline equals the dispatcher
    /// timeout for that command. Any I/O error or EOF is fatal to
    /// this session only; the pool itself remains usable via its others.
    async fn call(&mut self, line: &str, deadline: Duration) -> Result<String, PoolError> {
        tokio::time::timeout(deadline, async {
            self.writer.write_all(line.as_bytes()).await?;
            self.writer.write_all(b"\n").await?;
            self.writer.flush().await?;
            let mut resp = String::new();
            let n = self.reader.read_line(&mut resp).await?;
            if n == 0 {
                return Err(PoolError::SessionClosed);
            }
            Ok(resp)
        })
        .await
        .map_err(|_| PoolError::CommandTimeout)?
    }
}

/// Fixed-size pool of duplex sessions (default capacity 64).
/// Acquisition blocks, bounded by a timeout, until a session is free. A
/// session that errors during use is not returned to the pool; a
/// replacement connection is attempted in its place so pool capacity
/// doesn't silently shrink over the life of a spawn.
pub struct SocketPoolTransport {
    socket_path: PathBuf,
    semaphore: Arc<Semaphore>,
    sessions: Mutex<Vec<Session>>,
}

impl SocketPoolTransport {
    pub async fn connect(socket_path: PathBuf, capacity: usize) -> Result<Arc<Self>, PoolError> {
        let mut sessions = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            sessions.push(Session::connect(&socket_path).await?);
        }
        Ok(Arc::new(Self {
            socket_path,
            semaphore: Arc::new(Semaphore::new(capacity)),
            sessions: Mutex::new(sessions),
        }))
    }

    /// Acquire a free session, waiting up to `timeout` for one to become
    /// available. If the free-list is momentarily empty (a prior session was
    /// poisoned and its replacement hasn't landed yet) a fresh connection is
    /// opened inline rather than blocking the caller further.
    pub async fn acquire(
        self: &Arc<Self>,
        timeout: Duration,
    ) -> Result<PooledSession, PoolError> {
        let permit = tokio::time::timeout(timeout, self.semaphore.clone().acquire_owned())
            .await
            .map_err(|_| PoolError::AcquireTimeout)?
            .expect("pool semaphore is never closed while the pool is alive");

        let session = self.sessions.lock().await.pop();
        let session = match session {
            Some(s) => s,
            None => Session::connect(&self.socket_path).await?,
        };

        Ok(PooledSession {
            pool: self.clone(),
            session: Some(session),
            poisoned: false,
            _permit: permit,
        })
    }

    async fn release(&self, session: Session) {
        self.sessions.lock().await.push(session);
    }

    async fn replace_with_reconnect(&self) {
        match Session::connect(&self.socket_path).await {
            Ok(s) => self.sessions.lock().await.push(s),
            Err(e) => warn!(err = %e, "failed to replenish socket-pool session"),
        }
    }
}

/// RAII guard around one leased session. On drop, a healthy session is
/// returned to the pool's free list; a poisoned one (its last `call` failed)
/// is discarded and a replacement connection is spawned in its place.
pub struct PooledSession {
    pool: Arc<SocketPoolTransport>,
    session: Option<Session>,
    poisoned: bool,
    _permit: OwnedSemaphorePermit,
}

impl PooledSession {
    pub async fn call(&mut self, line: &str, deadline: Duration) -> Result<String, PoolError> {
        let session = self
            .session
            .as_mut()
            .expect("session present for the lifetime of the guard");
        match session.call(line, deadline).await {
            Ok(resp) => Ok(resp),
            Err(e) => {
                self.poisoned = true;
                Err(e)
            }
        }
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let pool = self.pool.clone();
        if self.poisoned {
            tokio::spawn(async move {
                pool.replace_with_reconnect().await;
            });
        } else {
            tokio::spawn(async move {
                pool.release(session).await;
            });
        }
    }
}
