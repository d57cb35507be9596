//! Linked bidirectional byte relay.
//!
//! [`link`] copies bytes between two streams in two tasks, one per
//! direction, sharing a [`CancellationToken`]. Whichever direction finishes
//! first (EOF, I/O error or idle timeout) shuts down its writer and cancels
//! the token; the other direction stops at its next suspension point and
//! both streams are dropped. Neither side is left half-open.
//!
//! # Example
//!
//! ```ignore
//! let handle = relay::link(client_tls, loopback, Some(Duration::from_secs(300)));
//! let stats = handle.join().await;
//! debug!("relayed {} / {} bytes", stats.forward, stats.backward);
//! ```

use super::error::is_disconnect;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Copy buffer size per direction.
const RELAY_BUF_SIZE: usize = 16 * 1024;

/// Upper bound on a graceful writer shutdown during teardown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Bytes moved by a finished relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Bytes copied from the first stream to the second.
    pub forward: u64,
    /// Bytes copied from the second stream to the first.
    pub backward: u64,
}

/// A running relay.
pub struct RelayHandle {
    token: CancellationToken,
    join: JoinHandle<RelayStats>,
}

impl RelayHandle {
    /// Tear the relay down now.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether teardown has started.
    pub fn is_finished(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Token that fires when the relay starts tearing down.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Wait for both directions to finish.
    pub async fn join(self) -> RelayStats {
        match self.join.await {
            Ok(stats) => stats,
            Err(e) => {
                debug!("Relay task ended abnormally: {}", e);
                RelayStats::default()
            }
        }
    }
}

/// Last-activity clock shared by both directions and the idle watchdog.
struct Activity {
    origin: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let ms = self.origin.elapsed().as_millis() as u64;
        self.last_ms.store(ms, Ordering::Relaxed);
    }

    fn last(&self) -> Instant {
        self.origin + Duration::from_millis(self.last_ms.load(Ordering::Relaxed))
    }
}

/// Start relaying between `a` and `b`.
///
/// With `idle_timeout`, the relay is torn down once neither direction has
/// moved a byte for that long.
pub fn link<A, B>(a: A, b: B, idle_timeout: Option<Duration>) -> RelayHandle
where
    A: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    B: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let token = CancellationToken::new();
    let activity = Arc::new(Activity::new());

    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);

    let forward = tokio::spawn(pump(
        a_read,
        b_write,
        token.clone(),
        activity.clone(),
        "forward",
    ));
    let backward = tokio::spawn(pump(
        b_read,
        a_write,
        token.clone(),
        activity.clone(),
        "backward",
    ));

    if let Some(idle) = idle_timeout {
        tokio::spawn(watchdog(token.clone(), activity, idle));
    }

    let done = token.clone();
    let join = tokio::spawn(async move {
        let (forward, backward) = tokio::join!(forward, backward);
        done.cancel();
        RelayStats {
            forward: forward.unwrap_or_default(),
            backward: backward.unwrap_or_default(),
        }
    });

    RelayHandle { token, join }
}

async fn pump<R, W>(
    mut reader: R,
    mut writer: W,
    token: CancellationToken,
    activity: Arc<Activity>,
    direction: &'static str,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUF_SIZE];
    let mut total = 0u64;

    loop {
        let n = tokio::select! {
            biased;
            () = token.cancelled() => break,
            res = reader.read(&mut buf) => match res {
                Ok(0) => {
                    trace!("Relay {} reached EOF", direction);
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    log_io_end(direction, "read", &e);
                    break;
                }
            },
        };

        let written = tokio::select! {
            biased;
            () = token.cancelled() => break,
            res = async {
                writer.write_all(&buf[..n]).await?;
                writer.flush().await
            } => res,
        };
        if let Err(e) = written {
            log_io_end(direction, "write", &e);
            break;
        }

        total += n as u64;
        activity.touch();
    }

    token.cancel();
    if tokio::time::timeout(SHUTDOWN_GRACE, writer.shutdown())
        .await
        .is_err()
    {
        trace!("Relay {} writer shutdown timed out", direction);
    }
    total
}

async fn watchdog(token: CancellationToken, activity: Arc<Activity>, idle: Duration) {
    loop {
        // An idle timeout past the end of the clock never fires.
        let Some(deadline) = activity.last().checked_add(idle) else {
            token.cancelled().await;
            return;
        };
        tokio::select! {
            () = token.cancelled() => return,
            () = tokio::time::sleep_until(deadline) => {
                if activity.last().elapsed() >= idle {
                    debug!("Relay idle for {:?}, tearing down", idle);
                    token.cancel();
                    return;
                }
            }
        }
    }
}

fn log_io_end(direction: &str, op: &str, err: &std::io::Error) {
    if is_disconnect(err) {
        trace!("Relay {} {} ended: {}", direction, op, err);
    } else {
        debug!("Relay {} {} error: {}", direction, op, err);
    }
}
