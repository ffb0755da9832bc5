//! Automatic reconnection with exponential backoff.
//!
//! Only connection establishment is retried. A request that fails because the
//! connection dropped reports the failure to its caller; the next request (or
//! [`ReconnectController::supervise`]) brings up a fresh session.

use rand::Rng;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{BackoffPolicy, ClientConfig};
use crate::error::{Error, Result};
use crate::protocol::FileDescriptor;
use crate::session::{FileOutcome, Session};
use crate::transfer::{event_channel, EventStream, ProgressObserver};

/// Delay generator: grows by the policy's multiplier up to its cap, with jitter
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    current: Duration,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            current: policy.initial,
            policy,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = scale(base, self.policy.multiplier).min(self.policy.max);

        let spread = if self.policy.jitter > 0.0 {
            rand::thread_rng().gen_range(-self.policy.jitter..=self.policy.jitter)
        } else {
            0.0
        };
        scale(base, 1.0 + spread).min(self.policy.max)
    }

    pub fn reset(&mut self) {
        self.current = self.policy.initial;
    }
}

// Whole nanoseconds, rounded
fn scale(d: Duration, factor: f64) -> Duration {
    Duration::from_nanos((d.as_nanos() as f64 * factor).round() as u64)
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        Some(self.next_delay())
    }
}

/// What the controller is doing about the link, for display
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LinkStatus {
    Disconnected,
    Connecting { attempt: u32 },
    /// Last attempt failed; the next one starts after `retry_in`
    Waiting { attempt: u32, retry_in: Duration },
    Connected,
    Stopped,
}

/// Hands out a live [`Session`], reconnecting as needed
pub struct ReconnectController {
    addr: String,
    chunk_size: usize,
    policy: BackoffPolicy,
    // Locked for the whole reconnect loop so concurrent callers share one attempt
    session: Mutex<Option<Arc<Session>>>,
    status: watch::Sender<LinkStatus>,
    cancel: CancellationToken,
}

impl ReconnectController {
    pub fn new(config: &ClientConfig) -> Self {
        let (status, _) = watch::channel(LinkStatus::Disconnected);
        Self {
            addr: config.server.clone(),
            chunk_size: config.chunk_size,
            policy: config.backoff,
            session: Mutex::new(None),
            status,
            cancel: CancellationToken::new(),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn status(&self) -> LinkStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LinkStatus> {
        self.status.subscribe()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop retrying. A pending backoff sleep ends at once with [`Error::Cancelled`].
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// The current session, or a new one once the server accepts a connection
    pub async fn session(&self) -> Result<Arc<Session>> {
        let mut slot = self.session.lock().await;
        if let Some(session) = slot.as_ref() {
            if session.is_open() {
                return Ok(session.clone());
            }
            debug!("Discarding closed session with {}", self.addr);
            *slot = None;
        }

        let session = Arc::new(self.connect_with_retry().await?);
        *slot = Some(session.clone());
        Ok(session)
    }

    async fn connect_with_retry(&self) -> Result<Session> {
        let mut backoff = Backoff::new(self.policy);
        let mut attempt = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                self.status.send_replace(LinkStatus::Stopped);
                return Err(Error::Cancelled);
            }

            attempt += 1;
            self.status.send_replace(LinkStatus::Connecting { attempt });
            let connected = tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.status.send_replace(LinkStatus::Stopped);
                    return Err(Error::Cancelled);
                }
                result = Session::connect(&self.addr, self.chunk_size) => result,
            };

            match connected {
                Ok(session) => {
                    if attempt > 1 {
                        info!("Connected to {} after {} attempts", self.addr, attempt);
                    } else {
                        info!("Connected to {}", self.addr);
                    }
                    self.status.send_replace(LinkStatus::Connected);
                    return Ok(session);
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    debug!(
                        "Attempt {} failed: {}; retrying in {}",
                        attempt,
                        e,
                        humantime::format_duration(delay)
                    );
                    self.status.send_replace(LinkStatus::Waiting {
                        attempt,
                        retry_in: delay,
                    });
                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            self.status.send_replace(LinkStatus::Stopped);
                            return Err(Error::Cancelled);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Run `op` on a live session, forgetting the session if the link dropped
    async fn run<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce(Arc<Session>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let session = self.session().await?;
        let result = op(session.clone()).await;
        if !session.is_open() {
            self.forget(&session).await;
        }
        result
    }

    async fn forget(&self, stale: &Arc<Session>) {
        let mut slot = self.session.lock().await;
        if slot.as_ref().is_some_and(|s| Arc::ptr_eq(s, stale)) {
            *slot = None;
            warn!("Lost connection to {}", self.addr);
            self.status.send_replace(LinkStatus::Disconnected);
        }
    }

    pub async fn list_files(&self) -> Result<Vec<FileDescriptor>> {
        self.run(|s| async move { s.list_files().await }).await
    }

    pub async fn upload(&self, path: &Path, observer: &dyn ProgressObserver) -> Result<u64> {
        self.run(|s| async move { s.upload(path, observer).await })
            .await
    }

    pub async fn upload_batch(
        &self,
        paths: &[PathBuf],
        observer: &dyn ProgressObserver,
    ) -> Result<Vec<FileOutcome>> {
        self.run(|s| async move { Ok(s.upload_batch(paths, observer).await) })
            .await
    }

    pub async fn download(
        &self,
        name: &str,
        dest: &Path,
        observer: &dyn ProgressObserver,
    ) -> Result<u64> {
        self.run(|s| async move { s.download(name, dest, observer).await })
            .await
    }

    /// Run a batch upload on its own task; progress arrives on the returned stream
    pub fn spawn_upload_batch(
        self: &Arc<Self>,
        paths: Vec<PathBuf>,
    ) -> (JoinHandle<Result<Vec<FileOutcome>>>, EventStream) {
        let (events, stream) = event_channel();
        let controller = self.clone();
        let handle = tokio::spawn(async move { controller.upload_batch(&paths, &events).await });
        (handle, stream)
    }

    /// Keep a session up until cancelled, reconnecting whenever it closes
    pub async fn supervise(&self) {
        loop {
            let session = match self.session().await {
                Ok(session) => session,
                Err(_) => return,
            };
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = session.closed() => self.forget(&session).await,
            }
        }
    }

    /// Close the current session, if any, and stop retrying
    pub async fn close(&self) {
        self.cancel.cancel();
        let session = self.session.lock().await.take();
        if let Some(session) = session {
            session.close().await;
        }
        self.status.send_replace(LinkStatus::Stopped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::server::Server;
    use tempfile::TempDir;

    fn policy(initial_ms: u64, max_ms: u64) -> BackoffPolicy {
        BackoffPolicy {
            initial: Duration::from_millis(initial_ms),
            max: Duration::from_millis(max_ms),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }

    fn unused_addr() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().to_string()
    }

    fn client_config(addr: &str, backoff: BackoffPolicy) -> ClientConfig {
        ClientConfig {
            server: addr.to_string(),
            backoff,
            ..ClientConfig::default()
        }
    }

    #[test]
    fn test_backoff_grows_and_never_exceeds_cap() {
        let mut backoff = Backoff::new(policy(100, 1000));
        let delays: Vec<Duration> = backoff.by_ref().take(50).collect();

        assert!(delays.iter().all(|d| *d <= Duration::from_millis(1000)));
        assert!(delays[0] >= Duration::from_millis(80) && delays[0] <= Duration::from_millis(120));
        assert!(delays[3] >= Duration::from_millis(640));
        assert!(delays[10..].iter().all(|d| *d >= Duration::from_millis(800)));

        backoff.reset();
        assert!(backoff.next_delay() <= Duration::from_millis(120));
    }

    #[test]
    fn test_backoff_without_jitter_is_exact() {
        let mut p = policy(10, 50);
        p.jitter = 0.0;
        let delays: Vec<u128> = Backoff::new(p).take(5).map(|d| d.as_millis()).collect();
        assert_eq!(delays, vec![10, 20, 40, 50, 50]);
    }

    #[tokio::test]
    async fn test_connects_once_server_comes_up() {
        let addr = unused_addr();
        let controller = Arc::new(ReconnectController::new(&client_config(
            &addr,
            policy(20, 100),
        )));

        let waiting = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.session().await.map(|s| s.addr().to_string()) })
        };

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!waiting.is_finished());
        assert!(matches!(
            controller.status(),
            LinkStatus::Waiting { .. } | LinkStatus::Connecting { .. }
        ));

        let dir = TempDir::new().unwrap();
        let config = ServerConfig {
            listen: addr.parse().unwrap(),
            root: dir.path().to_path_buf(),
            ..ServerConfig::default()
        };
        let server = Server::bind(&config).await.unwrap();
        let token = CancellationToken::new();
        tokio::spawn(server.run(token.clone()));

        let connected = tokio::time::timeout(Duration::from_secs(5), waiting)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(connected, addr);
        assert_eq!(controller.status(), LinkStatus::Connected);
        assert!(controller.list_files().await.unwrap().is_empty());
        token.cancel();
    }

    async fn serve_at(addr: &str, root: &Path) -> CancellationToken {
        let config = ServerConfig {
            listen: addr.parse().unwrap(),
            root: root.to_path_buf(),
            ..ServerConfig::default()
        };
        let server = Server::bind(&config).await.unwrap();
        let token = CancellationToken::new();
        tokio::spawn(server.run(token.clone()));
        token
    }

    #[tokio::test]
    async fn test_lost_session_is_replaced_on_next_request() {
        let addr = unused_addr();
        let dir = TempDir::new().unwrap();
        let first = serve_at(&addr, dir.path()).await;

        let controller = ReconnectController::new(&client_config(&addr, policy(20, 100)));
        controller.list_files().await.unwrap();
        assert_eq!(controller.status(), LinkStatus::Connected);

        first.cancel();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let err = controller.list_files().await.unwrap_err();
        assert!(err.is_connection_lost(), "{err}");
        assert_eq!(controller.status(), LinkStatus::Disconnected);

        std::fs::write(dir.path().join("after.txt"), b"back").unwrap();
        let _second = serve_at(&addr, dir.path()).await;
        let files = controller.list_files().await.unwrap();
        assert_eq!(files, vec![FileDescriptor::new("after.txt", 4)]);
        assert_eq!(controller.status(), LinkStatus::Connected);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff_sleep() {
        let controller = Arc::new(ReconnectController::new(&client_config(
            &unused_addr(),
            policy(5_000, 10_000),
        )));
        let waiting = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.session().await.map(|_| ()) })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        controller.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(controller.status(), LinkStatus::Stopped);
    }
}
