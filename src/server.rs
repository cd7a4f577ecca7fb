//! TCP server for the line echo protocol.
//!
//! Binds the listening endpoint and runs the accept loop. Every accepted
//! connection gets its own task; the loop never waits on handler progress.

use crate::config::Config;
use crate::connection::{handle_connection, HandlerSettings};
use std::future::Future;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

/// Pause after the process runs out of descriptors or memory, so the
/// accept loop does not spin on the same error.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Counters shared between the accept loop and its handlers.
#[derive(Debug, Default)]
pub struct ServerStats {
    active: AtomicUsize,
    accepted: AtomicU64,
}

impl ServerStats {
    /// Connections currently being served.
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Connections accepted since the server started.
    pub fn total_accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }
}

/// Held by a handler task for as long as its connection is open.
struct ConnectionGuard {
    stats: Arc<ServerStats>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl ConnectionGuard {
    fn new(stats: Arc<ServerStats>, permit: Option<OwnedSemaphorePermit>) -> Self {
        stats.accepted.fetch_add(1, Ordering::Relaxed);
        stats.active.fetch_add(1, Ordering::AcqRel);
        Self {
            stats,
            _permit: permit,
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.stats.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// How the accept loop reacts to a failed `accept`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AcceptFailure {
    /// Only that one pending connection was lost.
    Transient,
    /// Out of descriptors or memory; back off, then retry.
    Exhausted,
    /// The listening endpoint itself is broken.
    Fatal,
}

pub(crate) fn classify_accept_error(e: &io::Error) -> AcceptFailure {
    match e.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::TimedOut => return AcceptFailure::Transient,
        _ => {}
    }

    match e.raw_os_error() {
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM) => {
            AcceptFailure::Exhausted
        }
        // Network errors the kernel reports for the pending connection.
        Some(libc::EPROTO | libc::ENETDOWN | libc::ENETUNREACH | libc::EHOSTUNREACH) => {
            AcceptFailure::Transient
        }
        _ => AcceptFailure::Fatal,
    }
}

/// Server instance
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    settings: HandlerSettings,
    connection_limit: Option<Arc<Semaphore>>,
    shutdown_timeout: Duration,
    stats: Arc<ServerStats>,
}

impl Server {
    /// Bind the listening endpoint described by `config`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn bind(config: &Config) -> io::Result<Self> {
        let addr = config.listen.to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("no address resolved for '{}'", config.listen),
            )
        })?;

        let listener = TcpListener::from_std(create_listener(addr, config.backlog)?)?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, "Echo server listening");

        let connection_limit =
            (config.max_connections > 0).then(|| Arc::new(Semaphore::new(config.max_connections)));

        Ok(Server {
            listener,
            local_addr,
            settings: config.handler_settings(),
            connection_limit,
            shutdown_timeout: Duration::from_secs(config.shutdown_timeout),
            stats: Arc::new(ServerStats::default()),
        })
    }

    /// The address actually bound, useful when the configured port was 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> Arc<ServerStats> {
        Arc::clone(&self.stats)
    }

    /// Accept connections until `shutdown` resolves or the listener fails.
    ///
    /// On the way out every live handler is told to stop, and the call
    /// waits up to the configured shutdown timeout for them to finish.
    pub async fn run<F>(self, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        let Server {
            listener,
            settings,
            connection_limit,
            shutdown_timeout,
            stats,
            ..
        } = self;

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut handlers = JoinSet::new();
        tokio::pin!(shutdown);

        let result = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, no longer accepting connections");
                    break Ok(());
                }
                Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                    reap(joined);
                }
                (accepted, permit) = accept(&listener, connection_limit.as_ref()) => {
                    match accepted {
                        Ok((stream, peer)) => {
                            info!(peer = %peer, "Accepted connection");
                            if let Err(e) = stream.set_nodelay(true) {
                                debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                            }

                            let guard = ConnectionGuard::new(Arc::clone(&stats), permit);
                            let stop = stop_rx.clone();
                            handlers.spawn(async move {
                                let _guard = guard;
                                handle_connection(stream, peer, settings, stop).await;
                            });
                        }
                        Err(e) => match classify_accept_error(&e) {
                            AcceptFailure::Transient => {
                                warn!(error = %e, "Failed to accept connection");
                            }
                            AcceptFailure::Exhausted => {
                                warn!(error = %e, "Failed to accept connection, backing off");
                                tokio::time::sleep(ACCEPT_BACKOFF).await;
                            }
                            AcceptFailure::Fatal => {
                                error!(error = %e, "Listener failed");
                                break Err(e);
                            }
                        },
                    }
                }
            }
        };

        drop(listener);
        let _ = stop_tx.send(true);

        if !handlers.is_empty() {
            info!(connections = handlers.len(), "Waiting for connections to close");
        }
        let drain = async {
            while let Some(joined) = handlers.join_next().await {
                reap(joined);
            }
        };
        if tokio::time::timeout(shutdown_timeout, drain).await.is_err() {
            warn!(
                connections = handlers.len(),
                "Shutdown timeout elapsed, aborting connections"
            );
            handlers.shutdown().await;
        }

        info!(
            accepted = stats.total_accepted(),
            "Echo server stopped"
        );
        result
    }
}

/// Wait for a connection slot (when limited), then for a connection.
async fn accept(
    listener: &TcpListener,
    limit: Option<&Arc<Semaphore>>,
) -> (io::Result<(TcpStream, SocketAddr)>, Option<OwnedSemaphorePermit>) {
    let permit = match limit {
        Some(limit) => match Arc::clone(limit).acquire_owned().await {
            Ok(permit) => Some(permit),
            Err(e) => return (Err(io::Error::other(e)), None),
        },
        None => None,
    };

    (listener.accept().await, permit)
}

fn reap(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!(error = %e, "Connection handler panicked");
        }
    }
}

fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;

    const WAIT: Duration = Duration::from_secs(5);

    fn test_config() -> Config {
        Config {
            listen: "127.0.0.1:0".to_string(),
            ..Config::default()
        }
    }

    struct Running {
        addr: SocketAddr,
        stats: Arc<ServerStats>,
        stop: oneshot::Sender<()>,
        task: JoinHandle<io::Result<()>>,
    }

    fn start(config: Config) -> Running {
        let server = Server::bind(&config).unwrap();
        let addr = server.local_addr();
        let stats = server.stats();
        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(server.run(async {
            let _ = stopped.await;
        }));
        Running {
            addr,
            stats,
            stop,
            task,
        }
    }

    async fn connect(addr: SocketAddr) -> (BufReader<OwnedReadHalf>, OwnedWriteHalf) {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, writer) = stream.into_split();
        (BufReader::new(reader), writer)
    }

    async fn send_and_receive(
        reader: &mut BufReader<OwnedReadHalf>,
        writer: &mut OwnedWriteHalf,
        line: &str,
    ) -> String {
        writer.write_all(format!("{line}\n").as_bytes()).await.unwrap();
        let mut echoed = String::new();
        tokio::time::timeout(WAIT, reader.read_line(&mut echoed))
            .await
            .expect("no echo")
            .unwrap();
        echoed
    }

    async fn wait_for_active(stats: &ServerStats, expected: usize) {
        tokio::time::timeout(WAIT, async {
            while stats.active_connections() != expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("active connection count did not settle");
    }

    #[tokio::test]
    async fn test_echo_end_to_end() {
        let server = start(test_config());
        let (mut reader, mut writer) = connect(server.addr).await;

        assert_eq!(send_and_receive(&mut reader, &mut writer, "hello").await, "hello\n");
        assert_eq!(send_and_receive(&mut reader, &mut writer, "world").await, "world\n");
        assert_eq!(send_and_receive(&mut reader, &mut writer, "world").await, "world\n");
        assert_eq!(send_and_receive(&mut reader, &mut writer, "").await, "\n");
        assert_eq!(
            send_and_receive(&mut reader, &mut writer, "héllo wörld ✓").await,
            "héllo wörld ✓\n"
        );

        drop(writer);
        let mut rest = String::new();
        reader.read_to_string(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        wait_for_active(&server.stats, 0).await;
    }

    #[tokio::test]
    async fn test_connections_are_isolated() {
        let server = start(test_config());

        // C1 stalls mid-line; the handler is blocked waiting for the rest.
        let (mut reader1, mut writer1) = connect(server.addr).await;
        writer1.write_all(b"never finished").await.unwrap();

        let (mut reader2, mut writer2) = connect(server.addr).await;
        let echoed = tokio::time::timeout(
            Duration::from_secs(1),
            send_and_receive(&mut reader2, &mut writer2, "second"),
        )
        .await
        .expect("second connection was delayed by the first");
        assert_eq!(echoed, "second\n");

        let mut buf = [0u8; 1];
        let nothing =
            tokio::time::timeout(Duration::from_millis(200), reader1.read(&mut buf)).await;
        assert!(nothing.is_err(), "first connection received unexpected data");
        assert_eq!(server.stats.active_connections(), 2);
    }

    #[tokio::test]
    async fn test_close_releases_connection() {
        let server = start(test_config());

        for _ in 0..3 {
            let (mut reader, mut writer) = connect(server.addr).await;
            send_and_receive(&mut reader, &mut writer, "ping").await;
        }
        wait_for_active(&server.stats, 0).await;
        assert_eq!(server.stats.total_accepted(), 3);
    }

    #[tokio::test]
    async fn test_partial_line_not_echoed() {
        let server = start(test_config());
        let (mut reader, mut writer) = connect(server.addr).await;

        writer.write_all(b"fragment").await.unwrap();
        writer.shutdown().await.unwrap();

        let mut rest = Vec::new();
        tokio::time::timeout(WAIT, reader.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert!(rest.is_empty());
        wait_for_active(&server.stats, 0).await;
    }

    #[tokio::test]
    async fn test_overlong_line_closes_connection() {
        let config = Config {
            max_line_length: 16,
            ..test_config()
        };
        let server = start(config);
        let (mut reader, mut writer) = connect(server.addr).await;

        let long = "x".repeat(100);
        writer.write_all(format!("{long}\n").as_bytes()).await.unwrap();

        let mut rest = Vec::new();
        match tokio::time::timeout(WAIT, reader.read_to_end(&mut rest))
            .await
            .unwrap()
        {
            Ok(_) => assert!(rest.is_empty()),
            // Unread input at close can turn the FIN into a reset.
            Err(e) => assert_eq!(e.kind(), io::ErrorKind::ConnectionReset),
        }
        wait_for_active(&server.stats, 0).await;
    }

    #[tokio::test]
    async fn test_idle_timeout_closes_connection() {
        let config = Config {
            idle_timeout: 1,
            ..test_config()
        };
        let server = start(config);
        let (mut reader, _writer) = connect(server.addr).await;

        let mut rest = Vec::new();
        tokio::time::timeout(WAIT, reader.read_to_end(&mut rest))
            .await
            .expect("idle connection was not closed")
            .unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_closes_live_connections() {
        let server = start(test_config());
        let (mut reader, mut writer) = connect(server.addr).await;
        send_and_receive(&mut reader, &mut writer, "hello").await;

        server.stop.send(()).unwrap();
        tokio::time::timeout(WAIT, server.task)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();

        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        assert_eq!(server.stats.active_connections(), 0);

        // The listening endpoint is gone too.
        assert!(TcpStream::connect(server.addr).await.is_err());
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let config = Config {
            max_connections: 1,
            ..test_config()
        };
        let server = start(config);

        let (mut reader1, mut writer1) = connect(server.addr).await;
        send_and_receive(&mut reader1, &mut writer1, "first").await;

        // Queued in the backlog but not served while the slot is taken.
        let (mut reader2, mut writer2) = connect(server.addr).await;
        writer2.write_all(b"second\n").await.unwrap();
        let mut echoed = String::new();
        let waiting =
            tokio::time::timeout(Duration::from_millis(200), reader2.read_line(&mut echoed)).await;
        assert!(waiting.is_err());

        drop(writer1);
        drop(reader1);

        tokio::time::timeout(WAIT, reader2.read_line(&mut echoed))
            .await
            .expect("second connection never served")
            .unwrap();
        assert_eq!(echoed, "second\n");
    }

    #[tokio::test]
    async fn test_bind_address_in_use() {
        let first = Server::bind(&test_config()).unwrap();
        let config = Config {
            listen: first.local_addr().to_string(),
            ..test_config()
        };

        assert!(Server::bind(&config).is_err());
    }

    #[tokio::test]
    async fn test_bind_invalid_address() {
        let config = Config {
            listen: "not an address".to_string(),
            ..test_config()
        };

        assert!(Server::bind(&config).is_err());
    }

    /// Records the level and message of every event.
    #[derive(Clone, Default)]
    struct CapturedEvents(Arc<std::sync::Mutex<Vec<(tracing::Level, String)>>>);

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for CapturedEvents {
        fn on_event(
            &self,
            event: &tracing::Event<'_>,
            _ctx: tracing_subscriber::layer::Context<'_, S>,
        ) {
            struct Message(String);

            impl tracing::field::Visit for Message {
                fn record_debug(
                    &mut self,
                    field: &tracing::field::Field,
                    value: &dyn std::fmt::Debug,
                ) {
                    if field.name() == "message" {
                        self.0 = format!("{value:?}");
                    }
                }
            }

            let mut message = Message(String::new());
            event.record(&mut message);
            self.0
                .lock()
                .unwrap()
                .push((*event.metadata().level(), message.0));
        }
    }

    #[tokio::test]
    async fn test_accept_logged_at_info() {
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;

        let events = CapturedEvents::default();
        let _subscriber = tracing_subscriber::registry()
            .with(events.clone())
            .set_default();

        let server = start(test_config());
        let (mut reader, mut writer) = connect(server.addr).await;
        send_and_receive(&mut reader, &mut writer, "hello").await;

        let events = events.0.lock().unwrap();
        assert!(events
            .iter()
            .any(|(level, message)| *level == tracing::Level::INFO
                && message == "Accepted connection"));
    }

    #[test]
    fn test_classify_accept_error() {
        let transient = io::Error::from(io::ErrorKind::ConnectionAborted);
        assert_eq!(classify_accept_error(&transient), AcceptFailure::Transient);

        let proto = io::Error::from_raw_os_error(libc::EPROTO);
        assert_eq!(classify_accept_error(&proto), AcceptFailure::Transient);

        let exhausted = io::Error::from_raw_os_error(libc::EMFILE);
        assert_eq!(classify_accept_error(&exhausted), AcceptFailure::Exhausted);

        let broken = io::Error::from_raw_os_error(libc::EBADF);
        assert_eq!(classify_accept_error(&broken), AcceptFailure::Fatal);

        let invalid = io::Error::from_raw_os_error(libc::EINVAL);
        assert_eq!(classify_accept_error(&invalid), AcceptFailure::Fatal);
    }
}
