//! A scriptable stand-in for tor's control listener.
//!
//! [`FakeDaemon`] listens on a Unix socket in a temp directory or on an
//! ephemeral loopback TCP port. It serves one client at a time, records
//! every line the client sends, and writes whatever the test pushes.
//!
//! ```ignore
//! let mut daemon = FakeDaemon::unix().await;
//! controller.send("GETINFO version").await?;
//! assert_eq!(daemon.next_request().await.unwrap(), "GETINFO version");
//! daemon.push("250-version=0.4.8.9\r\n250 OK\r\n");
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use onionctl_config::Endpoint;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// How long [`FakeDaemon::next_request`] waits before giving up.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}

enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Listener {
    async fn accept(&self) -> std::io::Result<Box<dyn Stream>> {
        Ok(match self {
            Self::Tcp(listener) => Box::new(listener.accept().await?.0) as Box<dyn Stream>,
            Self::Unix(listener) => Box::new(listener.accept().await?.0) as Box<dyn Stream>,
        })
    }
}

enum Command {
    Write(Vec<u8>),
    HangUp,
}

/// Builder for [`FakeDaemon`].
#[derive(Debug, Default)]
pub struct FakeDaemonBuilder {
    greeting: Option<String>,
}

impl FakeDaemonBuilder {
    /// Bytes written to every client as soon as it connects.
    pub fn greeting(mut self, greeting: impl Into<String>) -> Self {
        self.greeting = Some(greeting.into());
        self
    }

    /// Listen on `control.sock` inside a fresh temp directory.
    pub async fn unix(self) -> FakeDaemon {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let path = temp_dir.path().join("control.sock");
        let listener = UnixListener::bind(&path).expect("failed to bind fake control socket");
        FakeDaemon::start(
            Listener::Unix(listener),
            Endpoint::socket_file(path),
            self.greeting,
            Some(temp_dir),
        )
    }

    /// Listen on an ephemeral loopback port.
    pub async fn tcp(self) -> FakeDaemon {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind fake control port");
        let port = listener
            .local_addr()
            .expect("fake control port has no address")
            .port();
        FakeDaemon::start(
            Listener::Tcp(listener),
            Endpoint::port("127.0.0.1", port),
            self.greeting,
            None,
        )
    }
}

/// A fake control listener owned by a test.
///
/// The listener task is aborted and the temp directory removed when this
/// value is dropped.
pub struct FakeDaemon {
    endpoint: Endpoint,
    commands: mpsc::UnboundedSender<Command>,
    requests: mpsc::UnboundedReceiver<String>,
    accepted: Arc<AtomicUsize>,
    task: JoinHandle<()>,
    _temp_dir: Option<TempDir>,
}

impl FakeDaemon {
    pub fn builder() -> FakeDaemonBuilder {
        FakeDaemonBuilder::default()
    }

    pub async fn unix() -> Self {
        Self::builder().unix().await
    }

    pub async fn tcp() -> Self {
        Self::builder().tcp().await
    }

    fn start(
        listener: Listener,
        endpoint: Endpoint,
        greeting: Option<String>,
        temp_dir: Option<TempDir>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let accepted = Arc::new(AtomicUsize::new(0));

        let task = tokio::spawn(serve(
            listener,
            greeting,
            command_rx,
            request_tx,
            Arc::clone(&accepted),
        ));

        Self {
            endpoint,
            commands: command_tx,
            requests: request_rx,
            accepted,
            task,
            _temp_dir: temp_dir,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn socket_path(&self) -> Option<&Path> {
        match &self.endpoint {
            Endpoint::SocketFile { path } => Some(path),
            Endpoint::Port { .. } => None,
        }
    }

    /// Owned copy of the socket path, for constructors taking `PathBuf`.
    pub fn socket_path_buf(&self) -> Option<PathBuf> {
        self.socket_path().map(Path::to_path_buf)
    }

    pub fn port(&self) -> Option<u16> {
        match &self.endpoint {
            Endpoint::Port { port, .. } => Some(*port),
            Endpoint::SocketFile { .. } => None,
        }
    }

    /// Write raw bytes to the connected client.
    pub fn push(&self, data: &str) {
        let _ = self.commands.send(Command::Write(data.as_bytes().to_vec()));
    }

    /// Drop the current client connection.
    pub fn hang_up(&self) {
        let _ = self.commands.send(Command::HangUp);
    }

    /// Next line received from a client, without its line terminator.
    /// `None` after five seconds of silence.
    pub async fn next_request(&mut self) -> Option<String> {
        tokio::time::timeout(REQUEST_TIMEOUT, self.requests.recv())
            .await
            .ok()
            .flatten()
    }

    /// Number of client connections accepted so far.
    pub fn connections(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

impl Drop for FakeDaemon {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A loopback TCP port with nothing listening on it.
pub fn closed_port() -> u16 {
    let listener =
        std::net::TcpListener::bind("127.0.0.1:0").expect("failed to bind ephemeral port");
    listener
        .local_addr()
        .expect("ephemeral port has no address")
        .port()
}

async fn serve(
    listener: Listener,
    greeting: Option<String>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    requests: mpsc::UnboundedSender<String>,
    accepted: Arc<AtomicUsize>,
) {
    loop {
        let stream = match listener.accept().await {
            Ok(stream) => stream,
            Err(e) => {
                debug!(error = %e, "fake daemon accept failed");
                return;
            }
        };
        accepted.fetch_add(1, Ordering::SeqCst);

        let keep_serving =
            handle_client(stream, greeting.as_deref(), &mut commands, &requests).await;
        if !keep_serving {
            return;
        }
    }
}

/// Serve one client until it disconnects or the test hangs up. Returns
/// `false` once the owning [`FakeDaemon`] is gone.
async fn handle_client(
    stream: Box<dyn Stream>,
    greeting: Option<&str>,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    requests: &mpsc::UnboundedSender<String>,
) -> bool {
    let (read, mut write) = tokio::io::split(stream);
    let mut lines = BufReader::new(read).lines();

    if let Some(greeting) = greeting {
        if write.write_all(greeting.as_bytes()).await.is_err() {
            return true;
        }
    }

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    debug!(line = %line, "fake daemon received");
                    let _ = requests.send(line);
                }
                _ => return true,
            },
            command = commands.recv() => match command {
                Some(Command::Write(data)) => {
                    if write.write_all(&data).await.is_err() {
                        return true;
                    }
                }
                Some(Command::HangUp) => {
                    let _ = write.shutdown().await;
                    return true;
                }
                None => return false,
            },
        }
    }
}
