//! HTTP listener and connection handling.
//!
//! `Server::bind` opens the listening socket, `Server::run` accepts
//! connections until a `ShutdownHandle` stops it. Each connection is served
//! by one task that parses requests, hands them to the `Handler` and keeps
//! the connection open between requests for the keep-alive timeout.

use crate::body::{BodyError, BodyReader};
use crate::config::Config;
use crate::handler::Handler;
use crate::protocol::{
    BodyFraming, Method, ParseError, ParseResult, Parser, Persistence, RequestHead, Response,
    StatusCode, CONTINUE,
};
use bytes::{Buf, BytesMut};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, trace, warn};

/// Read buffer size
const BUFFER_SIZE: usize = 16 * 1024;

/// Pending connection queue length for the listening socket
const LISTEN_BACKLOG: i32 = 1024;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server instance
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: Arc<Config>,
    connection_limit: Arc<Semaphore>,
    shutdown: Arc<watch::Sender<bool>>,
}

/// Stops a running `Server`.
#[derive(Clone)]
pub struct ShutdownHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// Stop accepting connections and close idle ones.
    pub fn stop(&self) {
        self.sender.send_replace(true);
    }
}

impl Server {
    /// Bind the listening socket. Must be called from within a Tokio runtime.
    pub fn bind(config: Config) -> io::Result<Self> {
        let addr = resolve(&config.listen)?;
        let listener = TcpListener::from_std(bind_listener(addr)?)?;
        let local_addr = listener.local_addr()?;
        info!("Listening on {}:{}", local_addr.ip(), local_addr.port());

        let (shutdown, _) = watch::channel(false);

        Ok(Server {
            listener,
            local_addr,
            connection_limit: Arc::new(Semaphore::new(config.max_connections)),
            config: Arc::new(config),
            shutdown: Arc::new(shutdown),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            sender: Arc::clone(&self.shutdown),
        }
    }

    /// Accept connections until stopped.
    pub async fn run(self) -> Result<(), BoxError> {
        let mut stop = self.shutdown.subscribe();

        loop {
            if *stop.borrow() {
                break;
            }

            // Wait for a connection slot
            let permit = tokio::select! {
                _ = stop.changed() => break,
                permit = Arc::clone(&self.connection_limit).acquire_owned() => permit?,
            };

            let accepted = tokio::select! {
                _ = stop.changed() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, addr)) => {
                    debug!(peer = %addr, "New connection");
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(error = %e, "Failed to set TCP_NODELAY");
                    }

                    let config = Arc::clone(&self.config);
                    let shutdown = self.shutdown.subscribe();

                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, config, shutdown).await {
                            debug!(error = %e, "Connection error");
                        }
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }

        info!(address = %self.local_addr, "Server stopped");
        Ok(())
    }
}

fn resolve(listen: &str) -> io::Result<SocketAddr> {
    listen.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("no address found for '{}'", listen),
        )
    })
}

fn bind_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}

/// Serve requests on one connection until either side closes it.
async fn handle_connection<S>(
    mut stream: S,
    config: Arc<Config>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), BoxError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);
    let handler = Handler::new(config.echo_policy, config.max_body_size);

    // The first head must be complete within the headers timeout of accept
    let mut first_deadline = Some(Instant::now() + config.headers_timeout);

    loop {
        if buffer.is_empty() {
            let idle_deadline =
                first_deadline.unwrap_or_else(|| Instant::now() + config.keep_alive_timeout);
            let read = tokio::select! {
                _ = shutdown.changed() => {
                    trace!("Closing idle connection on shutdown");
                    return Ok(());
                }
                read = timeout_at(idle_deadline, stream.read_buf(&mut buffer)) => read,
            };

            match read {
                Err(_) => {
                    trace!("Idle timeout, closing connection");
                    return Ok(());
                }
                Ok(n) => {
                    if n? == 0 {
                        trace!("Connection closed by client");
                        return Ok(());
                    }
                }
            }
        }

        // Later heads get the headers timeout from their first byte
        let deadline = first_deadline
            .take()
            .unwrap_or_else(|| Instant::now() + config.headers_timeout);
        let head = match read_head(&mut stream, &mut buffer, &config, deadline).await? {
            Some(head) => head,
            None => return Ok(()),
        };
        debug!(method = head.method.as_str(), target = %head.target, "Request");

        let framing = match head.body_framing() {
            Ok(framing) => framing,
            Err(e) => {
                warn!(error = %e, "Invalid body framing");
                let message = format!("HTTP Parsing Error: {}", e);
                send_error(&mut stream, e.status(), &message).await?;
                return Ok(());
            }
        };

        if let BodyFraming::Length(length) = framing {
            if length > config.max_body_size as u64 {
                let e = BodyError::TooLarge {
                    limit: config.max_body_size,
                };
                warn!(length, error = %e, "Declared body too large");
                send_error(&mut stream, e.status(), &e.to_string()).await?;
                return Ok(());
            }
        }

        if head.expects_continue() && framing != BodyFraming::Empty {
            stream.write_all(CONTINUE).await?;
        }

        let result = {
            let mut body = BodyReader::new(&mut stream, &mut buffer, framing, config.max_body_size);
            handler.respond(&head, &mut body).await
        };

        let response = match result {
            Ok(response) => response,
            Err(BodyError::Io(e)) => return Err(e.into()),
            Err(BodyError::UnexpectedEof) => {
                trace!("Connection closed before body was complete");
                return Ok(());
            }
            Err(e) => {
                warn!(error = %e, "Failed to read request body");
                send_error(&mut stream, e.status(), &e.to_string()).await?;
                return Ok(());
            }
        };

        let keep_alive = keeps_alive(&head, &config, *shutdown.borrow());
        let persistence = if keep_alive {
            Persistence::KeepAlive(config.keep_alive_timeout)
        } else {
            Persistence::Close
        };

        let encoded = response.encode(persistence, head.method == Method::Head);
        stream.write_all(&encoded).await?;
        stream.flush().await?;

        if !keep_alive {
            trace!("Closing connection after response");
            stream.shutdown().await?;
            return Ok(());
        }
    }
}

/// Read until a complete request head is buffered, or `deadline` passes.
///
/// Returns `None` when the connection must close; protocol errors have
/// already been answered by then.
async fn read_head<S>(
    stream: &mut S,
    buffer: &mut BytesMut,
    config: &Config,
    deadline: Instant,
) -> Result<Option<RequestHead>, BoxError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match Parser::parse(&buffer[..], config.max_header_size) {
            ParseResult::Complete(head, consumed) => {
                buffer.advance(consumed);
                return Ok(Some(head));
            }

            ParseResult::Error(ParseError::Incomplete) => {
                match timeout_at(deadline, stream.read_buf(buffer)).await {
                    Err(_) => {
                        debug!("Timed out waiting for request headers");
                        let status = StatusCode::RequestTimeout;
                        send_error(stream, status, status.reason()).await?;
                        return Ok(None);
                    }
                    Ok(n) => {
                        if n? == 0 {
                            trace!("Connection closed mid-headers");
                            return Ok(None);
                        }
                    }
                }
            }

            ParseResult::Error(e) => {
                warn!(error = %e, "Parse error");
                let message = format!("HTTP Parsing Error: {}", e);
                send_error(stream, e.status(), &message).await?;
                return Ok(None);
            }
        }
    }
}

fn keeps_alive(head: &RequestHead, config: &Config, stopping: bool) -> bool {
    head.keep_alive() && config.keep_alive_enabled() && !stopping
}

/// Write an error response and close the write side.
async fn send_error<S>(stream: &mut S, status: StatusCode, message: &str) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let response = Response::error(status, message).encode(Persistence::Close, false);
    stream.write_all(&response).await?;
    stream.flush().await?;
    stream.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EchoPolicy;
    use std::time::Duration;
    use tokio::net::TcpStream;
    use tokio::task::JoinHandle;
    use tokio_test::io::Builder;

    fn test_config() -> Config {
        Config {
            listen: "127.0.0.1:0".to_string(),
            ..Config::default()
        }
    }

    async fn start_server(config: Config) -> (SocketAddr, ShutdownHandle, JoinHandle<()>) {
        let server = Server::bind(config).unwrap();
        let addr = server.local_addr();
        let handle = server.shutdown_handle();
        let task = tokio::spawn(async move {
            server.run().await.unwrap();
        });
        (addr, handle, task)
    }

    /// Read one Content-Length framed response, returning head and body.
    async fn read_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
        let mut data = Vec::new();
        let mut buf = [0u8; 4096];

        loop {
            if let Some(end) = data.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8(data[..end].to_vec()).unwrap();
                let length: usize = head
                    .lines()
                    .find_map(|line| line.strip_prefix("Content-Length: "))
                    .map(|v| v.parse().unwrap())
                    .unwrap_or(0);

                let body_start = end + 4;
                while data.len() < body_start + length {
                    let n = stream.read(&mut buf).await.unwrap();
                    assert!(n > 0, "connection closed mid-body");
                    data.extend_from_slice(&buf[..n]);
                }
                return (head, data[body_start..body_start + length].to_vec());
            }

            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "connection closed before response");
            data.extend_from_slice(&buf[..n]);
        }
    }

    async fn run_mock(stream: tokio_test::io::Mock, config: Config) {
        let (_stop, shutdown) = watch::channel(false);
        handle_connection(stream, Arc::new(config), shutdown)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_get_over_mock_stream() {
        let stream = Builder::new()
            .read(b"GET / HTTP/1.1\r\nHost: localhost\r\nUser-Agent: curl/8.0\r\n\r\n")
            .write(b"HTTP/1.1 200 OK\r\nServer: keepalive-echo\r\nContent-Length: 15\r\nConnection: keep-alive\r\nKeep-Alive: timeout=10\r\n\r\nhello curl/8.0\n")
            .build();

        run_mock(stream, test_config()).await;
    }

    #[tokio::test]
    async fn test_post_with_connection_close() {
        let stream = Builder::new()
            .read(b"POST /echo HTTP/1.1\r\nContent-Length: 4\r\nConnection: close\r\n\r\nping")
            .write(b"HTTP/1.1 200 OK\r\nServer: keepalive-echo\r\nContent-Length: 4\r\nConnection: close\r\n\r\nping")
            .build();

        run_mock(stream, test_config()).await;
    }

    #[tokio::test]
    async fn test_expect_continue() {
        let stream = Builder::new()
            .read(b"PUT / HTTP/1.1\r\nContent-Length: 4\r\nExpect: 100-continue\r\nConnection: close\r\n\r\n")
            .write(CONTINUE)
            .read(b"pong")
            .write(b"HTTP/1.1 200 OK\r\nServer: keepalive-echo\r\nContent-Length: 4\r\nConnection: close\r\n\r\npong")
            .build();

        run_mock(stream, test_config()).await;
    }

    #[tokio::test]
    async fn test_malformed_request_gets_400() {
        let expected = Response::error(
            StatusCode::BadRequest,
            "HTTP Parsing Error: Invalid request line: NONSENSE",
        )
        .encode(Persistence::Close, false);

        let stream = Builder::new()
            .read(b"NONSENSE\r\n\r\n")
            .write(&expected)
            .build();

        run_mock(stream, test_config()).await;
    }

    #[tokio::test]
    async fn test_body_over_limit_gets_413() {
        let config = Config {
            max_body_size: 8,
            ..test_config()
        };
        let expected = Response::error(
            StatusCode::PayloadTooLarge,
            "Request body exceeds limit of 8 bytes",
        )
        .encode(Persistence::Close, false);

        let stream = Builder::new()
            .read(b"POST / HTTP/1.1\r\nContent-Length: 100\r\n\r\n")
            .write(&expected)
            .build();

        run_mock(stream, config).await;
    }

    #[tokio::test]
    async fn test_oversized_expect_continue_gets_413_without_continue() {
        let config = Config {
            max_body_size: 8,
            ..test_config()
        };
        let expected = Response::error(
            StatusCode::PayloadTooLarge,
            "Request body exceeds limit of 8 bytes",
        )
        .encode(Persistence::Close, false);

        // Any interim 100 Continue would not match the only expected write
        let stream = Builder::new()
            .read(b"PUT / HTTP/1.1\r\nContent-Length: 100\r\nExpect: 100-continue\r\n\r\n")
            .write(&expected)
            .build();

        run_mock(stream, config).await;
    }

    #[tokio::test]
    async fn test_head_response_has_no_body() {
        let stream = Builder::new()
            .read(b"HEAD / HTTP/1.1\r\nConnection: close\r\n\r\n")
            .write(b"HTTP/1.1 200 OK\r\nServer: keepalive-echo\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
            .build();

        run_mock(stream, test_config()).await;
    }

    #[tokio::test]
    async fn test_http10_closes_by_default() {
        let stream = Builder::new()
            .read(b"GET / HTTP/1.0\r\nUser-Agent: old\r\n\r\n")
            .write(b"HTTP/1.1 200 OK\r\nServer: keepalive-echo\r\nContent-Length: 10\r\nConnection: close\r\n\r\nhello old\n")
            .build();

        run_mock(stream, test_config()).await;
    }

    #[tokio::test]
    async fn test_keep_alive_disabled() {
        let config = Config {
            keep_alive_timeout: Duration::ZERO,
            ..test_config()
        };
        let stream = Builder::new()
            .read(b"GET / HTTP/1.1\r\n\r\n")
            .write(b"HTTP/1.1 200 OK\r\nServer: keepalive-echo\r\nContent-Length: 16\r\nConnection: close\r\n\r\nhello undefined\n")
            .build();

        run_mock(stream, config).await;
    }

    #[tokio::test]
    async fn test_bind_reports_address() {
        let server = Server::bind(test_config()).unwrap();
        let addr = server.local_addr();
        assert_eq!(addr.ip().to_string(), "127.0.0.1");
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn test_bind_twice_fails() {
        let first = Server::bind(test_config()).unwrap();
        let config = Config {
            listen: first.local_addr().to_string(),
            ..test_config()
        };
        assert!(Server::bind(config).is_err());
    }

    #[tokio::test]
    async fn test_keep_alive_reuses_connection() {
        let config = Config {
            keep_alive_timeout: Duration::from_secs(2),
            ..test_config()
        };
        let (addr, handle, task) = start_server(config).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET / HTTP/1.1\r\nUser-Agent: first\r\n\r\n")
            .await
            .unwrap();
        let (head, body) = read_response(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 200 OK"));
        assert!(head.contains("Connection: keep-alive"));
        assert_eq!(body, b"hello first\n");

        tokio::time::sleep(Duration::from_millis(50)).await;

        client
            .write_all(b"POST / HTTP/1.1\r\nContent-Length: 4\r\n\r\nping")
            .await
            .unwrap();
        let (_, body) = read_response(&mut client).await;
        assert_eq!(body, b"ping");

        handle.stop();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_idle_connection_closed_after_keep_alive_timeout() {
        let config = Config {
            keep_alive_timeout: Duration::from_millis(100),
            ..test_config()
        };
        let (addr, handle, task) = start_server(config).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET / HTTP/1.1\r\nUser-Agent: idle\r\n\r\n")
            .await
            .unwrap();
        let (_, body) = read_response(&mut client).await;
        assert_eq!(body, b"hello idle\n");

        tokio::time::sleep(Duration::from_millis(400)).await;

        let mut buf = [0u8; 16];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(n, 0, "server should have closed the idle connection");

        handle.stop();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_slow_headers_get_408() {
        let config = Config {
            headers_timeout: Duration::from_millis(100),
            ..test_config()
        };
        let (addr, handle, task) = start_server(config).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        let response = String::from_utf8(response).unwrap();
        assert!(response.starts_with("HTTP/1.1 408 Request Timeout\r\n"));
        assert!(response.contains("Connection: close"));

        handle.stop();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_first_headers_timeout_runs_from_accept() {
        let config = Config {
            headers_timeout: Duration::from_millis(400),
            ..test_config()
        };
        let (addr, handle, task) = start_server(config).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        client.write_all(b"G").await.unwrap();
        let first_byte = Instant::now();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        let waited = first_byte.elapsed();

        let response = String::from_utf8(response).unwrap();
        assert!(response.starts_with("HTTP/1.1 408 Request Timeout\r\n"));
        assert!(
            waited < Duration::from_millis(300),
            "headers timeout restarted at the first byte: waited {:?}",
            waited
        );

        handle.stop();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_pipelined_requests() {
        let (addr, handle, task) = start_server(test_config()).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(
                b"POST / HTTP/1.1\r\nContent-Length: 3\r\n\r\noneGET / HTTP/1.1\r\nUser-Agent: two\r\nConnection: close\r\n\r\n",
            )
            .await
            .unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        let response = String::from_utf8(response).unwrap();
        assert_eq!(response.matches("HTTP/1.1 200 OK").count(), 2);
        assert!(response.contains("\r\n\r\none"));
        assert!(response.ends_with("\r\n\r\nhello two\n"));

        handle.stop();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_chunked_post_over_tcp() {
        let config = Config {
            echo_policy: EchoPolicy::FirstChunk,
            ..test_config()
        };
        let (addr, handle, task) = start_server(config).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nab\r\n")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.write_all(b"2\r\ncd\r\n0\r\n\r\n").await.unwrap();

        let (head, body) = read_response(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 200 OK"));
        assert_eq!(body, b"ab");

        handle.stop();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_closes_idle_connections() {
        let (addr, handle, task) = start_server(test_config()).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET / HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        read_response(&mut client).await;

        handle.stop();
        task.await.unwrap();

        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("idle connection should close on stop")
            .unwrap();
        assert_eq!(n, 0);
    }
}
