//! Tests for the HTTP server implementation.

#[cfg(test)]
mod server_tests {
    use std::io::{self, Cursor};
    use std::net::SocketAddr;
    use std::pin::Pin;
    use std::sync::Arc;
    use std::task::{Context, Poll};
    use std::time::{Duration, Instant};
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::Notify;
    use tokio::task::JoinHandle;

    use crate::parser::HttpRequest;
    use crate::server::connection::{serve_connection, ConnectionLimits};
    use crate::server::http_server::{is_transient_accept_error, next_accept_pause, normalize_addr};
    use crate::server::{
        Error, HttpResponse, HttpServer, Immediate, ManualTrigger, Router, ServerConfig, ServerHandle, ServerState,
        ShutdownOutcome, ShutdownStrategy,
    };

    // Mock TcpStream for testing
    struct MockTcpStream {
        read_data: Cursor<Vec<u8>>,
        write_data: Vec<u8>,
    }

    impl MockTcpStream {
        fn new(read_data: impl Into<Vec<u8>>) -> Self {
            Self {
                read_data: Cursor::new(read_data.into()),
                write_data: Vec::new(),
            }
        }

        fn written(&self) -> String {
            String::from_utf8_lossy(&self.write_data).into_owned()
        }
    }

    impl AsyncRead for MockTcpStream {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            let this = self.get_mut();
            let n = std::io::Read::read(&mut this.read_data, buf.initialize_unfilled())?;
            buf.advance(n);
            Poll::Ready(Ok(()))
        }
    }

    impl AsyncWrite for MockTcpStream {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            let this = self.get_mut();
            this.write_data.extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn login_router() -> Router {
        let mut router = Router::new();
        router.get("/login", |_req| async {
            Ok(HttpResponse::ok().with_body_string("Login success"))
        });
        router.post("/register", |_req| async {
            Ok(HttpResponse::ok().with_body_string("Register success"))
        });
        router
    }

    fn limits() -> ConnectionLimits {
        ConnectionLimits::from(&ServerConfig::default())
    }

    async fn serve_mock(router: &Router, request: &[u8]) -> (Result<(), Error>, String) {
        let handle = ServerHandle::new();
        let mut stream = MockTcpStream::new(request);
        let result = serve_connection(&mut stream, router, limits(), handle.subscribe()).await;
        (result, stream.written())
    }

    #[tokio::test]
    async fn test_handle_connection_with_valid_request() {
        let (result, response) = serve_mock(&login_router(), b"GET /login HTTP/1.1\r\nHost: localhost\r\n\r\n").await;

        assert!(result.is_ok());
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.ends_with("Login success"));
    }

    #[tokio::test]
    async fn test_handle_connection_with_not_found() {
        let (result, response) = serve_mock(&login_router(), b"GET /nonexistent HTTP/1.1\r\nHost: localhost\r\n\r\n").await;

        // A miss is an ordinary response, not a connection error
        assert!(result.is_ok());
        assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(response.ends_with("\r\n\r\n404 NOT FOUND"));
    }

    #[tokio::test]
    async fn test_handle_connection_with_wrong_method() {
        let (result, response) = serve_mock(&login_router(), b"GET /register HTTP/1.1\r\nHost: localhost\r\n\r\n").await;

        assert!(result.is_ok());
        assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(response.ends_with("404 NOT FOUND"));
    }

    #[tokio::test]
    async fn test_percent_encoded_path_is_routed_decoded() {
        let (result, response) = serve_mock(&login_router(), b"GET /log%69n HTTP/1.1\r\nHost: localhost\r\n\r\n").await;

        assert!(result.is_ok());
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.ends_with("Login success"));
    }

    #[tokio::test]
    async fn test_absolute_form_target_is_routed_by_path() {
        let (result, response) = serve_mock(
            &login_router(),
            b"GET http://localhost:8080/login HTTP/1.1\r\nHost: localhost\r\n\r\n",
        )
        .await;

        assert!(result.is_ok());
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.ends_with("Login success"));
    }

    #[tokio::test]
    async fn test_handler_connection_close_ends_connection() {
        let mut router = Router::new();
        router.get("/bye", |_req| async {
            Ok(HttpResponse::ok().with_header("connection", "close").with_body_string("bye"))
        });

        let (result, response) = serve_mock(
            &router,
            b"GET /bye HTTP/1.1\r\nHost: localhost\r\n\r\nGET /bye HTTP/1.1\r\nHost: localhost\r\n\r\n",
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(response.matches("HTTP/1.1 200 OK\r\n").count(), 1);
        // The handler's header is kept as is, not duplicated
        assert_eq!(response.to_ascii_lowercase().matches("connection: close").count(), 1);
    }

    #[tokio::test]
    async fn test_handle_connection_with_invalid_request() {
        let (result, response) = serve_mock(&login_router(), b"INVALID REQUEST\r\n\r\n").await;

        assert!(matches!(result, Err(Error::ParseError(_))));
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(response.contains("Connection: close\r\n"));
        assert!(response.contains("Error parsing request:"));
    }

    #[tokio::test]
    async fn test_request_body_is_delivered() {
        let mut router = Router::new();
        router.post("/echo", |req: HttpRequest| async move {
            Ok(HttpResponse::ok().with_body_bytes(req.body))
        });

        let (result, response) = serve_mock(
            &router,
            b"POST /echo HTTP/1.1\r\nHost: localhost\r\nContent-Length: 11\r\n\r\nhello world",
        )
        .await;

        assert!(result.is_ok());
        assert!(response.ends_with("\r\n\r\nhello world"));
    }

    #[tokio::test]
    async fn test_truncated_body_is_an_error() {
        let (result, _) = serve_mock(
            &login_router(),
            b"POST /register HTTP/1.1\r\nHost: localhost\r\nContent-Length: 50\r\n\r\nshort",
        )
        .await;

        assert!(matches!(result, Err(Error::IoError(ref e)) if e.kind() == io::ErrorKind::UnexpectedEof));
    }

    #[tokio::test]
    async fn test_oversized_body_is_rejected() {
        let request = format!(
            "POST /register HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\n\r\n",
            ServerConfig::default().max_body_size + 1
        );
        let (result, response) = serve_mock(&login_router(), request.as_bytes()).await;

        assert!(result.is_ok());
        assert!(response.starts_with("HTTP/1.1 413 Payload Too Large\r\n"));
    }

    #[tokio::test]
    async fn test_pipelined_requests_on_keep_alive_connection() {
        let (result, response) = serve_mock(
            &login_router(),
            b"GET /login HTTP/1.1\r\nHost: localhost\r\n\r\nPOST /register HTTP/1.1\r\nHost: localhost\r\n\r\n",
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(response.matches("HTTP/1.1 200 OK\r\n").count(), 2);
        assert!(response.contains("Login success"));
        assert!(response.ends_with("Register success"));
    }

    #[tokio::test]
    async fn test_connection_close_stops_after_first_response() {
        let (result, response) = serve_mock(
            &login_router(),
            b"GET /login HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\nGET /login HTTP/1.1\r\nHost: localhost\r\n\r\n",
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(response.matches("HTTP/1.1 200 OK\r\n").count(), 1);
        assert!(response.contains("Connection: close\r\n"));
    }

    #[tokio::test]
    async fn test_draining_server_closes_after_in_flight_response() {
        let handle = ServerHandle::new();
        handle.set_state(ServerState::Draining);

        let mut stream = MockTcpStream::new(
            &b"GET /login HTTP/1.1\r\nHost: localhost\r\n\r\nGET /login HTTP/1.1\r\nHost: localhost\r\n\r\n"[..],
        );
        let result = serve_connection(&mut stream, &login_router(), limits(), handle.subscribe()).await;

        assert!(result.is_ok());
        let response = stream.written();
        assert_eq!(response.matches("HTTP/1.1 200 OK\r\n").count(), 1);
        assert!(response.contains("Connection: close\r\n"));
    }

    #[test]
    fn test_normalize_addr() {
        assert_eq!(normalize_addr(":8080").unwrap(), "0.0.0.0:8080");
        assert_eq!(normalize_addr("127.0.0.1:80").unwrap(), "127.0.0.1:80");
        assert_eq!(normalize_addr("[::1]:80").unwrap(), "[::1]:80");
        assert!(matches!(normalize_addr("localhost"), Err(Error::InvalidAddress(_))));
        assert!(matches!(normalize_addr(""), Err(Error::InvalidAddress(_))));
    }

    #[test]
    fn test_transient_accept_errors() {
        assert!(is_transient_accept_error(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(is_transient_accept_error(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(!is_transient_accept_error(&io::Error::new(io::ErrorKind::Other, "listener gone")));
        assert!(!is_transient_accept_error(&io::Error::from(io::ErrorKind::InvalidInput)));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_descriptor_exhaustion_is_transient() {
        // EMFILE, ENFILE, ENOMEM, ENOBUFS
        for code in [24, 23, 12, 105] {
            assert!(is_transient_accept_error(&io::Error::from_raw_os_error(code)), "errno {code}");
        }
        // EBADF means the listener itself is broken
        assert!(!is_transient_accept_error(&io::Error::from_raw_os_error(9)));
    }

    #[test]
    fn test_accept_pause_backs_off_to_one_second() {
        let mut pause = next_accept_pause(None);
        assert_eq!(pause, Duration::from_millis(5));

        pause = next_accept_pause(Some(pause));
        assert_eq!(pause, Duration::from_millis(10));

        for _ in 0..20 {
            pause = next_accept_pause(Some(pause));
        }
        assert_eq!(pause, Duration::from_secs(1));
    }

    fn immediate_stop(grace: Duration) -> ServerConfig {
        ServerConfig::default().with_shutdown_strategy(ShutdownStrategy::graceful(Immediate, grace))
    }

    fn login_server(config: ServerConfig) -> HttpServer {
        let mut server = HttpServer::new(config);
        server.get("/login", |_req| async {
            Ok(HttpResponse::ok().with_body_string("Login success"))
        });
        server.post("/register", |_req| async {
            Ok(HttpResponse::ok().with_body_string("Register success"))
        });
        server
    }

    async fn spawn_server(server: HttpServer) -> (Arc<HttpServer>, JoinHandle<Result<(), Error>>, SocketAddr) {
        let server = Arc::new(server);
        let serving = tokio::spawn({
            let server = server.clone();
            async move { server.start("127.0.0.1:0").await }
        });
        let addr = server.handle().local_addr().await.expect("server should be listening");
        (server, serving, addr)
    }

    async fn send(addr: SocketAddr, raw: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(raw.as_bytes()).await.unwrap();
        let mut out = Vec::new();
        let _ = stream.read_to_end(&mut out).await;
        String::from_utf8_lossy(&out).into_owned()
    }

    #[tokio::test]
    async fn test_started_server_answers_404_for_unregistered_path() {
        let (server, serving, addr) = spawn_server(login_server(immediate_stop(Duration::from_secs(5)))).await;

        let response = send(addr, "GET /missing HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(response.ends_with("\r\n\r\n404 NOT FOUND"));

        server.stop().await.unwrap();
        assert!(serving.await.unwrap().unwrap_err().is_server_closed());
    }

    #[tokio::test]
    async fn test_login_and_register_scenario() {
        let (server, serving, addr) = spawn_server(login_server(immediate_stop(Duration::from_secs(5)))).await;

        let login = send(addr, "GET /login HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n").await;
        assert!(login.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(login.ends_with("Login success"));

        let register = send(
            addr,
            "POST /register HTTP/1.1\r\nHost: localhost\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(register.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(register.ends_with("Register success"));

        let wrong_method = send(addr, "GET /register HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n").await;
        assert!(wrong_method.starts_with("HTTP/1.1 404 Not Found\r\n"));

        server.stop().await.unwrap();
        assert!(matches!(serving.await.unwrap(), Err(Error::ServerClosed)));
    }

    #[tokio::test]
    async fn test_finished_connections_are_released() {
        let (server, serving, addr) = spawn_server(login_server(immediate_stop(Duration::from_secs(5)))).await;

        for _ in 0..50 {
            let response = send(addr, "GET /login HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n").await;
            assert!(response.ends_with("Login success"));
        }

        let handle = server.handle();
        let released = tokio::time::timeout(Duration::from_secs(2), async {
            while handle.active_connections() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(released.is_ok(), "{} connections still tracked", handle.active_connections());

        server.stop().await.unwrap();
        assert!(serving.await.unwrap().unwrap_err().is_server_closed());
    }

    #[tokio::test]
    async fn test_shutdown_without_in_flight_requests_is_prompt() {
        let (server, serving, _addr) = spawn_server(login_server(immediate_stop(Duration::from_secs(5)))).await;

        let started = Instant::now();
        server.stop().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));

        assert!(matches!(serving.await.unwrap(), Err(Error::ServerClosed)));
        assert_eq!(server.handle().state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn test_idle_keep_alive_connection_does_not_hold_shutdown() {
        let (server, serving, addr) = spawn_server(login_server(ServerConfig::default())).await;

        // Connected but silent; the server should close it as soon as draining starts
        let mut idle = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let outcome = server.handle().shutdown(Duration::from_secs(5)).await.unwrap();
        assert_eq!(outcome, ShutdownOutcome::Graceful);

        let mut buf = [0u8; 16];
        assert_eq!(idle.read(&mut buf).await.unwrap_or(0), 0);
        assert!(serving.await.unwrap().unwrap_err().is_server_closed());
    }

    #[tokio::test]
    async fn test_in_flight_request_completes_during_grace_period() {
        let entered = Arc::new(Notify::new());
        let mut server = HttpServer::new(ServerConfig::default());
        server.get("/slow", {
            let entered = entered.clone();
            move |_req| {
                let entered = entered.clone();
                async move {
                    entered.notify_one();
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(HttpResponse::ok().with_body_string("done"))
                }
            }
        });
        let (server, serving, addr) = spawn_server(server).await;

        let client = tokio::spawn(async move { send(addr, "GET /slow HTTP/1.1\r\nHost: localhost\r\n\r\n").await });
        entered.notified().await;

        let outcome = server.handle().shutdown(Duration::from_secs(5)).await.unwrap();
        assert_eq!(outcome, ShutdownOutcome::Graceful);

        let response = client.await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("Connection: close\r\n"));
        assert!(response.ends_with("done"));
        assert!(serving.await.unwrap().unwrap_err().is_server_closed());
    }

    #[tokio::test]
    async fn test_slow_handler_is_force_closed_after_grace_period() {
        let entered = Arc::new(Notify::new());
        let mut server = HttpServer::new(immediate_stop(Duration::from_millis(100)));
        server.get("/slow", {
            let entered = entered.clone();
            move |_req| {
                let entered = entered.clone();
                async move {
                    entered.notify_one();
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(HttpResponse::ok().with_body_string("too late"))
                }
            }
        });
        let (server, serving, addr) = spawn_server(server).await;

        let client = tokio::spawn(async move { send(addr, "GET /slow HTTP/1.1\r\nHost: localhost\r\n\r\n").await });
        entered.notified().await;

        let started = Instant::now();
        server.stop().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));

        // The connection was dropped without a response
        assert_eq!(client.await.unwrap(), "");
        assert!(serving.await.unwrap().unwrap_err().is_server_closed());
    }

    #[tokio::test]
    async fn test_forced_outcome_is_observable_on_handle() {
        let entered = Arc::new(Notify::new());
        let mut server = HttpServer::new(ServerConfig::default());
        server.get("/slow", {
            let entered = entered.clone();
            move |_req| {
                let entered = entered.clone();
                async move {
                    entered.notify_one();
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(HttpResponse::ok())
                }
            }
        });
        let (server, serving, addr) = spawn_server(server).await;

        let _client = tokio::spawn(async move { send(addr, "GET /slow HTTP/1.1\r\nHost: localhost\r\n\r\n").await });
        entered.notified().await;

        let outcome = server.handle().shutdown(Duration::from_millis(50)).await.unwrap();
        assert_eq!(outcome, ShutdownOutcome::Forced);
        assert!(serving.await.unwrap().unwrap_err().is_server_closed());
    }

    #[tokio::test]
    async fn test_stop_waits_for_trigger() {
        let trigger = ManualTrigger::new();
        let config = ServerConfig::default()
            .with_shutdown_strategy(ShutdownStrategy::graceful(trigger.clone(), Duration::from_secs(5)));
        let (server, serving, _addr) = spawn_server(login_server(config)).await;

        let stopping = tokio::spawn({
            let server = server.clone();
            async move { server.stop().await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(server.handle().state(), ServerState::Listening(_)));

        trigger.fire();
        stopping.await.unwrap().unwrap();
        assert!(serving.await.unwrap().unwrap_err().is_server_closed());
    }

    #[tokio::test]
    async fn test_custom_strategy_result_is_returned() {
        let config = ServerConfig::default().with_shutdown_strategy(ShutdownStrategy::from_fn(|_handle| async {
            Err::<(), _>(Error::Shutdown("refusing to stop".to_string()))
        }));
        let server = HttpServer::new(config);

        assert!(matches!(server.stop().await, Err(Error::Shutdown(_))));
    }

    #[tokio::test]
    async fn test_start_twice_and_after_stop() {
        let (server, serving, _addr) = spawn_server(login_server(immediate_stop(Duration::from_secs(5)))).await;

        assert!(matches!(server.start("127.0.0.1:0").await, Err(Error::AlreadyStarted)));

        server.stop().await.unwrap();
        assert!(serving.await.unwrap().unwrap_err().is_server_closed());
        assert!(matches!(server.start("127.0.0.1:0").await, Err(Error::ServerClosed)));
    }

    #[tokio::test]
    async fn test_bind_failure_is_returned_and_start_can_be_retried() {
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let taken = occupied.local_addr().unwrap().to_string();

        let server = HttpServer::new(ServerConfig::default());
        assert!(matches!(server.start(&taken).await, Err(Error::IoError(_))));
        assert_eq!(server.handle().state(), ServerState::Created);
    }

    #[tokio::test]
    async fn test_dropped_start_does_not_block_shutdown() {
        let server = HttpServer::new(ServerConfig::default());

        // Resolving a hostname keeps the first poll of `start` pending
        let _ = tokio::time::timeout(Duration::ZERO, server.start("localhost:0")).await;
        assert_ne!(server.handle().state(), ServerState::Starting);

        let outcome = tokio::time::timeout(Duration::from_secs(1), server.handle().shutdown(Duration::from_secs(5))).await;
        assert!(matches!(outcome, Ok(Ok(ShutdownOutcome::Graceful))));
    }

    #[tokio::test]
    async fn test_connection_limit_rejects_with_503() {
        let config = ServerConfig {
            max_connections: 1,
            ..immediate_stop(Duration::from_millis(100))
        };
        let (server, serving, addr) = spawn_server(login_server(config)).await;

        // Hold the only slot with an idle connection
        let _held = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Only read: the rejected connection is closed without reading a request
        let mut rejected = TcpStream::connect(addr).await.unwrap();
        let mut out = Vec::new();
        let _ = rejected.read_to_end(&mut out).await;
        let response = String::from_utf8_lossy(&out);
        assert!(response.starts_with("HTTP/1.1 503 Service Unavailable\r\n"));

        server.stop().await.unwrap();
        assert!(serving.await.unwrap().unwrap_err().is_server_closed());
    }
}
