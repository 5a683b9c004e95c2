//! Per-connection request loop.

use std::io;

use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;

use crate::parser::{find_head_end, parse_head};
use crate::server::config::ServerConfig;
use crate::server::router::Router;
use crate::server::shutdown::ServerState;
use crate::server::{Error, HttpResponse, StatusCode};

/// Size limits applied while reading requests.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ConnectionLimits {
    pub read_buffer_size: usize,
    pub max_head_size: usize,
    pub max_body_size: usize,
}

impl From<&ServerConfig> for ConnectionLimits {
    fn from(config: &ServerConfig) -> Self {
        Self {
            read_buffer_size: config.read_buffer_size.max(1),
            max_head_size: config.max_head_size,
            max_body_size: config.max_body_size,
        }
    }
}

fn is_shutting_down(state: &ServerState) -> bool {
    matches!(state, ServerState::Draining | ServerState::Closing | ServerState::Stopped)
}

/// Serve requests on one connection until the client or the server closes it.
///
/// The connection is only closed by shutdown between requests: a request
/// already being read or handled is answered first, with `Connection: close`.
pub(crate) async fn serve_connection<S>(
    socket: &mut S,
    router: &Router,
    limits: ConnectionLimits,
    mut state: watch::Receiver<ServerState>,
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf: Vec<u8> = Vec::with_capacity(limits.read_buffer_size);
    let mut chunk = vec![0; limits.read_buffer_size];

    loop {
        let head_end = loop {
            if let Some(end) = find_head_end(&buf) {
                break end;
            }
            if buf.len() > limits.max_head_size {
                warn!("Request head exceeds {} bytes", limits.max_head_size);
                let response = HttpResponse::text(StatusCode::RequestHeaderFieldsTooLarge, "Request header fields too large");
                return respond_and_close(socket, response).await;
            }

            let n = if buf.is_empty() {
                // Idle between requests; this is where shutdown may close us
                tokio::select! {
                    biased;
                    read = socket.read(&mut chunk) => read?,
                    _ = wait_for_shutdown(&mut state) => {
                        debug!("Closing idle connection for shutdown");
                        return Ok(());
                    }
                }
            } else {
                socket.read(&mut chunk).await?
            };

            if n == 0 {
                if buf.is_empty() {
                    return Ok(()); // Connection closed
                }
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed mid-request").into());
            }
            buf.extend_from_slice(&chunk[..n]);
        };

        let mut request = match parse_head(&buf[..head_end]) {
            Ok(req) => req,
            Err(e) => {
                let response = HttpResponse::text(StatusCode::BadRequest, format!("Error parsing request: {e}"));
                respond_and_close(socket, response).await?;
                return Err(Error::ParseError(e));
            }
        };

        let body_len = match request.content_length() {
            Ok(len) => len,
            Err(e) => {
                let response = HttpResponse::text(StatusCode::BadRequest, format!("Error parsing request: {e}"));
                respond_and_close(socket, response).await?;
                return Err(Error::ParseError(e));
            }
        };
        if request.has_header("Transfer-Encoding") {
            let response = HttpResponse::text(StatusCode::NotImplemented, "Transfer-Encoding is not supported");
            return respond_and_close(socket, response).await;
        }
        if body_len > limits.max_body_size {
            warn!("Request body of {body_len} bytes exceeds {} bytes", limits.max_body_size);
            let response = HttpResponse::text(StatusCode::PayloadTooLarge, "Payload too large");
            return respond_and_close(socket, response).await;
        }

        let request_end = head_end + body_len;
        while buf.len() < request_end {
            let n = socket.read(&mut chunk).await?;
            if n == 0 {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed mid-body").into());
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        request.body = buf[head_end..request_end].to_vec();
        buf.drain(..request_end);

        debug!("{} {}", request.method, request.path);
        let keep_alive = request.keep_alive();
        let mut response = router.handle(request).await;

        let handler_closed = response.closes_connection();
        let close = handler_closed || !keep_alive || is_shutting_down(&state.borrow());
        if close && !handler_closed {
            response = response.with_header("Connection", "close");
        }
        socket.write_all(&response.to_bytes()).await?;
        socket.flush().await?;

        if close {
            return Ok(());
        }
    }
}

async fn wait_for_shutdown(state: &mut watch::Receiver<ServerState>) {
    let _ = state.wait_for(is_shutting_down).await;
}

async fn respond_and_close<S>(socket: &mut S, response: HttpResponse) -> Result<(), Error>
where
    S: AsyncWrite + Unpin,
{
    let response = response.with_header("Connection", "close");
    socket.write_all(&response.to_bytes()).await?;
    socket.flush().await?;
    Ok(())
}
