//! Serves `/login` and `/register` on :8080 until SIGINT or SIGTERM.
//!
//! Run with `RUST_LOG=info cargo run --example login_server`, then
//! `curl localhost:8080/login` and `curl -X POST localhost:8080/register`.

use std::sync::Arc;

use log::{error, info};
use microrouter::{HttpResponse, HttpServer, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let mut server = HttpServer::new(ServerConfig::default());
    server.get("/login", |_req| async {
        Ok(HttpResponse::ok().with_body_string("Login success"))
    });
    server.post("/register", |_req| async {
        Ok(HttpResponse::ok().with_body_string("Register success"))
    });

    let server = Arc::new(server);
    let mut serving = tokio::spawn({
        let server = server.clone();
        async move {
            match server.start(":8080").await {
                Err(e) if !e.is_server_closed() => {
                    error!("Server failed: {e}");
                    Err(e)
                }
                _ => Ok(()),
            }
        }
    });

    // A failed bind ends `serving` before any signal arrives
    let stopped = tokio::select! {
        stopped = server.stop() => stopped,
        served = &mut serving => {
            served??;
            return Ok(());
        }
    };
    stopped?;
    serving.await??;

    info!("Bye");
    Ok(())
}
