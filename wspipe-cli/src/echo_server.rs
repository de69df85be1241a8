//! Minimal echo upstream used to exercise the tunnel by hand: replies 200
//! with the request body, or `Hello!` when the body is empty.

use std::convert::Infallible;
use std::net::SocketAddr;

use anyhow::Context;
use bytes::Bytes;
use clap::Parser;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(about = "Echo HTTP server for exercising the tunnel", long_about = None)]
struct Args {
    /// Listen port
    #[arg(short = 'p', long = "port", default_value_t = 8082)]
    port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    let bind = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("cannot bind echo server on {bind}"))?;
    info!("echo server listening on {bind}");

    loop {
        let (stream, peer_addr) = listener.accept().await?;
        tokio::spawn(async move {
            let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), service_fn(echo));
            if let Err(err) = conn.await {
                debug!("connection from {peer_addr} ended: {err}");
            }
        });
    }
}

async fn echo(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    info!("http request: {} {}", req.method(), req.uri());

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => Bytes::new(),
    };
    let body = if body.is_empty() {
        Bytes::from_static(b"Hello!")
    } else {
        body
    };

    Ok(Response::new(Full::new(body)))
}
