//! Client-role WebSocket dial.

use anyhow::{anyhow, Context};
use bytes::Bytes;
use fastwebsockets::WebSocket;
use http_body_util::Empty;
use hyper::header::{CONNECTION, HOST, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_VERSION, UPGRADE};
use hyper::upgrade::Upgraded;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::TcpStream;
use tracing::debug;
use url::Url;

/// Dial `{ws_url}/{connection_id}` and perform the WebSocket handshake,
/// returning the raw upgraded socket. The trailing path segment is the
/// connection id the server registers the socket under.
pub async fn connect(ws_url: &Url, connection_id: &str) -> anyhow::Result<WebSocket<TokioIo<Upgraded>>> {
    if ws_url.scheme() != "ws" {
        return Err(anyhow!(
            "unsupported websocket url scheme {:?}, only ws:// is supported",
            ws_url.scheme()
        ));
    }

    let host = ws_url.host_str().context("websocket url has no host")?;
    let port = ws_url.port_or_known_default().unwrap_or(80);
    let authority = format!("{host}:{port}");

    let stream = TcpStream::connect(&authority)
        .await
        .with_context(|| format!("cannot connect to websocket server {authority}"))?;

    let path = format!("{}/{}", ws_url.path().trim_end_matches('/'), connection_id);
    let req = Request::builder()
        .method("GET")
        .uri(path)
        .header(HOST, &authority)
        .header(UPGRADE, "websocket")
        .header(CONNECTION, "upgrade")
        .header(SEC_WEBSOCKET_KEY, fastwebsockets::handshake::generate_key())
        .header(SEC_WEBSOCKET_VERSION, "13")
        .body(Empty::<Bytes>::new())
        .with_context(|| format!("failed to build websocket upgrade request for {ws_url}"))?;

    debug!("websocket upgrade request {req:?}");
    let (ws, _) = fastwebsockets::handshake::client(&TokioExecutor::new(), req, stream)
        .await
        .with_context(|| format!("websocket handshake with {ws_url} failed"))?;

    Ok(ws)
}
