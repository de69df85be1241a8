//! Plain HTTP client used to replay tunneled requests against the upstream
//! base URL.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::Request;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

use crate::error::TunnelError;
use crate::tunnel::http_wire::WireResponse;

pub(crate) type HttpClient = Client<HttpConnector, Full<Bytes>>;

pub(crate) fn http_client() -> HttpClient {
    Client::builder(TokioExecutor::new()).build(HttpConnector::new())
}

/// Dispatch the rewritten request and buffer the full response so it can be
/// framed back to the peer.
pub(crate) async fn dispatch(
    client: &HttpClient,
    req: Request<Full<Bytes>>,
) -> Result<WireResponse, TunnelError> {
    let res = client
        .request(req)
        .await
        .map_err(|err| TunnelError::Transport(err.to_string()))?;

    let (parts, body) = res.into_parts();
    let body = body
        .collect()
        .await
        .map_err(|err| TunnelError::Transport(err.to_string()))?
        .to_bytes();

    Ok(WireResponse {
        status: parts.status,
        headers: parts.headers,
        body,
    })
}
