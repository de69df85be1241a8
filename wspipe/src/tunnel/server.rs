//! HTTP ingress shared by both roles: `/route/...` drives the tunneling
//! path; server-role peers additionally accept WebSocket upgrades on
//! `/ws/{connectionId}`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use fastwebsockets::upgrade;
use http_body_util::{BodyExt, Either, Empty, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::error::TunnelError;
use crate::tunnel::http_wire::WireRequest;
use crate::tunnel::manager::ConnectionManager;
use crate::tunnel::{connection_id_from_path, Role};

type IngressBody = Either<Empty<Bytes>, Full<Bytes>>;
type IngressResponse = Response<IngressBody>;

pub struct IngressConfig {
    pub bind: SocketAddr,
    /// Base URL tunneled requests arriving over accepted sockets are
    /// replayed against.
    pub upstream_base: Url,
    /// How long `/route/...` callers wait for the peer's response.
    pub route_timeout: Duration,
}

/// Accept loop for the local HTTP endpoint. Runs until the listener fails.
pub async fn run_ingress(manager: Arc<ConnectionManager>, config: IngressConfig) -> anyhow::Result<()> {
    let listener = TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("cannot bind ingress server on {}", config.bind))?;
    info!("ingress listening on {} as {}", config.bind, manager.role());

    let config = Arc::new(config);
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(cnx) => cnx,
            Err(err) => {
                warn!("error while accepting ingress connection: {err}");
                continue;
            }
        };

        let manager = manager.clone();
        let config = config.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let manager = manager.clone();
                let config = config.clone();
                async move { Ok::<_, std::convert::Infallible>(handle(manager, config, req).await) }
            });
            let conn = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .with_upgrades();
            if let Err(err) = conn.await {
                debug!("ingress connection from {peer_addr} ended: {err}");
            }
        });
    }
}

async fn handle(
    manager: Arc<ConnectionManager>,
    config: Arc<IngressConfig>,
    req: Request<Incoming>,
) -> IngressResponse {
    let path = req.uri().path().to_owned();

    if manager.role() == Role::Server && path.starts_with("/ws/") {
        return ws_upgrade(manager, config, req);
    }
    if path.starts_with("/route/") {
        return route(manager, config, req).await;
    }

    text_response(StatusCode::NOT_FOUND, "not found")
}

/// Upgrade `/ws/{id}` and hand the socket to the manager. The upgrade future
/// completes on a spawned task once the 101 response has been flushed.
fn ws_upgrade(
    manager: Arc<ConnectionManager>,
    config: Arc<IngressConfig>,
    mut req: Request<Incoming>,
) -> IngressResponse {
    info!("received websocket connection request: {}", req.uri());

    if !upgrade::is_upgrade_request(&req) {
        warn!("rejecting connection with bad upgrade request: {}", req.uri());
        return text_response(StatusCode::BAD_REQUEST, "bad upgrade request");
    }

    let Some(id) = connection_id_from_path(req.uri().path()).map(str::to_owned) else {
        return text_response(StatusCode::INTERNAL_SERVER_ERROR, "Missing connection id");
    };

    let (response, fut) = match upgrade::upgrade(&mut req) {
        Ok(ret) => ret,
        Err(err) => {
            warn!("rejecting connection with bad upgrade request: {err} {}", req.uri());
            return text_response(StatusCode::BAD_REQUEST, "bad upgrade request");
        }
    };

    tokio::spawn(async move {
        match fut.await {
            Ok(ws) => {
                info!("connection established. connection id: {id}");
                manager.add_connection_to_pool(config.upstream_base.clone(), ws, id);
            }
            Err(err) => error!("error during websocket upgrade: {err}"),
        }
    });

    let (parts, _) = response.into_parts();
    Response::from_parts(parts, Either::Left(Empty::new()))
}

/// Tunnel an ingress request to the peer and write its response through
/// verbatim; any tunnel error surfaces as a 500 with the stringified error.
async fn route(
    manager: Arc<ConnectionManager>,
    config: Arc<IngressConfig>,
    req: Request<Incoming>,
) -> IngressResponse {
    info!("http request: {} {}", req.method(), req.uri());

    let connection_id = match manager.role() {
        Role::Server => match connection_id_from_path(req.uri().path()) {
            Some(id) => Some(id.to_owned()),
            None => return text_response(StatusCode::INTERNAL_SERVER_ERROR, "Missing connection id"),
        },
        Role::Client => None,
    };

    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            let err = TunnelError::Serialize(err.to_string());
            error!("{err}");
            return text_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string());
        }
    };
    let wire_request = WireRequest::from_ingress(parts, body);

    match manager
        .send_request(&wire_request, connection_id.as_deref(), config.route_timeout)
        .await
    {
        Ok(response) => {
            let mut res = Response::new(Either::Right(Full::new(response.body)));
            *res.status_mut() = response.status;
            *res.headers_mut() = response.headers;
            res
        }
        Err(err) => {
            error!("{err}");
            text_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
        }
    }
}

fn text_response(status: StatusCode, body: &str) -> IngressResponse {
    let mut res = Response::new(Either::Right(Full::new(Bytes::copy_from_slice(
        body.as_bytes(),
    ))));
    *res.status_mut() = status;
    res
}
