use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use fastwebsockets::{Frame, Payload, WebSocket};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use rstest::rstest;
use scopeguard::defer;
use serial_test::serial;
use tokio::net::{TcpListener, TcpStream};
use url::Url;

use crate::error::TunnelError;
use crate::tunnel::client;
use crate::tunnel::http_wire::WireRequest;
use crate::tunnel::manager::ConnectionManager;
use crate::tunnel::options::ConnectionOptions;
use crate::tunnel::server::{run_ingress, IngressConfig};
use crate::tunnel::{upstream, Role};

fn test_options() -> ConnectionOptions {
    ConnectionOptions::default().with_max_message_size(16 * 1024)
}

fn localhost(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

fn http_url(port: u16) -> Url {
    Url::parse(&format!("http://127.0.0.1:{port}")).unwrap()
}

fn ws_url(port: u16) -> Url {
    Url::parse(&format!("ws://127.0.0.1:{port}/ws")).unwrap()
}

/// Echo HTTP server: 200, body echoed back (`Hello!` when empty), optionally
/// delayed.
async fn echo_upstream(bind: SocketAddr, delay: Option<Duration>) {
    let listener = TcpListener::bind(bind).await.unwrap();
    loop {
        let (stream, _) = listener.accept().await.unwrap();
        tokio::spawn(async move {
            let service = service_fn(move |req: Request<Incoming>| async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                let body = match req.into_body().collect().await {
                    Ok(collected) => collected.to_bytes(),
                    Err(_) => Bytes::new(),
                };
                let body = if body.is_empty() {
                    Bytes::from_static(b"Hello!")
                } else {
                    body
                };
                Ok::<_, Infallible>(Response::new(Full::new(body)))
            });
            let _ = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await;
        });
    }
}

/// Accept exactly one WebSocket connection and hand the raw socket back to
/// the test, so it can play a (mis)behaving peer. Takes a bound listener so
/// callers can dial without racing the bind.
async fn accept_one_ws(listener: TcpListener) -> WebSocket<TokioIo<Upgraded>> {
    let (stream, _) = listener.accept().await.unwrap();

    let (tx, rx) = tokio::sync::oneshot::channel();
    let tx = Arc::new(Mutex::new(Some(tx)));
    let service = service_fn(move |mut req: Request<Incoming>| {
        let tx = tx.clone();
        async move {
            let (response, fut) = fastwebsockets::upgrade::upgrade(&mut req).unwrap();
            tokio::spawn(async move {
                let ws = fut.await.unwrap();
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(ws);
                }
            });
            Ok::<_, Infallible>(response)
        }
    });
    tokio::spawn(async move {
        let _ = http1::Builder::new()
            .serve_connection(TokioIo::new(stream), service)
            .with_upgrades()
            .await;
    });

    rx.await.unwrap()
}

async fn wait_for_listener(addr: SocketAddr) {
    for _ in 0..100 {
        if TcpStream::connect(addr).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("listener on {addr} did not come up");
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition was not reached in time");
}

/// Full round trip through both ingresses: caller -> client peer -> server
/// peer -> echo upstream and back.
#[rstest]
#[timeout(Duration::from_secs(10))]
#[tokio::test]
#[serial]
async fn echo_round_trip_end_to_end() {
    let echo_h = tokio::spawn(echo_upstream(localhost(17911), None));
    defer! { echo_h.abort(); };

    let server_manager = Arc::new(ConnectionManager::new(Role::Server, test_options()));
    let server_h = tokio::spawn(run_ingress(
        server_manager.clone(),
        IngressConfig {
            bind: localhost(17912),
            upstream_base: http_url(17911),
            route_timeout: Duration::from_secs(10),
        },
    ));
    defer! { server_h.abort(); };
    wait_for_listener(localhost(17912)).await;

    let client_manager = Arc::new(ConnectionManager::new(Role::Client, test_options()));
    let client_h = tokio::spawn(run_ingress(
        client_manager.clone(),
        IngressConfig {
            bind: localhost(17913),
            upstream_base: http_url(17911),
            route_timeout: Duration::from_secs(10),
        },
    ));
    defer! { client_h.abort(); };

    let ws = client::connect(&ws_url(17912), "cnx-1").await.unwrap();
    client_manager.add_connection_to_pool(http_url(17911), ws, "cnx-1".to_owned());
    wait_for_listener(localhost(17913)).await;

    let caller = upstream::http_client();
    let req = Request::builder()
        .method("GET")
        .uri("http://127.0.0.1:17913/route/hello")
        .body(Full::new(Bytes::from_static(b"ping")))
        .unwrap();
    let res = caller.request(req).await.unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    let body = res.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body, Bytes::from_static(b"ping"));
}

/// A caller-side timeout must leave no pending response slot behind.
#[rstest]
#[timeout(Duration::from_secs(10))]
#[tokio::test]
#[serial]
async fn caller_timeout_removes_pending_slot() {
    let echo_h = tokio::spawn(echo_upstream(localhost(17921), Some(Duration::from_secs(30))));
    defer! { echo_h.abort(); };

    let server_manager = Arc::new(ConnectionManager::new(Role::Server, test_options()));
    let server_h = tokio::spawn(run_ingress(
        server_manager.clone(),
        IngressConfig {
            bind: localhost(17922),
            upstream_base: http_url(17921),
            route_timeout: Duration::from_secs(10),
        },
    ));
    defer! { server_h.abort(); };
    wait_for_listener(localhost(17922)).await;

    let client_manager = Arc::new(ConnectionManager::new(Role::Client, test_options()));
    let ws = client::connect(&ws_url(17922), "cnx-slow").await.unwrap();
    client_manager.add_connection_to_pool(http_url(17921), ws, "cnx-slow".to_owned());

    let request = WireRequest {
        method: hyper::Method::GET,
        target: "/slow".to_owned(),
        headers: hyper::http::HeaderMap::new(),
        body: Bytes::new(),
    };

    let started = Instant::now();
    let err = client_manager
        .send_request(&request, None, Duration::from_millis(100))
        .await
        .unwrap_err();

    assert!(matches!(err, TunnelError::Timeout(..)), "got {err:?}");
    assert!(started.elapsed() < Duration::from_millis(500));

    let connection = client_manager.get("cnx-slow").unwrap();
    assert_eq!(connection.pending_len(), 0);
}

/// 100 concurrent exchanges over one socket, each caller must get its own
/// body back.
#[rstest]
#[timeout(Duration::from_secs(20))]
#[tokio::test]
#[serial]
async fn concurrent_requests_do_not_cross_talk() {
    let echo_h = tokio::spawn(echo_upstream(localhost(17931), None));
    defer! { echo_h.abort(); };

    let server_manager = Arc::new(ConnectionManager::new(Role::Server, test_options()));
    let server_h = tokio::spawn(run_ingress(
        server_manager.clone(),
        IngressConfig {
            bind: localhost(17932),
            upstream_base: http_url(17931),
            route_timeout: Duration::from_secs(10),
        },
    ));
    defer! { server_h.abort(); };
    wait_for_listener(localhost(17932)).await;

    let client_manager = Arc::new(ConnectionManager::new(Role::Client, test_options()));
    let ws = client::connect(&ws_url(17932), "cnx-mux").await.unwrap();
    client_manager.add_connection_to_pool(http_url(17931), ws, "cnx-mux".to_owned());

    let mut tasks = Vec::with_capacity(100);
    for i in 0..100 {
        let manager = client_manager.clone();
        tasks.push(tokio::spawn(async move {
            let body = format!("{i}");
            let request = WireRequest {
                method: hyper::Method::POST,
                target: "/mux".to_owned(),
                headers: hyper::http::HeaderMap::new(),
                body: Bytes::from(body.clone()),
            };
            let response = manager
                .send_request(&request, None, Duration::from_secs(10))
                .await
                .unwrap();
            assert_eq!(response.status, StatusCode::OK);
            assert_eq!(response.body, Bytes::from(body));
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
}

/// Lookups for an id that was never registered fail, even while another
/// connection is live.
#[rstest]
#[timeout(Duration::from_secs(10))]
#[tokio::test]
#[serial]
async fn unknown_connection_id_is_reported() {
    let listener = TcpListener::bind(localhost(17941)).await.unwrap();
    let accept = tokio::spawn(accept_one_ws(listener));

    let manager = Arc::new(ConnectionManager::new(Role::Server, test_options()));
    let ws = client::connect(&ws_url(17941), "a").await.unwrap();
    manager.add_connection_to_pool(http_url(17941), ws, "a".to_owned());
    let _peer_ws = accept.await.unwrap();

    let request = WireRequest {
        method: hyper::Method::GET,
        target: "/x".to_owned(),
        headers: hyper::http::HeaderMap::new(),
        body: Bytes::new(),
    };
    let err = manager
        .send_request(&request, Some("c"), Duration::from_secs(1))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        TunnelError::ConnectionNotFound { id: Some(ref id) } if id == "c"
    ));
    assert_eq!(manager.len(), 1);
}

/// An abrupt peer close unregisters the connection; later sends towards the
/// id fail fast.
#[rstest]
#[timeout(Duration::from_secs(10))]
#[tokio::test]
#[serial]
async fn peer_close_unregisters_connection() {
    let listener = TcpListener::bind(localhost(17951)).await.unwrap();
    let accept = tokio::spawn(accept_one_ws(listener));

    let manager = Arc::new(ConnectionManager::new(Role::Client, test_options()));
    let ws = client::connect(&ws_url(17951), "gone").await.unwrap();
    manager.add_connection_to_pool(http_url(17951), ws, "gone".to_owned());
    let peer_ws = accept.await.unwrap();
    assert_eq!(manager.len(), 1);

    drop(peer_ws);

    wait_until(|| manager.len() == 0).await;

    let request = WireRequest {
        method: hyper::Method::GET,
        target: "/x".to_owned(),
        headers: hyper::http::HeaderMap::new(),
        body: Bytes::new(),
    };
    let err = manager
        .send_request(&request, Some("gone"), Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, TunnelError::ConnectionNotFound { .. }));
}

/// A frame above the configured size limit kills the reader and tears the
/// connection down.
#[rstest]
#[timeout(Duration::from_secs(10))]
#[tokio::test]
#[serial]
async fn oversize_frame_tears_down_connection() {
    let listener = TcpListener::bind(localhost(17961)).await.unwrap();
    let accept = tokio::spawn(accept_one_ws(listener));

    // Default options: 512-byte inbound frame limit.
    let manager = Arc::new(ConnectionManager::new(Role::Client, ConnectionOptions::default()));
    let ws = client::connect(&ws_url(17961), "big").await.unwrap();
    manager.add_connection_to_pool(http_url(17961), ws, "big".to_owned());
    let mut peer_ws = accept.await.unwrap();
    assert_eq!(manager.len(), 1);

    peer_ws
        .write_frame(Frame::binary(Payload::Owned(vec![0u8; 2048])))
        .await
        .unwrap();

    wait_until(|| manager.len() == 0).await;
}

/// When teardown drops the instance, waiters holding the async slot observe
/// channel closure instead of hanging.
#[rstest]
#[timeout(Duration::from_secs(10))]
#[tokio::test]
#[serial]
async fn teardown_drops_pending_waiters() {
    let listener = TcpListener::bind(localhost(17971)).await.unwrap();
    let accept = tokio::spawn(accept_one_ws(listener));

    let manager = Arc::new(ConnectionManager::new(Role::Client, test_options()));
    let ws = client::connect(&ws_url(17971), "waiters").await.unwrap();
    manager.add_connection_to_pool(http_url(17971), ws, "waiters".to_owned());
    let peer_ws = accept.await.unwrap();

    let request = WireRequest {
        method: hyper::Method::GET,
        target: "/pending".to_owned(),
        headers: hyper::http::HeaderMap::new(),
        body: Bytes::new(),
    };
    let rx = manager.send_request_async(&request, Some("waiters")).unwrap();

    drop(peer_ws);
    wait_until(|| manager.len() == 0).await;

    assert!(rx.await.is_err());
}
