//! Per-WebSocket connection instance.
//!
//! One reader task and one writer task own the two halves of the socket; the
//! send queue and a small control-frame queue are the only paths into the
//! writer, so every socket write is serialized through it. The reader owns
//! the close path: on exit it unregisters the instance, the send queue is
//! closed, and the writer emits a Close frame and stops.

use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use bytes::Bytes;
use fastwebsockets::{CloseCode, Frame, OpCode, Payload, WebSocket, WebSocketRead, WebSocketWrite};
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::select;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};
use url::Url;
use uuid::Uuid;

use crate::error::TunnelError;
use crate::tunnel::envelope::{Envelope, MessageKind};
use crate::tunnel::http_wire::WireResponse;
use crate::tunnel::options::ConnectionOptions;
use crate::tunnel::upstream;

pub(crate) type WsRead = WebSocketRead<ReadHalf<TokioIo<Upgraded>>>;
pub(crate) type WsWrite = WebSocketWrite<WriteHalf<TokioIo<Upgraded>>>;

/// Receiver half of a single-use response slot.
pub type ResponseReceiver = oneshot::Receiver<WireResponse>;

const SEND_QUEUE_CAPACITY: usize = 256;
const CONTROL_QUEUE_CAPACITY: usize = 8;

/// Control operations the reader routes to the writer so that it never
/// touches the socket itself.
enum ControlOp {
    Pong(Vec<u8>),
}

/// State handed to `start()` exactly once.
struct Pumps {
    ws_rx: WsRead,
    ws_tx: WsWrite,
    send_rx: mpsc::Receiver<Bytes>,
    control_rx: mpsc::Receiver<ControlOp>,
    shutdown_tx: oneshot::Sender<()>,
    shutdown_rx: oneshot::Receiver<()>,
    writer_exited_tx: oneshot::Sender<()>,
    writer_exited_rx: oneshot::Receiver<()>,
    unregister: Box<dyn FnOnce() + Send>,
}

pub struct ConnectionInstance {
    id: String,
    upstream_base: Url,
    options: ConnectionOptions,
    send_tx: mpsc::Sender<Bytes>,
    control_tx: mpsc::Sender<ControlOp>,
    pending: Mutex<AHashMap<Uuid, oneshot::Sender<WireResponse>>>,
    http_client: upstream::HttpClient,
    pumps: Mutex<Option<Pumps>>,
}

/// Configure the freshly upgraded socket and split it into the two halves the
/// pumps own. Control frames are handled explicitly, so the library automatic
/// replies stay off.
pub(crate) fn split_socket(
    mut ws: WebSocket<TokioIo<Upgraded>>,
    options: &ConnectionOptions,
) -> (WsRead, WsWrite) {
    ws.set_auto_pong(false);
    ws.set_auto_close(false);
    ws.set_auto_apply_mask(true);
    ws.set_max_message_size(options.max_message_size);
    ws.split(tokio::io::split)
}

fn noop_frame_handler(_: Frame<'_>) -> futures_util::future::Ready<anyhow::Result<()>> {
    futures_util::future::ready(anyhow::Ok(()))
}

impl ConnectionInstance {
    pub(crate) fn new(
        id: String,
        upstream_base: Url,
        ws_rx: WsRead,
        ws_tx: WsWrite,
        options: ConnectionOptions,
        unregister: Box<dyn FnOnce() + Send>,
    ) -> Arc<Self> {
        let (send_tx, send_rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        let (control_tx, control_rx) = mpsc::channel(CONTROL_QUEUE_CAPACITY);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (writer_exited_tx, writer_exited_rx) = oneshot::channel();

        Arc::new(Self {
            id,
            upstream_base,
            options,
            send_tx,
            control_tx,
            pending: Mutex::new(AHashMap::new()),
            http_client: upstream::http_client(),
            pumps: Mutex::new(Some(Pumps {
                ws_rx,
                ws_tx,
                send_rx,
                control_rx,
                shutdown_tx,
                shutdown_rx,
                writer_exited_tx,
                writer_exited_rx,
                unregister,
            })),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Spawn the reader and writer pumps. Must be called exactly once.
    pub(crate) fn start(self: &Arc<Self>) {
        let Some(pumps) = self.pumps.lock().take() else {
            debug_assert!(false, "connection started twice");
            return;
        };

        tokio::spawn(write_pump(
            self.id.clone(),
            pumps.ws_tx,
            pumps.send_rx,
            pumps.control_rx,
            pumps.shutdown_rx,
            pumps.writer_exited_tx,
            self.options,
        ));
        tokio::spawn(self.clone().read_pump(
            pumps.ws_rx,
            pumps.shutdown_tx,
            pumps.writer_exited_rx,
            pumps.unregister,
        ));
    }

    /// Install a response slot for the envelope's id and enqueue the frame.
    /// The slot is installed before the enqueue so a fast peer cannot answer
    /// into a missing slot; it is removed again if the enqueue fails.
    pub fn send_request_async(&self, request: &Envelope) -> Result<ResponseReceiver, TunnelError> {
        debug!("send_request_async [{}] -> kind:{} id:{}", self.id, request.kind, request.id);
        let frame = request.encode();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request.id, tx);

        if let Err(err) = self.send_tx.try_send(frame) {
            self.pending.lock().remove(&request.id);
            return Err(match err {
                TrySendError::Full(_) => TunnelError::QueueFull,
                TrySendError::Closed(_) => TunnelError::ChannelClosed(request.id),
            });
        }

        Ok(rx)
    }

    /// Enqueue a response frame. No slot is installed; a slow peer makes this
    /// wait for queue capacity.
    pub async fn send_response_async(&self, response: &Envelope) -> Result<(), TunnelError> {
        debug!("send_response_async [{}] -> kind:{} id:{}", self.id, response.kind, response.id);
        self.send_tx
            .send(response.encode())
            .await
            .map_err(|_| TunnelError::ChannelClosed(response.id))
    }

    /// Send a request and wait for the matching response or `max_wait`.
    /// Whatever the outcome, the response slot is gone when this returns.
    pub async fn send_request(
        &self,
        request: &Envelope,
        max_wait: Duration,
    ) -> Result<WireResponse, TunnelError> {
        let id = request.id;
        let rx = self.send_request_async(request)?;

        match tokio::time::timeout(max_wait, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                self.pending.lock().remove(&id);
                Err(TunnelError::ChannelClosed(id))
            }
            Err(_) => {
                debug!("send_request [{}]: time out for message id {}", self.id, id);
                self.pending.lock().remove(&id);
                Err(TunnelError::Timeout(max_wait, id))
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Reader pump: sole owner of socket reads. The read deadline is re-armed
    /// by every frame that arrives, pongs included. On exit the teardown
    /// guard unregisters the instance and releases the writer.
    async fn read_pump(
        self: Arc<Self>,
        mut ws_rx: WsRead,
        shutdown_tx: oneshot::Sender<()>,
        mut writer_exited_rx: oneshot::Receiver<()>,
        unregister: Box<dyn FnOnce() + Send>,
    ) {
        debug!("read pump started [{}]", self.id);
        let _teardown = scopeguard::guard((unregister, shutdown_tx), |(unregister, shutdown_tx)| {
            unregister();
            let _ = shutdown_tx.send(());
        });

        let mut noop_handler = noop_frame_handler;
        loop {
            let read = select! {
                biased;
                _ = &mut writer_exited_rx => {
                    debug!("read pump [{}]: writer exited", self.id);
                    break;
                }
                read = tokio::time::timeout(
                    self.options.pong_wait,
                    ws_rx.read_frame(&mut noop_handler),
                ) => read,
            };
            let frame = match read {
                Ok(Ok(frame)) => frame,
                Ok(Err(err)) => {
                    warn!("read pump [{}]: {err}", self.id);
                    break;
                }
                Err(_) => {
                    warn!("read pump [{}]: read deadline exceeded", self.id);
                    break;
                }
            };

            match frame.opcode {
                OpCode::Close => {
                    debug!("read pump [{}]: close frame received", self.id);
                    break;
                }
                OpCode::Ping => {
                    if self
                        .control_tx
                        .send(ControlOp::Pong(frame.payload.to_owned()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                OpCode::Pong => {}
                OpCode::Binary => match Envelope::decode(frame.payload.as_ref()) {
                    Ok(envelope) => self.dispatch_envelope(envelope),
                    Err(err) => error!("read pump [{}]: {err}", self.id),
                },
                OpCode::Text | OpCode::Continuation => {}
            }
        }

        debug!("read pump stopped [{}]", self.id);
    }

    fn dispatch_envelope(self: &Arc<Self>, envelope: Envelope) {
        match MessageKind::from_u8(envelope.kind) {
            Some(MessageKind::Request) => self.handle_request(envelope),
            Some(MessageKind::Response) => self.handle_response(envelope),
            None => debug!("[{}] dropping frame with unknown kind {}", self.id, envelope.kind),
        }
    }

    /// Replay an inbound request against the upstream and answer with a
    /// response envelope under the same id. Every failure abandons the
    /// exchange; the peer only ever observes it as a rendezvous timeout.
    fn handle_request(self: &Arc<Self>, envelope: Envelope) {
        let conn = self.clone();
        tokio::spawn(async move {
            debug!("handle_request [{}] {}", conn.id, envelope.id);
            let request = match envelope.decode_request_with_base(&conn.upstream_base) {
                Ok(request) => request,
                Err(err) => {
                    error!("handle_request [{}]: {err}", conn.id);
                    return;
                }
            };

            let response = match upstream::dispatch(&conn.http_client, request).await {
                Ok(response) => response,
                Err(err) => {
                    error!("handle_request [{}]: {err}", conn.id);
                    return;
                }
            };

            let reply = Envelope::response(&response, envelope.id);
            if let Err(err) = conn.send_response_async(&reply).await {
                error!("handle_request [{}]: {err}", conn.id);
            }
        });
    }

    /// Resolve the response slot for an inbound response. Slot removal is
    /// atomic with delivery: whichever of this path and the waiter's timeout
    /// path takes the entry first wins, the other is a no-op.
    fn handle_response(&self, envelope: Envelope) {
        debug!("handle_response [{}] {}", self.id, envelope.id);
        let response = match envelope.decode_response() {
            Ok(response) => response,
            Err(err) => {
                error!("handle_response [{}]: {err}", self.id);
                return;
            }
        };

        match self.pending.lock().remove(&envelope.id) {
            Some(slot) => {
                // Waiter may have just timed out; dropping the value is fine.
                let _ = slot.send(response);
            }
            None => debug!("handle_response [{}]: no slot for message id {}", self.id, envelope.id),
        }
    }
}

/// Writer pump: sole owner of socket writes. Drains the send queue, answers
/// pings routed by the reader, emits keepalive pings, and turns the shutdown
/// signal into a Close frame.
async fn write_pump(
    id: String,
    mut ws_tx: WsWrite,
    mut send_rx: mpsc::Receiver<Bytes>,
    mut control_rx: mpsc::Receiver<ControlOp>,
    mut shutdown_rx: oneshot::Receiver<()>,
    writer_exited_tx: oneshot::Sender<()>,
    options: ConnectionOptions,
) {
    // Dropped on exit, which releases a reader that is still mid-read.
    let _exited = writer_exited_tx;
    debug!("write pump started [{id}]");
    let start = tokio::time::Instant::now() + options.ping_period;
    let mut ticker = tokio::time::interval_at(start, options.ping_period);

    loop {
        select! {
            biased;

            _ = &mut shutdown_rx => {
                send_rx.close();
                let _ = timed_write(
                    &mut ws_tx,
                    Frame::close(CloseCode::Normal.into(), &[]),
                    options.write_wait,
                )
                .await;
                break;
            }

            op = control_rx.recv() => match op {
                Some(ControlOp::Pong(payload)) => {
                    if let Err(err) = timed_write(
                        &mut ws_tx,
                        Frame::pong(Payload::Owned(payload)),
                        options.write_wait,
                    )
                    .await
                    {
                        warn!("write pump [{id}]: {err}");
                        break;
                    }
                }
                None => break,
            },

            frame = send_rx.recv() => match frame {
                Some(bytes) => {
                    if let Err(err) = timed_write(
                        &mut ws_tx,
                        Frame::binary(Payload::Owned(bytes.to_vec())),
                        options.write_wait,
                    )
                    .await
                    {
                        warn!("write pump [{id}]: {err}");
                        break;
                    }
                }
                None => {
                    let _ = timed_write(
                        &mut ws_tx,
                        Frame::close(CloseCode::Normal.into(), &[]),
                        options.write_wait,
                    )
                    .await;
                    break;
                }
            },

            _ = ticker.tick() => {
                if let Err(err) = timed_write(
                    &mut ws_tx,
                    Frame::new(true, OpCode::Ping, None, Payload::Borrowed(&[])),
                    options.write_wait,
                )
                .await
                {
                    warn!("write pump [{id}]: {err}");
                    break;
                }
            }
        }
    }

    debug!("write pump stopped [{id}]");
}

async fn timed_write(
    ws_tx: &mut WsWrite,
    frame: Frame<'_>,
    write_wait: Duration,
) -> Result<(), TunnelError> {
    match tokio::time::timeout(write_wait, ws_tx.write_frame(frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(TunnelError::Transport(err.to_string())),
        Err(_) => Err(TunnelError::Transport("write deadline exceeded".to_owned())),
    }
}
