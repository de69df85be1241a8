//! Named registry of live connections and the routing API the ingress uses.

use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use fastwebsockets::WebSocket;
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use tracing::info;
use url::Url;

use crate::error::TunnelError;
use crate::tunnel::connection::{self, ConnectionInstance, ResponseReceiver};
use crate::tunnel::envelope::Envelope;
use crate::tunnel::http_wire::{WireRequest, WireResponse};
use crate::tunnel::options::ConnectionOptions;
use crate::tunnel::Role;

pub struct ConnectionManager {
    role: Role,
    options: ConnectionOptions,
    connections: Arc<Mutex<AHashMap<String, Arc<ConnectionInstance>>>>,
}

impl ConnectionManager {
    pub fn new(role: Role, options: ConnectionOptions) -> Self {
        Self {
            role,
            options,
            connections: Arc::new(Mutex::new(AHashMap::new())),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Wrap a freshly upgraded socket into a connection instance, register it
    /// under `id` and start its pumps. The instance unregisters itself when
    /// its reader exits.
    pub fn add_connection_to_pool(
        &self,
        upstream_base: Url,
        ws: WebSocket<TokioIo<Upgraded>>,
        id: String,
    ) {
        let (ws_rx, ws_tx) = connection::split_socket(ws, &self.options);

        let registry = Arc::downgrade(&self.connections);
        let key = id.clone();
        let unregister = Box::new(move || {
            if let Some(registry) = registry.upgrade() {
                registry.lock().remove(&key);
                info!("connection [{key}] unregistered");
            }
        });

        let instance = ConnectionInstance::new(
            id.clone(),
            upstream_base,
            ws_rx,
            ws_tx,
            self.options,
            unregister,
        );
        self.connections.lock().insert(id, instance.clone());
        instance.start();
    }

    /// Tunnel `request` over the selected connection and wait up to
    /// `max_wait` for the peer's response.
    pub async fn send_request(
        &self,
        request: &WireRequest,
        id: Option<&str>,
        max_wait: Duration,
    ) -> Result<WireResponse, TunnelError> {
        let connection = self.pick(id)?;
        let envelope = Envelope::request(request);
        connection.send_request(&envelope, max_wait).await
    }

    /// Fire-and-forget variant returning the response slot.
    pub fn send_request_async(
        &self,
        request: &WireRequest,
        id: Option<&str>,
    ) -> Result<ResponseReceiver, TunnelError> {
        let connection = self.pick(id)?;
        let envelope = Envelope::request(request);
        connection.send_request_async(&envelope)
    }

    /// Exact lookup when an id is given; any registered connection otherwise
    /// (the registry is unordered, the pick is arbitrary).
    fn pick(&self, id: Option<&str>) -> Result<Arc<ConnectionInstance>, TunnelError> {
        let connections = self.connections.lock();
        let instance = match id {
            Some(id) => connections.get(id).cloned(),
            None => connections.values().next().cloned(),
        };
        instance.ok_or_else(|| TunnelError::ConnectionNotFound {
            id: id.map(str::to_owned),
        })
    }

    #[cfg(test)]
    pub(crate) fn get(&self, id: &str) -> Option<Arc<ConnectionInstance>> {
        self.connections.lock().get(id).cloned()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.connections.lock().len()
    }
}
