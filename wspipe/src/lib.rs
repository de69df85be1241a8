pub mod config;
pub mod error;
#[cfg(test)]
mod test_integrations;
pub mod tunnel;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::info;
use uuid::Uuid;

use crate::config::Args;
use crate::tunnel::server::{run_ingress, IngressConfig};

pub use crate::error::TunnelError;
pub use crate::tunnel::manager::ConnectionManager;
pub use crate::tunnel::options::ConnectionOptions;
pub use crate::tunnel::Role;

/// How long `/route/...` callers wait for the tunneled response.
pub const DEFAULT_ROUTE_TIMEOUT: Duration = Duration::from_secs(10);

/// Run one tunnel peer: dial the server when in client role, then serve the
/// HTTP ingress until the process is stopped.
pub async fn run(args: Args) -> anyhow::Result<()> {
    let manager = Arc::new(ConnectionManager::new(args.role, args.connection_options()));

    if args.role == Role::Client {
        let ws_url = args
            .ws_url
            .clone()
            .context("client role requires a websocket server url (-w)")?;
        let id = Uuid::new_v4().to_string();
        info!("establishing connection with url: {ws_url}/{id}");
        let ws = tunnel::client::connect(&ws_url, &id).await?;
        info!("connection established");
        manager.add_connection_to_pool(args.upstream.clone(), ws, id);
    }

    let config = IngressConfig {
        bind: SocketAddr::from(([0, 0, 0, 0], args.port)),
        upstream_base: args.upstream.clone(),
        route_timeout: DEFAULT_ROUTE_TIMEOUT,
    };
    run_ingress(manager, config).await
}
