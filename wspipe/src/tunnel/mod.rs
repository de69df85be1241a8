use std::fmt;
use std::str::FromStr;

pub mod client;
pub mod connection;
pub mod envelope;
pub mod http_wire;
pub mod manager;
pub mod options;
pub mod server;
pub(crate) mod upstream;

/// Which side of the tunnel this process plays. The ingress uses it to decide
/// whether the target connection id must come from the request path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "client" => Ok(Self::Client),
            "server" => Ok(Self::Server),
            _ => Err(format!("invalid role {s:?}, expected client or server")),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client => f.write_str("client"),
            Self::Server => f.write_str("server"),
        }
    }
}

/// Extract the connection id from an ingress path: the segment right after
/// the mount point, e.g. `/ws/{id}` or `/route/{id}/...`.
pub(crate) fn connection_id_from_path(path: &str) -> Option<&str> {
    path.split('/').nth(2).filter(|segment| !segment.is_empty())
}
