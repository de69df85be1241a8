use std::time::Duration;

use url::Url;

use crate::tunnel::options::ConnectionOptions;
use crate::tunnel::Role;

/// Process arguments shared by both roles.
///
/// With the `clap` feature the struct doubles as the CLI parser.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "clap", derive(clap::Parser))]
#[cfg_attr(
    feature = "clap",
    command(author, version, about = "HTTP-over-WebSocket reverse tunnel", long_about = None)
)]
pub struct Args {
    /// Upstream HTTP base URL tunneled requests are replayed against
    #[cfg_attr(
        feature = "clap",
        arg(short = 's', long = "upstream", value_name = "URL", default_value = "http://localhost:9222")
    )]
    pub upstream: Url,

    /// Local listen port for the HTTP ingress
    #[cfg_attr(
        feature = "clap",
        arg(short = 'p', long = "port", value_name = "PORT", default_value_t = 8082)
    )]
    pub port: u16,

    /// Peer role
    #[cfg_attr(
        feature = "clap",
        arg(short = 'r', long = "role", value_name = "client|server", default_value = "client")
    )]
    pub role: Role,

    /// WebSocket server URL to dial (client role only)
    #[cfg_attr(feature = "clap", arg(short = 'w', long = "ws-url", value_name = "URL"))]
    pub ws_url: Option<Url>,

    /// Verbose logging
    #[cfg_attr(
        feature = "clap",
        arg(
            long,
            value_name = "BOOL",
            default_value_t = true,
            action = clap::ArgAction::Set,
            num_args = 0..=1,
            default_missing_value = "true"
        )
    )]
    pub debug: bool,

    /// Per-frame write deadline window
    #[cfg_attr(
        feature = "clap",
        arg(long, value_name = "DURATION(s)", default_value = "10", value_parser = parsers::parse_duration_sec)
    )]
    pub write_timeout: Duration,

    /// Read-idle window; a peer silent for longer is torn down
    #[cfg_attr(
        feature = "clap",
        arg(long, value_name = "DURATION(s)", default_value = "60", value_parser = parsers::parse_duration_sec)
    )]
    pub pong_timeout: Duration,

    /// Interval between keepalive pings. Must stay below the pong timeout
    #[cfg_attr(
        feature = "clap",
        arg(long, value_name = "DURATION(s)", default_value = "54", value_parser = parsers::parse_duration_sec)
    )]
    pub ping_frequency: Duration,

    /// Upper bound on inbound WebSocket frame size in bytes
    #[cfg_attr(
        feature = "clap",
        arg(long, value_name = "BYTES", default_value_t = 512)
    )]
    pub max_frame_size: usize,
}

impl Args {
    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions::default()
            .with_write_wait(self.write_timeout)
            .with_pong_wait(self.pong_timeout)
            .with_ping_period(self.ping_frequency)
            .with_max_message_size(self.max_frame_size)
    }
}

#[cfg(feature = "clap")]
mod parsers {
    use std::time::Duration;

    pub fn parse_duration_sec(arg: &str) -> Result<Duration, std::num::ParseIntError> {
        Ok(Duration::from_secs(arg.parse()?))
    }
}
