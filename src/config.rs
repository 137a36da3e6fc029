//! Configuration for a satellite node and the surrounding daemon.

use std::time::Duration;

/// Default capacity of a response stream's delivery channel.
pub const RESPONSE_STREAM_BUFFER: usize = 100;

/// Default lifetime of a unicast request stream.
pub const RESPONSE_STREAM_LIFETIME: Duration = Duration::from_secs(10);

/// Default lifetime of a seek stream.
pub const SEEK_STREAM_LIFETIME: Duration = Duration::from_secs(10);

/// Settings for the overlay node itself.
///
/// `enable_upnp` is affirmative: when true the node requests a UDP port
/// mapping from the gateway on startup. Mapping failures are logged and
/// non-fatal.
#[derive(Clone, Debug)]
pub struct SatelliteConfig {
    pub host: String,
    pub port: u16,
    pub enable_upnp: bool,

    pub response_stream_buffer: usize,
    pub response_stream_lifetime: Duration,
    pub seek_stream_lifetime: Duration,
}

impl Default for SatelliteConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            enable_upnp: false,
            response_stream_buffer: RESPONSE_STREAM_BUFFER,
            response_stream_lifetime: RESPONSE_STREAM_LIFETIME,
            seek_stream_lifetime: SEEK_STREAM_LIFETIME,
        }
    }
}

impl SatelliteConfig {
    /// The address the node binds and advertises to peers.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Settings consumed by the `satellited` binary only.
#[derive(Clone, Debug, Default)]
pub struct DaemonConfig {
    pub dial_to: Option<String>,
    pub api_listen: Option<String>,
    pub key_path: String,
    pub generate_new_keys: bool,
    pub database_path: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = SatelliteConfig::default();
        assert_eq!(cfg.response_stream_buffer, 100);
        assert_eq!(cfg.response_stream_lifetime, Duration::from_secs(10));
        assert_eq!(cfg.seek_stream_lifetime, Duration::from_secs(10));
        assert!(!cfg.enable_upnp);
    }

    #[test]
    fn listen_addr_joins_host_and_port() {
        let cfg = SatelliteConfig {
            host: "0.0.0.0".into(),
            port: 4100,
            ..Default::default()
        };
        assert_eq!(cfg.listen_addr(), "0.0.0.0:4100");
    }
}
