//! Router configuration
//!
//! Everything a routing instance needs at construction: role, endpoint,
//! TLS material (listener only) and the engine's transport parameters.

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::rc::Rc;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::{DEFAULT_APPLICATION_PROTOS, MAX_DATAGRAM_SIZE};

// ============================================================================
// Defaults
// ============================================================================

/// QUIC idle timeout in milliseconds
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 5_000;

pub const DEFAULT_INITIAL_MAX_DATA: u64 = 10_000_000;

pub const DEFAULT_INITIAL_MAX_STREAM_DATA: u64 = 1_000_000;

pub const DEFAULT_INITIAL_MAX_STREAMS: u64 = 100;

// ============================================================================
// Role / Congestion Control
// ============================================================================

/// Which side of the handshake this instance plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Bound socket serving many peers, admits new sessions
    Listener,
    /// Connected socket with exactly one session
    Dialer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Listener => f.write_str("listener"),
            Role::Dialer => f.write_str("dialer"),
        }
    }
}

/// Congestion control algorithm selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CongestionControl {
    Reno,
    Cubic,
    Bbr,
}

impl CongestionControl {
    fn algorithm(self) -> quiche::CongestionControlAlgorithm {
        match self {
            CongestionControl::Reno => quiche::CongestionControlAlgorithm::Reno,
            CongestionControl::Cubic => quiche::CongestionControlAlgorithm::CUBIC,
            CongestionControl::Bbr => quiche::CongestionControlAlgorithm::BBR,
        }
    }
}

impl FromStr for CongestionControl {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "reno" => Ok(CongestionControl::Reno),
            "cubic" => Ok(CongestionControl::Cubic),
            "bbr" => Ok(CongestionControl::Bbr),
            other => Err(Error::Config(format!(
                "unknown congestion control algorithm '{}'",
                other
            ))),
        }
    }
}

/// Sink for debug lines about admission decisions, state changes and
/// close statistics
pub type DebugLog = Rc<dyn Fn(&str)>;

// ============================================================================
// Config
// ============================================================================

/// Construction parameters of one routing instance
#[derive(Clone)]
pub struct Config {
    pub role: Role,
    /// Host name or IP to bind (listener) or connect to (dialer)
    pub address: String,
    pub port: u16,
    /// PEM certificate chain (listener only)
    pub cert_path: Option<PathBuf>,
    /// PEM private key (listener only)
    pub key_path: Option<PathBuf>,
    /// TLS server name for dialers; defaults to `address`
    pub server_name: Option<String>,
    /// QUIC version offered. A dialer may pick an unsupported one to force
    /// version negotiation.
    pub version: u32,
    /// ALPN list, in preference order
    pub application_protos: Vec<Vec<u8>>,
    pub idle_timeout_ms: u64,
    pub initial_max_data: u64,
    /// Applied to bidi-local, bidi-remote and uni streams
    pub initial_max_stream_data: u64,
    pub initial_max_streams_bidi: u64,
    pub initial_max_streams_uni: u64,
    pub congestion_control: CongestionControl,
    /// Verify the peer's certificate chain
    pub verify_peer: bool,
    /// Require a retry round trip before creating listener sessions
    pub stateless_retry: bool,
    pub debug_log: Option<DebugLog>,
}

impl Config {
    fn base(role: Role, address: &str, port: u16) -> Self {
        Config {
            role,
            address: address.to_string(),
            port,
            cert_path: None,
            key_path: None,
            server_name: None,
            version: quiche::PROTOCOL_VERSION,
            application_protos: DEFAULT_APPLICATION_PROTOS
                .iter()
                .map(|p| p.to_vec())
                .collect(),
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            initial_max_data: DEFAULT_INITIAL_MAX_DATA,
            initial_max_stream_data: DEFAULT_INITIAL_MAX_STREAM_DATA,
            initial_max_streams_bidi: DEFAULT_INITIAL_MAX_STREAMS,
            initial_max_streams_uni: DEFAULT_INITIAL_MAX_STREAMS,
            congestion_control: match role {
                Role::Listener => CongestionControl::Reno,
                Role::Dialer => CongestionControl::Cubic,
            },
            verify_peer: false,
            stateless_retry: true,
            debug_log: None,
        }
    }

    /// Listener bound to `address:port`
    pub fn listener(address: &str, port: u16) -> Self {
        Self::base(Role::Listener, address, port)
    }

    /// Dialer connecting to `address:port`
    pub fn dialer(address: &str, port: u16) -> Self {
        Self::base(Role::Dialer, address, port)
    }

    /// Set the listener's certificate chain and private key
    pub fn with_cert(mut self, cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        self.cert_path = Some(cert_path.into());
        self.key_path = Some(key_path.into());
        self
    }

    /// Resolve the configured endpoint to the first matching socket address
    pub fn resolve(&self) -> Result<SocketAddr> {
        let endpoint = format!("{}:{}", self.address, self.port);
        (self.address.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|_| Error::Resolve(endpoint.clone()))?
            .next()
            .ok_or(Error::Resolve(endpoint))
    }

    /// TLS server name presented by a dialer
    pub fn sni(&self) -> &str {
        self.server_name.as_deref().unwrap_or(&self.address)
    }

    /// Build the engine configuration for this role
    pub fn engine_config(&self) -> Result<quiche::Config> {
        let mut config = quiche::Config::new(self.version)?;

        if self.role == Role::Listener {
            match (&self.cert_path, &self.key_path) {
                (Some(cert), Some(key)) => {
                    for path in [cert, key] {
                        if !path.is_file() {
                            return Err(Error::Config(format!(
                                "{} is not a file",
                                path.display()
                            )));
                        }
                    }
                    config.load_cert_chain_from_pem_file(&path_str(cert)?)?;
                    config.load_priv_key_from_pem_file(&path_str(key)?)?;
                }
                _ => log::warn!("Listener has no certificate, handshakes will fail"),
            }
        }

        let protos: Vec<&[u8]> = self.application_protos.iter().map(Vec::as_slice).collect();
        config.set_application_protos(&protos)?;

        config.verify_peer(self.verify_peer);
        config.set_max_idle_timeout(self.idle_timeout_ms);
        config.set_max_recv_udp_payload_size(MAX_DATAGRAM_SIZE);
        config.set_max_send_udp_payload_size(MAX_DATAGRAM_SIZE);
        config.set_initial_max_data(self.initial_max_data);
        config.set_initial_max_stream_data_bidi_local(self.initial_max_stream_data);
        config.set_initial_max_stream_data_bidi_remote(self.initial_max_stream_data);
        config.set_initial_max_stream_data_uni(self.initial_max_stream_data);
        config.set_initial_max_streams_bidi(self.initial_max_streams_bidi);
        config.set_initial_max_streams_uni(self.initial_max_streams_uni);
        config.set_cc_algorithm(self.congestion_control.algorithm());

        if self.role == Role::Dialer {
            config.set_disable_active_migration(true);

            if std::env::var_os("SSLKEYLOGFILE").is_some() {
                config.log_keys();
            }
        }

        Ok(config)
    }
}

fn path_str(path: &std::path::Path) -> Result<String> {
    path.to_str()
        .map(str::to_string)
        .ok_or_else(|| Error::Config(format!("{} is not valid UTF-8", path.display())))
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("role", &self.role)
            .field("address", &self.address)
            .field("port", &self.port)
            .field("cert_path", &self.cert_path)
            .field("key_path", &self.key_path)
            .field("server_name", &self.server_name)
            .field("version", &format_args!("{:#010x}", self.version))
            .field("idle_timeout_ms", &self.idle_timeout_ms)
            .field("congestion_control", &self.congestion_control)
            .field("stateless_retry", &self.stateless_retry)
            .field("debug_log", &self.debug_log.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_defaults() {
        let listener = Config::listener("127.0.0.1", 4433);
        assert_eq!(listener.role, Role::Listener);
        assert_eq!(listener.congestion_control, CongestionControl::Reno);
        assert!(listener.stateless_retry);
        assert_eq!(listener.idle_timeout_ms, 5_000);

        let dialer = Config::dialer("localhost", 4433);
        assert_eq!(dialer.role, Role::Dialer);
        assert_eq!(dialer.congestion_control, CongestionControl::Cubic);
        assert_eq!(dialer.sni(), "localhost");
        assert_eq!(dialer.version, quiche::PROTOCOL_VERSION);
    }

    #[test]
    fn test_default_alpn_list() {
        let config = Config::listener("127.0.0.1", 4433);
        assert_eq!(
            config.application_protos,
            vec![
                b"hq-29".to_vec(),
                b"hq-28".to_vec(),
                b"hq-27".to_vec(),
                b"http/0.9".to_vec()
            ]
        );
    }

    #[test]
    fn test_parse_congestion_control() {
        assert_eq!("reno".parse::<CongestionControl>().unwrap(), CongestionControl::Reno);
        assert_eq!("CUBIC".parse::<CongestionControl>().unwrap(), CongestionControl::Cubic);
        assert_eq!("bbr".parse::<CongestionControl>().unwrap(), CongestionControl::Bbr);
        assert!("vegas".parse::<CongestionControl>().is_err());
    }

    #[test]
    fn test_resolve_ip_literal() {
        let config = Config::listener("127.0.0.1", 4433);
        assert_eq!(config.resolve().unwrap(), "127.0.0.1:4433".parse().unwrap());
    }

    #[test]
    fn test_resolve_failure() {
        let config = Config::dialer("no such host.invalid", 4433);
        assert!(matches!(config.resolve(), Err(Error::Resolve(_))));
    }

    #[test]
    fn test_missing_cert_file_is_fatal() {
        let config = Config::listener("127.0.0.1", 0)
            .with_cert("/nonexistent/cert.pem", "/nonexistent/key.pem");
        assert!(matches!(config.engine_config(), Err(Error::Config(_))));
    }

    #[test]
    fn test_dialer_engine_config_builds() {
        let config = Config::dialer("127.0.0.1", 4433);
        assert!(config.engine_config().is_ok());
    }
}
