//! QUIC Node
//!
//! Runs one router instance from the command line:
//! - `--listen <addr:port>` serves an echo application on every stream
//! - `--connect <addr:port>` opens one session, sends a request on the first
//!   stream and prints the reply
//!
//! SIGINT/SIGTERM close all sessions gracefully before exit.

use std::io::Write;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use quic_router::{stream_callback, Config, Router, StreamCallbacks, StreamEvent};

// ============================================================================
// Constants
// ============================================================================

/// Request sent by a dialer when no `--message` is given
const DEFAULT_MESSAGE: &str = "GET /index.html\r\n";

/// Stream read chunk
const STREAM_BUF_SIZE: usize = 65535;

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();

    // --listen <addr:port>     Serve as listener
    // --connect <addr:port>    Dial a listener
    // --cert <path>            TLS certificate (listener)
    // --key <path>             TLS private key (listener)
    // --server-name <name>     TLS SNI (dialer, defaults to the address)
    // --idle-timeout <ms>      QUIC idle timeout
    // --cc <reno|cubic|bbr>    Congestion control
    // --version <hex>          QUIC version to offer (dialer)
    // --message <text>         Request body (dialer)
    // --no-retry               Accept without a stateless retry (listener)

    let mut config = match (parse_arg(&args, "--listen"), parse_arg(&args, "--connect")) {
        (Some(endpoint), None) => {
            let (host, port) = split_endpoint(&endpoint)?;
            Config::listener(&host, port)
        }
        (None, Some(endpoint)) => {
            let (host, port) = split_endpoint(&endpoint)?;
            Config::dialer(&host, port)
        }
        _ => return Err("exactly one of --listen or --connect is required".into()),
    };

    if let (Some(cert), Some(key)) = (parse_arg(&args, "--cert"), parse_arg(&args, "--key")) {
        config = config.with_cert(cert, key);
    }
    config.server_name = parse_arg(&args, "--server-name");
    if let Some(ms) = parse_arg(&args, "--idle-timeout") {
        config.idle_timeout_ms = ms.parse().map_err(|_| "Invalid idle timeout")?;
    }
    if let Some(cc) = parse_arg(&args, "--cc") {
        config.congestion_control = cc.parse()?;
    }
    if let Some(version) = parse_arg(&args, "--version") {
        config.version = parse_version(&version)?;
    }
    if has_flag(&args, "--no-retry") {
        config.stateless_retry = false;
    }

    let callbacks = match config.role {
        quic_router::Role::Listener => echo_callbacks(),
        quic_router::Role::Dialer => {
            let message = parse_arg(&args, "--message").unwrap_or_else(|| DEFAULT_MESSAGE.into());
            request_callbacks(message.into_bytes())
        }
    };

    log::info!("QUIC node starting...");
    log::info!("  Role:     {}", config.role);
    log::info!("  Endpoint: {}:{}", config.address, config.port);
    log::info!("  CC:       {:?}", config.congestion_control);
    log::info!("  Retry:    {}", if config.stateless_retry { "enabled" } else { "disabled" });

    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))?;

    let mut router = Router::new(config, callbacks)?;
    let result = router.run_until(&shutdown);

    log::info!("Final counters:\n{}", router.metrics().render());
    Ok(result?)
}

fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

/// Split `host:port`, accepting `[v6]:port`
fn split_endpoint(endpoint: &str) -> Result<(String, u16), String> {
    let (host, port) = endpoint
        .rsplit_once(':')
        .ok_or_else(|| format!("Invalid endpoint '{}', expected host:port", endpoint))?;
    let port = port
        .parse()
        .map_err(|_| format!("Invalid port in '{}'", endpoint))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');

    if host.is_empty() {
        return Err(format!("Missing host in '{}'", endpoint));
    }
    Ok((host.to_string(), port))
}

/// Parse a version as hex (`0x` prefix optional)
fn parse_version(s: &str) -> Result<u32, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(digits, 16).map_err(|_| format!("Invalid version '{}'", s))
}

// ============================================================================
// Applications
// ============================================================================

/// Listener: echo every stream back, finishing when the peer does
fn echo_callbacks() -> StreamCallbacks {
    let on_receiving = stream_callback(|event: &mut StreamEvent<'_>| {
        let mut buf = vec![0u8; STREAM_BUF_SIZE];
        loop {
            let (len, fin) = match event.recv(&mut buf) {
                Ok(v) => v,
                Err(quic_router::Error::Engine(quiche::Error::Done)) => return Ok(()),
                Err(e) => return Err(e),
            };

            log::debug!(
                "{}: stream {} got {} bytes (fin={})",
                event.conn_id(),
                event.stream_id(),
                len,
                fin
            );
            event.send(&buf[..len], fin)?;

            if fin {
                return Ok(());
            }
        }
    });

    StreamCallbacks::new(None, Some(on_receiving))
}

/// Dialer: send `message` once established, print the reply, close on fin
fn request_callbacks(message: Vec<u8>) -> StreamCallbacks {
    let on_sending = stream_callback(move |event: &mut StreamEvent<'_>| {
        log::info!(
            "Sending {} bytes on stream {} (alpn={})",
            message.len(),
            event.stream_id(),
            String::from_utf8_lossy(event.application_proto())
        );
        event.send(&message, true)?;
        Ok(())
    });

    let on_receiving = stream_callback(|event: &mut StreamEvent<'_>| {
        let mut buf = vec![0u8; STREAM_BUF_SIZE];
        loop {
            let (len, fin) = match event.recv(&mut buf) {
                Ok(v) => v,
                Err(quic_router::Error::Engine(quiche::Error::Done)) => return Ok(()),
                Err(e) => return Err(e),
            };

            let mut stdout = std::io::stdout();
            stdout.write_all(&buf[..len])?;
            stdout.flush()?;

            if fin {
                log::info!("Response complete, closing");
                return event.close(true, 0, b"done");
            }
        }
    });

    StreamCallbacks::new(Some(on_sending), Some(on_receiving))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_arg() {
        let a = args(&["quic-node", "--listen", "127.0.0.1:4433", "--no-retry"]);
        assert_eq!(parse_arg(&a, "--listen").as_deref(), Some("127.0.0.1:4433"));
        assert_eq!(parse_arg(&a, "--connect"), None);
        // Flag without a value
        assert_eq!(parse_arg(&a, "--no-retry"), None);
        assert!(has_flag(&a, "--no-retry"));
        assert!(!has_flag(&a, "--cert"));
    }

    #[test]
    fn test_split_endpoint() {
        assert_eq!(
            split_endpoint("127.0.0.1:4433").unwrap(),
            ("127.0.0.1".to_string(), 4433)
        );
        assert_eq!(
            split_endpoint("localhost:8443").unwrap(),
            ("localhost".to_string(), 8443)
        );
        assert_eq!(split_endpoint("[::1]:4433").unwrap(), ("::1".to_string(), 4433));
        assert!(split_endpoint("127.0.0.1").is_err());
        assert!(split_endpoint(":4433").is_err());
        assert!(split_endpoint("host:notaport").is_err());
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("0xbabababa").unwrap(), 0xbaba_baba);
        assert_eq!(parse_version("1").unwrap(), 1);
        assert!(parse_version("zz").is_err());
    }
}
