use anyhow::{Context, Result, bail};
use axum::http::{HeaderValue, Method};
use clap::Parser;
use mailrelay_host::{Relay, RelayConfig};
use mailrelay_protocol::RELAY_PATH;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

#[derive(Parser, Debug)]
#[command(author, version, about = "mailrelay peer relay host")]
struct Args {
    #[arg(long, env = "MAILRELAY_LISTEN", default_value = "0.0.0.0:3001")]
    listen: String,
    /// WebSocket path clients connect to.
    #[arg(long, env = "MAILRELAY_PATH", default_value = RELAY_PATH)]
    path: String,
    /// Offline messages kept per recipient; the oldest is evicted beyond this.
    #[arg(long, env = "MAILRELAY_QUEUE_CAPACITY", default_value = "100")]
    queue_capacity: usize,
    /// Outbound frames buffered per connection.
    #[arg(long, env = "MAILRELAY_OUTBOUND_BUFFER", default_value = "256")]
    outbound_buffer: usize,
    #[arg(long, env = "MAILRELAY_MAX_FRAME_BYTES", default_value = "16777216")]
    max_frame_bytes: usize,
    #[arg(long, env = "MAILRELAY_SEND_TIMEOUT_MS", default_value = "10000")]
    send_timeout_ms: u64,
    /// Origins allowed to call the status API. Repeatable; `*` allows any.
    #[arg(long = "allow-origin", env = "MAILRELAY_ALLOW_ORIGIN", value_delimiter = ',', default_value = "http://localhost:5173")]
    allow_origins: Vec<String>,
}

impl Args {
    fn relay_config(&self) -> Result<RelayConfig> {
        if !self.path.starts_with('/') || self.path.trim_end_matches('/').is_empty() {
            bail!("--path must be a non-root absolute path, got {:?}", self.path);
        }
        if self.queue_capacity == 0 || self.outbound_buffer == 0 || self.max_frame_bytes == 0 {
            bail!("queue capacity, outbound buffer and max frame bytes must be > 0");
        }
        Ok(RelayConfig {
            path: self.path.clone(),
            queue_capacity: self.queue_capacity,
            outbound_buffer: self.outbound_buffer,
            max_frame_bytes: self.max_frame_bytes,
            send_timeout: Duration::from_millis(self.send_timeout_ms),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mailrelay_host=info".into()),
        )
        .init();

    let args = Args::parse();
    let addr: SocketAddr = args
        .listen
        .parse()
        .with_context(|| format!("invalid --listen {}", args.listen))?;
    let config = args.relay_config()?;
    let cors = build_cors(&args.allow_origins)?;

    let relay = Arc::new(Relay::new(config.clone()));
    let app = mailrelay_host::app(relay).layer(cors);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    let local_addr = listener.local_addr()?;
    tracing::info!(
        "mailrelay-host listening addr={local_addr} path={} queue_capacity={} outbound_buffer={}",
        config.path,
        config.queue_capacity,
        config.outbound_buffer,
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await
        .context("relay server failed")?;

    Ok(())
}

fn build_cors(origins: &[String]) -> Result<CorsLayer> {
    if origins.iter().any(|o| o == "*") {
        return Ok(CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::OPTIONS])
            .allow_headers(Any));
    }

    let mut headers = Vec::with_capacity(origins.len());
    for origin in origins {
        headers.push(
            HeaderValue::from_str(origin)
                .with_context(|| format!("invalid --allow-origin value: {origin}"))?,
        );
    }

    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(headers))
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_produce_valid_config() {
        let args = Args::parse_from(["mailrelay-host"]);
        let config = args.relay_config().unwrap();
        assert_eq!(config.path, "/api/p2p");
        assert_eq!(config.queue_capacity, 100);
        assert_eq!(config.send_timeout, Duration::from_secs(10));
    }

    #[test]
    fn rejects_root_path_and_zero_capacity() {
        let args = Args::parse_from(["mailrelay-host", "--path", "/"]);
        assert!(args.relay_config().is_err());
        let args = Args::parse_from(["mailrelay-host", "--queue-capacity", "0"]);
        assert!(args.relay_config().is_err());
    }

    #[test]
    fn cors_accepts_wildcard_and_lists() {
        assert!(build_cors(&["*".to_string()]).is_ok());
        assert!(build_cors(&["http://localhost:5173".to_string()]).is_ok());
        assert!(build_cors(&["bad\norigin".to_string()]).is_err());
    }
}
