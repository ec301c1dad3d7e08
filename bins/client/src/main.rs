use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use tandem_config::TandemConfig;
use tandem_icc::{Endpoint, IpcError};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

const CONNECT_DEADLINE: Duration = Duration::from_secs(5);
const CONNECT_RETRY: Duration = Duration::from_millis(50);

fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

/// Connects, giving the server a few seconds to come up.
fn connect(config: &TandemConfig) -> anyhow::Result<Endpoint> {
    let builder = Endpoint::builder().liveness_interval(config.liveness_interval());
    let deadline = Instant::now() + CONNECT_DEADLINE;
    loop {
        match builder.connect(&config.client_id, &config.server_id) {
            Ok(endpoint) => return Ok(endpoint),
            Err(IpcError::NotFound { .. }) if Instant::now() < deadline => {
                debug!("server not up yet");
                thread::sleep(CONNECT_RETRY);
            }
            Err(e) => return Err(e).context("connecting to server"),
        }
    }
}

fn main() -> anyhow::Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => {
            TandemConfig::load(&path).with_context(|| format!("loading config from {path}"))?
        }
        None => TandemConfig::default(),
    };
    init_tracing(&config.log_level);

    let mut endpoint = connect(&config)?;
    info!(capacity = endpoint.capacity(), "TANDEM CLIENT: connected");

    let mut buf = vec![0u8; endpoint.inbound_capacity()];
    let mut total = Duration::ZERO;
    for round in 0..config.rounds {
        let ping = format!("PING {round}");
        let start = Instant::now();
        endpoint
            .send(ping.as_bytes(), config.send_timeout())
            .with_context(|| format!("sending ping {round}"))?;
        let n = endpoint
            .receive(&mut buf, config.recv_timeout())
            .with_context(|| format!("waiting for pong {round}"))?;
        let rtt = start.elapsed();
        total += rtt;

        info!(reply = %String::from_utf8_lossy(&buf[..n]), ?rtt, "round trip");
    }

    if config.rounds > 0 {
        info!(rounds = config.rounds, avg = ?(total / config.rounds), "TANDEM CLIENT: done");
    }
    Ok(())
}
