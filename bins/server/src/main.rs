use anyhow::Context;
use tandem_config::TandemConfig;
use tandem_icc::{Endpoint, IpcError};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

fn main() -> anyhow::Result<()> {
    let mut config_path = None;
    let mut purge = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--purge" => purge = true,
            _ => config_path = Some(arg),
        }
    }

    let config = match config_path {
        Some(path) => {
            TandemConfig::load(&path).with_context(|| format!("loading config from {path}"))?
        }
        None => TandemConfig::default(),
    };
    init_tracing(&config.log_level);

    if purge {
        let removed = Endpoint::purge(&config.client_id, &config.server_id)
            .context("purging stale channel names")?;
        info!(removed, "purge complete");
    }

    let access = config.access();
    let mut endpoint = Endpoint::builder()
        .capacity(config.capacity)
        .liveness_interval(config.liveness_interval())
        .access(&access)
        .init(&config.client_id, &config.server_id)
        .context("initializing server endpoint (try --purge if a previous server crashed)")?;

    info!(
        client_id = %config.client_id,
        server_id = %config.server_id,
        rounds = config.rounds,
        "TANDEM SERVER: waiting for pings"
    );

    let mut buf = vec![0u8; endpoint.inbound_capacity()];
    let mut answered = 0u32;
    while answered < config.rounds {
        let n = match endpoint.receive(&mut buf, config.recv_timeout()) {
            Ok(n) => n,
            Err(IpcError::TimedOut { .. }) => continue,
            Err(IpcError::Abandoned { .. }) => {
                warn!(answered, "client went away");
                endpoint.reset().context("resetting after abandoned client")?;
                break;
            }
            Err(e) => return Err(e).context("receiving ping"),
        };

        info!(msg = %String::from_utf8_lossy(&buf[..n]), "received");
        let reply = format!("PONG {answered}");
        endpoint
            .send(reply.as_bytes(), config.send_timeout())
            .context("sending pong")?;
        answered += 1;
    }

    info!(answered, "TANDEM SERVER: done");
    Ok(())
}
