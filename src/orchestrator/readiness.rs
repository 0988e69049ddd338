//! Post-spawn settling: wait until a new server can take connections.

use std::net::SocketAddr;

use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::{ReadinessConfig, ReadinessMode};
use crate::{AppError, Result};

/// Block until the server on `port` is considered reachable.
///
/// In `delay` mode this sleeps for the configured settle time. In
/// `probe` mode it retries a TCP connect until one succeeds.
///
/// # Errors
///
/// Returns `AppError::Spawn` if probing does not succeed before the timeout.
pub async fn wait_until_ready(config: &ReadinessConfig, port: u16) -> Result<()> {
    match config.mode {
        ReadinessMode::Delay => {
            tokio::time::sleep(config.settle()).await;
            Ok(())
        }
        ReadinessMode::Probe => probe(config, SocketAddr::new(config.probe_host, port)).await,
    }
}

async fn probe(config: &ReadinessConfig, addr: SocketAddr) -> Result<()> {
    let start = Instant::now();
    let deadline = start + config.timeout();
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        match TcpStream::connect(addr).await {
            Ok(_) => {
                info!(%addr, attempts, elapsed = ?start.elapsed(), "session server ready");
                return Ok(());
            }
            Err(err) => {
                debug!(%addr, attempts, %err, "session server not ready yet");
            }
        }

        if Instant::now() + config.poll_interval() > deadline {
            return Err(AppError::Spawn(format!(
                "server on {addr} not reachable after {}s ({attempts} attempts)",
                config.timeout_seconds
            )));
        }
        tokio::time::sleep(config.poll_interval()).await;
    }
}
