//! camcast client: subscribes to a server and saves the stream.
//!
//! Usage: `camcast-client <server-addr> [output-file]`

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use camcast::init_logging;
use camcast_transport::{ControlMessage, MAX_UDP_PAYLOAD};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

const DEFAULT_OUTPUT: &str = "stream.h264";
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    init_logging();

    let mut args = std::env::args().skip(1);
    let Some(target) = args.next() else {
        bail!("usage: camcast-client <server-addr> [output-file]");
    };
    let output = PathBuf::from(args.next().unwrap_or_else(|| DEFAULT_OUTPUT.to_string()));

    let server = tokio::net::lookup_host(&target)
        .await
        .with_context(|| format!("Failed to resolve {target}"))?
        .next()
        .with_context(|| format!("No address for {target}"))?;

    let local: SocketAddr = if server.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(local).await.context("Failed to bind client socket")?;
    let mut file = File::create(&output)
        .await
        .with_context(|| format!("Failed to create {}", output.display()))?;

    info!(server = %server, output = %output.display(), "Subscribing");

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
    let mut buf = vec![0u8; MAX_UDP_PAYLOAD];
    let mut last_data: Option<Instant> = None;
    let mut total: u64 = 0;

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = keepalive.tick() => {
                // Re-join when the server has gone quiet; it may have evicted us.
                let message = match last_data {
                    Some(at) if at.elapsed() < KEEPALIVE_INTERVAL * 2 => ControlMessage::Ping,
                    _ => ControlMessage::Login,
                };
                if let Err(e) = socket.send_to(message.as_bytes(), server).await {
                    warn!(error = %e, ?message, "Keep-alive send failed");
                }
            }
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, from)) if from == server => {
                    file.write_all(&buf[..len]).await?;
                    total += len as u64;
                    last_data = Some(Instant::now());
                }
                Ok((_, from)) => debug!(peer = %from, "Ignoring datagram from unexpected peer"),
                Err(e) => warn!(error = %e, "Receive failed"),
            },
        }
    }

    file.flush().await?;
    info!(bytes = total, output = %output.display(), "Stream saved");
    Ok(())
}
