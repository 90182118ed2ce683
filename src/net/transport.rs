//! Per-network transport: connect, handshake, and the read loop that
//! drives dispatch, cross-task ops, and the heartbeat.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{error, info, warn};

use netlink_proto::{LineCodec, ProtoError};

use crate::config::{DaemonConfig, NetworkConfig};
use crate::error::ProtocolError;
use crate::hooks::HookBus;
use crate::net::{NetOp, Network, NetworkHandle, NETWORKS};
use crate::protocols::{common, new_dialect, Dialect};

/// Start a network's event loop and register its handle.
pub fn spawn_network(
    name: &str,
    conf: NetworkConfig,
    daemon: DaemonConfig,
    hooks: HookBus,
) -> NetworkHandle {
    let (tx, rx) = mpsc::channel(256);
    let handle = NetworkHandle::new(name, tx);
    NETWORKS.insert(name.to_string(), handle.clone());

    let name = name.to_string();
    tokio::spawn(async move {
        run_network(name, conf, daemon, hooks, rx).await;
    });
    handle
}

/// Drain the network's send queue onto the socket, urgent lines first.
async fn flush_out(
    net: &mut Network,
    framed: &mut Framed<TcpStream, LineCodec>,
) -> Result<(), ProtoError> {
    for line in net.out.drain() {
        framed.send(line).await?;
    }
    Ok(())
}

/// The connect/dispatch/reconnect loop for one uplink. Everything the
/// network owns is touched only from this task.
async fn run_network(
    name: String,
    conf: NetworkConfig,
    daemon: DaemonConfig,
    hooks: HookBus,
    mut rx: mpsc::Receiver<NetOp>,
) {
    let mut net = Network::new(&name, conf, daemon);
    net.hooks = hooks;
    let mut dialect = new_dialect(net.conf.protocol);
    let reconnect = Duration::from_secs(net.conf.autoconnect.max(1));

    loop {
        let addr = format!("{}:{}", net.conf.ip, net.conf.port);
        info!(net = %name, addr = %addr, protocol = %net.conf.protocol, "connecting to uplink");

        let stream = match TcpStream::connect(&addr).await {
            Ok(stream) => stream,
            Err(e) => {
                error!(net = %name, addr = %addr, error = %e, "connection failed");
                tokio::time::sleep(reconnect).await;
                continue;
            }
        };
        let mut framed = Framed::new(stream, LineCodec::new(net.conf.permissive_decode));

        net.lastping = chrono::Utc::now().timestamp();
        if let Err(e) = dialect.post_connect(&mut net) {
            error!(net = %name, error = %e, "handshake setup failed");
            tokio::time::sleep(reconnect).await;
            continue;
        }
        if let Err(e) = flush_out(&mut net, &mut framed).await {
            error!(net = %name, error = %e, "failed to send handshake");
            tokio::time::sleep(reconnect).await;
            continue;
        }

        let pingfreq = net.conf.pingfreq.max(10);
        let mut ping_timer = tokio::time::interval(Duration::from_secs(pingfreq));
        ping_timer.tick().await; // The first tick fires immediately.

        let result = drive(&mut net, dialect.as_mut(), &mut framed, &mut rx, &mut ping_timer, pingfreq).await;

        match &result {
            Err(e) => {
                error!(net = %name, error = %e, code = e.error_code(), "link failed")
            }
            Ok(()) => info!(net = %name, "connection closed by uplink"),
        }

        disconnect_cleanup(&mut net);
        info!(net = %name, delay = reconnect.as_secs(), "scheduling reconnect");
        tokio::time::sleep(reconnect).await;
    }
}

/// One connection's dispatch loop. Returns `Ok` on orderly EOF and the
/// fatal [`ProtocolError`] otherwise.
async fn drive(
    net: &mut Network,
    dialect: &mut dyn Dialect,
    framed: &mut Framed<TcpStream, LineCodec>,
    rx: &mut mpsc::Receiver<NetOp>,
    ping_timer: &mut tokio::time::Interval,
    pingfreq: u64,
) -> Result<(), ProtocolError> {
    loop {
        tokio::select! {
            line = framed.next() => match line {
                Some(Ok(line)) => {
                    common::process_line(net, dialect, &line)?;
                    if flush_out(net, framed).await.is_err() {
                        return Ok(());
                    }
                }
                Some(Err(e)) => {
                    // Framing errors (oversized or undecodable lines)
                    // drop the line, not the link.
                    warn!(net = %net.name, error = %e, "dropping undecodable line");
                }
                None => return Ok(()),
            },
            Some(op) = rx.recv() => {
                match op {
                    NetOp::Call(f) => f(net, &mut *dialect),
                }
                if flush_out(net, framed).await.is_err() {
                    return Ok(());
                }
            }
            _ = ping_timer.tick() => {
                let now = chrono::Utc::now().timestamp();
                let timeout = (pingfreq * 2) as i64;
                if now - net.lastping > timeout {
                    return Err(ProtocolError::PingTimeout(pingfreq * 2));
                }
                dialect.ping_uplink(net);
                if flush_out(net, framed).await.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

/// Tear down link state after a disconnect: publish the netsplit for
/// everything behind the uplink, then reset to a clean slate. Pending
/// writes are cancelled with the queue.
fn disconnect_cleanup(net: &mut Network) {
    if let Some(uplink) = net.uplink.take() {
        if uplink != net.sid {
            match common::squit(net, &uplink, "Uplink connection lost") {
                Ok(Some(data)) => {
                    let own = net.sid.clone();
                    let payload = serde_json::to_value(&data).unwrap_or(serde_json::Value::Null);
                    net.call_hooks(&own, "SQUIT", payload);
                }
                Ok(None) => {}
                Err(e) => warn!(net = %net.name, error = %e, "netsplit cleanup error"),
            }
        }
    }
    net.reset_state();
}
