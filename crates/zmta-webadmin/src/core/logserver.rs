use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{UdpSocket, lookup_host};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use zmta_proto::MAX_DATAGRAM_BYTES;

use super::ingest::IngestSink;
use super::store::EventStore;
use crate::config::{DatagramProtocol, LogServerConfig};

/// Datagrams handled concurrently before the receive loop waits.
const MAX_INFLIGHT: usize = 256;

/// Binds the delivery log socket. A bind failure is fatal for the service.
pub async fn bind_logserver(config: &LogServerConfig) -> Result<UdpSocket> {
    let address = resolve_bind_address(config).await?;
    let socket = UdpSocket::bind(address)
        .await
        .with_context(|| format!("failed to bind udp log server on {address}"))?;

    info!(
        "log server listening: protocol={:?}, address={}",
        config.protocol,
        socket.local_addr().unwrap_or(address)
    );
    Ok(socket)
}

async fn resolve_bind_address(config: &LogServerConfig) -> Result<SocketAddr> {
    let candidates = lookup_host((config.host.as_str(), config.port))
        .await
        .with_context(|| format!("failed to resolve log server host {}", config.host))?;

    let mut candidates = candidates.filter(|address| match config.protocol {
        DatagramProtocol::Udp4 => address.is_ipv4(),
        DatagramProtocol::Udp6 => address.is_ipv6(),
    });

    candidates.next().with_context(|| {
        format!(
            "log server host {} has no {:?} address",
            config.host, config.protocol
        )
    })
}

/// Receives datagrams until `shutdown` is cancelled and hands each one to the
/// ingest sink on its own task.
///
/// Receive errors are logged and the loop keeps going; nothing is ever sent
/// back to the peer.
pub async fn run_logserver<S: EventStore>(
    socket: UdpSocket,
    sink: Arc<IngestSink<S>>,
    shutdown: CancellationToken
) {
    let permits = Arc::new(Semaphore::new(MAX_INFLIGHT));
    let mut buf = vec![0u8; MAX_DATAGRAM_BYTES];

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("log server stopping");
                break;
            }
            received = socket.recv_from(&mut buf) => {
                let (len, peer) = match received {
                    Ok(received) => received,
                    Err(err) => {
                        warn!("log server receive failed: error={err}");
                        continue;
                    }
                };

                let Ok(permit) = permits.clone().acquire_owned().await else {
                    break;
                };
                let payload = buf[..len].to_vec();
                let sink = sink.clone();
                tokio::spawn(async move {
                    sink.ingest(&payload, peer).await;
                    drop(permit);
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use zmta_proto::{Action, WireEvent, encode_event};

    use super::*;
    use crate::core::store::memory::MemoryStore;

    fn loopback_config() -> LogServerConfig {
        LogServerConfig {
            enabled: true,
            protocol: DatagramProtocol::Udp4,
            host: "127.0.0.1".to_string(),
            port: 0,
        }
    }

    async fn wait_for_events(
        store: &MemoryStore,
        count: usize
    ) {
        for _ in 0..100 {
            if store.events().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn datagrams_are_ingested_and_garbage_is_ignored() {
        let store = Arc::new(MemoryStore::default());
        let sink = Arc::new(IngestSink::new(store.clone(), Duration::from_secs(60)));
        let socket = bind_logserver(&loopback_config()).await.unwrap();
        let address = socket.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(run_logserver(socket, sink, shutdown.clone()));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"\xc1not msgpack", address).await.unwrap();
        let payload = encode_event(
            &WireEvent::new("ab12cd34ef56gh78ij")
                .with_action(Action::Queued)
                .with_field("message-id", "<m@x>"),
        )
        .unwrap();
        client.send_to(&payload, address).await.unwrap();

        wait_for_events(&store, 1).await;
        assert_eq!(store.events().len(), 1);
        assert_eq!(store.index_rows().len(), 1);

        shutdown.cancel();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn ipv6_host_does_not_resolve_for_udp4() {
        let config = LogServerConfig {
            host: "::1".to_string(),
            ..loopback_config()
        };
        assert!(bind_logserver(&config).await.is_err());
    }
}
