//! TCP trigger listener.
//!
//! Each chunk received on a connection is one trigger. The text is matched
//! to a camera and handed to the dispatcher, which must not block.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use camsync_common::{CameraId, UnmappedTriggerPolicy};

const READ_BUFFER: usize = 4096;
/// Idle connections are closed after this long without data.
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Decode one received chunk. Blank input is ignored.
pub fn parse_trigger(
    chunk: &[u8],
    policy: UnmappedTriggerPolicy,
) -> Option<camsync_common::Result<CameraId>> {
    let text = String::from_utf8_lossy(chunk);
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    Some(policy.resolve(text))
}

pub struct TriggerListener {
    listener: TcpListener,
    policy: UnmappedTriggerPolicy,
}

impl TriggerListener {
    pub async fn bind(addr: &str, policy: UnmappedTriggerPolicy) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind trigger listener on {}", addr))?;
        Ok(Self { listener, policy })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` flips to true.
    pub async fn run<F>(self, dispatch: F, mut shutdown: watch::Receiver<bool>)
    where
        F: Fn(CameraId) + Clone + Send + Sync + 'static,
    {
        if let Ok(addr) = self.listener.local_addr() {
            info!("Trigger listener on {}", addr);
        }

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let dispatch = dispatch.clone();
                        let policy = self.policy;
                        tokio::spawn(async move {
                            handle_connection(stream, peer, policy, dispatch).await;
                        });
                    }
                    Err(e) => error!("Failed to accept trigger connection: {}", e),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Trigger listener shutting down");
                        break;
                    }
                }
            }
        }
    }
}

async fn handle_connection<F>(
    mut stream: TcpStream,
    peer: SocketAddr,
    policy: UnmappedTriggerPolicy,
    dispatch: F,
) where
    F: Fn(CameraId),
{
    info!("Trigger connection from {}", peer);
    let mut buf = vec![0u8; READ_BUFFER];

    loop {
        let read = match timeout(IDLE_TIMEOUT, stream.read(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                warn!("Trigger connection from {} failed: {}", peer, e);
                break;
            }
            Err(_) => {
                debug!("Trigger connection from {} idle, closing", peer);
                break;
            }
        };

        match parse_trigger(&buf[..read], policy) {
            Some(Ok(camera)) => {
                info!("Trigger from {} for {}", peer, camera);
                dispatch(camera);
            }
            Some(Err(e)) => warn!("Ignoring trigger from {}: {}", peer, e),
            None => {}
        }
    }

    info!("Trigger connection from {} closed", peer);
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tokio::io::AsyncWriteExt;
    use tokio::sync::mpsc;

    #[test]
    fn test_parse_trigger() {
        let reject = UnmappedTriggerPolicy::Reject;
        assert_eq!(parse_trigger(b"camera_1\n", reject).unwrap().unwrap(), CameraId::Camera1);
        assert_eq!(parse_trigger(b"RFID_2", reject).unwrap().unwrap(), CameraId::Camera2);
        assert!(parse_trigger(b"  \r\n", reject).is_none());
        assert!(parse_trigger(b"door opened", reject).unwrap().is_err());

        let lenient = UnmappedTriggerPolicy::DefaultTo(CameraId::Camera1);
        assert_eq!(
            parse_trigger(b"door opened", lenient).unwrap().unwrap(),
            CameraId::Camera1
        );
    }

    proptest! {
        #[test]
        fn prop_parse_never_panics(chunk in proptest::collection::vec(any::<u8>(), 0..64)) {
            let _ = parse_trigger(&chunk, UnmappedTriggerPolicy::Reject);
        }

        #[test]
        fn prop_keyword_anywhere_selects_camera(prefix in "[a-z ]{0,10}", suffix in "[a-z ]{0,10}") {
            let text = format!("{}rfid_2{}", prefix, suffix);
            prop_assume!(!text.contains("camera_1") && !text.contains("rfid_1"));
            let camera = parse_trigger(text.as_bytes(), UnmappedTriggerPolicy::Reject);
            prop_assert_eq!(camera.unwrap().unwrap(), CameraId::Camera2);
        }
    }

    #[tokio::test]
    async fn test_listener_dispatches_triggers() {
        let listener = TriggerListener::bind("127.0.0.1:0", UnmappedTriggerPolicy::Reject)
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(listener.run(
            move |camera| {
                let _ = tx.send(camera);
            },
            shutdown_rx,
        ));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"rfid_2").await.unwrap();
        assert_eq!(rx.recv().await, Some(CameraId::Camera2));

        client.write_all(b"garbage").await.unwrap();
        client.write_all(b"camera_1").await.unwrap();
        // Chunks may coalesce; camera_1 wins whenever it is present.
        assert_eq!(rx.recv().await, Some(CameraId::Camera1));

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
