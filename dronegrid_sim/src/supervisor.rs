//! Supervisor process body: the heartbeat detector plus the exit watch.

use crate::wiring::LinkSpec;

use anyhow::{Context, Result};
use dronegrid_core::{
    frame_reader, frame_writer, ControlLinks, DetectorConfig, DetectorOutcome, FrameReader, HeartbeatDetector,
    Message,
};
use dronegrid_env::{ChannelFd, GridContext, GroupKill, Registry};
use futures::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Cancels `token` when the coordinator announces a clean quit.
///
/// End of stream without EXIT leaves the token alone: a coordinator that
/// vanished is the detector's business.
pub async fn watch_for_exit(mut rx: FrameReader, token: CancellationToken) -> bool {
    while let Some(next) = rx.next().await {
        let frame = match next {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Exit channel framing error: {}", e);
                return false;
            }
        };
        match frame.into_message() {
            Ok(Message::Exit) => {
                info!("Coordinator requested shutdown");
                token.cancel();
                return true;
            }
            Ok(other) => debug!(kind = %other.kind(), "Ignoring frame on exit channel"),
            Err(e) => debug!("Dropping unreadable frame on exit channel: {}", e),
        }
    }
    debug!("Exit channel closed without EXIT");
    false
}

/// Adopts the inherited control channels.
pub fn control_links(specs: &[LinkSpec]) -> Result<ControlLinks> {
    let mut links = ControlLinks::new();
    for spec in specs {
        let (Some(rx), Some(tx)) = (spec.rx, spec.tx) else {
            anyhow::bail!("control link {} needs both directions", spec);
        };
        let reader = frame_reader(rx.into_reader().with_context(|| format!("control rx for {}", spec.role))?);
        let writer = frame_writer(tx.into_writer().with_context(|| format!("control tx for {}", spec.role))?);
        links = links.with(spec.role, writer, reader);
    }
    Ok(links)
}

/// Runs the detector until the coordinator quits or a participant fails.
pub async fn run_supervisor<Ctx: GridContext>(
    ctx: Arc<Ctx>,
    registry: Arc<dyn Registry>,
    killer: Arc<dyn GroupKill>,
    controls: &[LinkSpec],
    exit_rx: Option<ChannelFd>,
    config: DetectorConfig,
) -> Result<DetectorOutcome> {
    let links = control_links(controls)?;
    info!(monitored = ?links.roles().collect::<Vec<_>>(), "Supervisor starting");

    let token = CancellationToken::new();
    let watcher = match exit_rx {
        Some(fd) => {
            let rx = frame_reader(fd.into_reader().context("adopting exit channel")?);
            Some(tokio::spawn(watch_for_exit(rx, token.clone())))
        }
        None => {
            warn!("No exit channel; only a failure stops the supervisor");
            None
        }
    };

    let detector = HeartbeatDetector::new(ctx, registry, links, killer, config);
    let outcome = detector.run(token).await.context("detector failed")?;
    if let Some(handle) = watcher {
        handle.abort();
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dronegrid_core::FrameWriter;
    use futures::SinkExt;

    fn exit_channel() -> (FrameWriter, FrameReader) {
        let (tx, rx) = tokio::io::duplex(1024);
        (frame_writer(tx), frame_reader(rx))
    }

    #[tokio::test]
    async fn test_exit_cancels_token() {
        let (mut tx, rx) = exit_channel();
        let token = CancellationToken::new();
        let handle = tokio::spawn(watch_for_exit(rx, token.clone()));

        tx.send(Message::Input('f')).await.unwrap();
        tx.send(Message::Exit).await.unwrap();
        assert!(handle.await.unwrap());
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_hangup_does_not_cancel() {
        let (tx, rx) = exit_channel();
        let token = CancellationToken::new();
        drop(tx);
        assert!(!watch_for_exit(rx, token.clone()).await);
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_half_control_link_rejected() {
        let spec: LinkSpec = "physics:5:-".parse().unwrap();
        assert!(control_links(&[spec]).is_err());
    }
}
