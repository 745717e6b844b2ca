//! Band-Power Ingest - datagram listener feeding the shared state
//!
//! Each datagram is decoded and applied with constant work. Malformed or
//! unrecognised datagrams are dropped; nothing here publishes.

use crate::osc;
use crate::shutdown::ShutdownListener;
use crate::state::SessionState;
use crate::types::{Band, Reading};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

/// Apply one reading to the shared state.
pub fn apply_reading(state: &SessionState, reading: &Reading) {
    match reading {
        Reading::Band { band, channels } => {
            if *band == Band::Alpha {
                match reading.alpha_scalar() {
                    Some(alpha) if alpha.is_finite() => state.push_alpha(alpha),
                    Some(alpha) => log::debug!("Skipping non-finite alpha sample {}", alpha),
                    None => {}
                }
            }
            state.set_band(*band, channels);
        }
        Reading::Blink => {
            state.increment_blink();
        }
        // Reserved for motion-based artefact rejection.
        Reading::Accelerometer => {}
    }
}

/// Decode and apply a raw datagram. Returns whether a reading was applied.
pub fn handle_datagram(state: &SessionState, dgram: &[u8]) -> bool {
    match osc::decode_reading(dgram) {
        Ok(Some(reading)) => {
            log::debug!("{:?}", reading);
            apply_reading(state, &reading);
            true
        }
        Ok(None) => false,
        Err(e) => {
            log::debug!("Dropping malformed datagram ({} bytes): {}", dgram.len(), e);
            false
        }
    }
}

pub async fn bind(addr: SocketAddr) -> Result<UdpSocket> {
    let sock = UdpSocket::bind(addr)
        .await
        .with_context(|| format!("binding band-power listener on {addr}"))?;
    log::info!("Band-power listener bound on {}", sock.local_addr()?);
    Ok(sock)
}

/// Receive datagrams until shutdown.
pub fn spawn_listener(sock: UdpSocket, state: Arc<SessionState>, mut shutdown: ShutdownListener) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        loop {
            let received = match shutdown.or_cancel(sock.recv_from(&mut buf)).await {
                None => break,
                Some(r) => r,
            };
            let (len, _src) = match received {
                Ok(v) => v,
                Err(e) => {
                    log::warn!("Band-power recv error: {e}");
                    continue;
                }
            };
            handle_datagram(&state, &buf[..len]);
        }
        log::debug!("Band-power listener stopped");
    })
}
