//! Client-side `russh` handler for dialed-out agent connections.
//!
//! Grounded on the teacher's `russh::server::Handler` implementation
//! (`ssh/handler_impl.rs`), flipped to the client half of the same crate:
//! `check_server_key` replaces `auth_publickey` as the one callback this
//! subsystem cares about, since authentication here is driven by us (the
//! client) rather than accepted from a peer.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use log::warn;
use russh::keys::PublicKey;
use russh::{Channel, ChannelId, Msg};
use russh_keys::HashAlg;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};

/// A local bridge target for a forwarded remote port, paired with the
/// owning `RunningTunnel`'s byte counter so the remote→local direction is
/// counted the same way `tunnel::manager::bridge_one_connection` counts
/// the local→remote direction.
#[derive(Clone)]
pub struct ForwardTarget {
    pub addr: SocketAddr,
    pub bytes: Arc<AtomicU64>,
}

/// Maps a forwarded remote port to the local bridge target a
/// `forwarded-tcpip` channel for that port should be bridged to. Populated
/// by `TunnelManager` before requesting `tcpip-forward` on a given port.
pub type ForwardTargets = Arc<RwLock<HashMap<u16, ForwardTarget>>>;

/// Trust-on-first-use host key policy: the first key seen for an instance
/// is accepted and remembered in memory; a later mismatch is logged but
/// not rejected (see SPEC_FULL.md Open Question on host-key pinning —
/// persistence across restarts is left to the embedding binary).
#[derive(Clone)]
pub struct FleetClientHandler {
    instance: String,
    seen_host_keys: Arc<Mutex<HashMap<String, String>>>,
    forward_targets: ForwardTargets,
}

impl FleetClientHandler {
    pub fn new(
        instance: String,
        seen_host_keys: Arc<Mutex<HashMap<String, String>>>,
        forward_targets: ForwardTargets,
    ) -> Self {
        Self {
            instance,
            seen_host_keys,
            forward_targets,
        }
    }
}

#[async_trait]
impl russh::client::Handler for FleetClientHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint(HashAlg::Sha256).to_string();
        let mut seen = self.seen_host_keys.lock().await;
        match seen.get(&self.instance) {
            Some(known) if known != &fingerprint => {
                warn!(
                    "host key for {} changed: was {known}, now {fingerprint}",
                    self.instance
                );
            }
            Some(_) => {}
            None => {
                seen.insert(self.instance.clone(), fingerprint);
            }
        }
        Ok(true)
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        session: &mut russh::client::Session,
    ) -> Result<(), Self::Error> {
        session.close(channel);
        Ok(())
    }

    /// Bridges an inbound `forwarded-tcpip` channel (opened by the agent
    /// in response to our earlier `tcpip-forward` request) to whichever
    /// local address `TunnelManager` registered for `connected_port`.
    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        _connected_address: &str,
        connected_port: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut russh::client::Session,
    ) -> Result<(), Self::Error> {
        let target = self
            .forward_targets
            .read()
            .await
            .get(&(connected_port as u16))
            .cloned();

        let Some(target) = target else {
            warn!("no forward target registered for port {connected_port}");
            return Ok(());
        };

        tokio::spawn(async move {
            let Ok(mut tcp) = TcpStream::connect(target.addr).await else {
                warn!("failed to dial forward target {}", target.addr);
                return;
            };
            let mut stream = channel.into_stream();
            if let Ok((from_remote, from_local)) =
                tokio::io::copy_bidirectional(&mut stream, &mut tcp).await
            {
                target.bytes.fetch_add(from_remote + from_local, Ordering::Relaxed);
            }
        });
        Ok(())
    }
}
