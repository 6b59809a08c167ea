use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use shared::domain::UserId;
use tracing::debug;
use url::Url;

use crate::ports::PresenceOracle;

const PEER_TIMEOUT: Duration = Duration::from_millis(500);

/// Body of `GET /presence/{user_id}` on a peer process.
#[derive(Debug, Deserialize)]
struct PresenceReply {
    online: bool,
}

/// Asks the other processes of the deployment whether they hold a live
/// connection for a user. Unreachable peers count as "not there".
#[derive(Debug, Clone)]
pub struct PeerPresence {
    http: reqwest::Client,
    peers: Vec<Url>,
}

impl PeerPresence {
    pub fn new(peers: Vec<Url>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(PEER_TIMEOUT)
            .build()
            .context("failed to build peer presence client")?;
        let peers = peers.into_iter().map(as_base).collect();
        Ok(Self { http, peers })
    }

    async fn ask(&self, peer: &Url, user_id: UserId) -> Result<bool> {
        let url = peer
            .join(&format!("presence/{user_id}"))
            .with_context(|| format!("invalid peer url: {peer}"))?;
        let reply: PresenceReply = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(reply.online)
    }
}

/// `Url::join` replaces the last path segment unless the path ends in `/`.
fn as_base(mut peer: Url) -> Url {
    if !peer.path().ends_with('/') {
        let path = format!("{}/", peer.path());
        peer.set_path(&path);
    }
    peer
}

#[async_trait]
impl PresenceOracle for PeerPresence {
    async fn is_externally_present(&self, user_id: UserId) -> bool {
        for peer in &self.peers {
            match self.ask(peer, user_id).await {
                Ok(true) => return true,
                Ok(false) => {}
                Err(err) => debug!(%peer, %user_id, error = %err, "peer presence check failed"),
            }
        }
        false
    }
}
