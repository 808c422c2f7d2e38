use tokio::sync::mpsc::Receiver;
use tracing::{debug, warn};

use super::committee::Committee;
use super::message::{Block, ConsensusMessage};
use super::store::Store;
use crate::common::crypto::{Digest, Pubkey};
use crate::network::Network;

/// Answers sync requests from peers that are missing a block. A request for
/// something we do not hold is simply ignored; the requester retries or asks
/// another member.
pub struct Helper {
    committee: Committee,
    store: Store,
    network: Network,
    rx_request: Receiver<(Digest, Pubkey)>,
}

impl Helper {
    pub fn new(
        committee: Committee,
        store: Store,
        network: Network,
        rx_request: Receiver<(Digest, Pubkey)>,
    ) -> Self {
        Helper {
            committee,
            store,
            network,
            rx_request,
        }
    }

    pub async fn run(&mut self) {
        while let Some((digest, origin)) = self.rx_request.recv().await {
            if self.committee.address(&origin).is_none() {
                warn!(origin = %origin, "sync request from unknown authority");
                continue;
            }

            let Some(bytes) = self.store.read(&digest) else {
                debug!(missing = %digest, origin = %origin, "cannot help, block not held");
                continue;
            };

            match bincode::deserialize::<Block>(&bytes) {
                Ok(block) => {
                    if let Err(e) = self
                        .network
                        .send(&origin, ConsensusMessage::Propose(block))
                        .await
                    {
                        warn!("sync reply not delivered: {e}");
                    }
                }
                Err(e) => warn!(digest = %digest, "stored block failed to decode: {e}"),
            }
        }
    }
}
