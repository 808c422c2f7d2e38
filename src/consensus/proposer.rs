use std::collections::HashSet;

use tokio::sync::mpsc::{Receiver, Sender};
use tracing::{debug, info, warn};

use super::message::{Block, ConsensusMessage, Round};
use super::qc::{QuorumCertificate, TimeoutCertificate};
use crate::common::crypto::{Digest, Keypair, Pubkey};
use crate::network::Network;

#[derive(Clone, Debug)]
pub enum ProposerMessage {
    /// Cut a block for `round` extending the given certificates.
    Make {
        round: Round,
        qc: QuorumCertificate,
        tc: Option<TimeoutCertificate>,
    },
    /// Forget digests already carried by an ancestor block.
    Cleanup(Vec<Digest>),
}

/// Buffers payload digests arriving from the mempool and cuts blocks on
/// command from the core.
pub struct Proposer {
    name: Pubkey,
    keypair: Keypair,
    rx_mempool: Receiver<Digest>,
    rx_message: Receiver<ProposerMessage>,
    tx_loopback: Sender<Block>,
    network: Network,
    buffer: HashSet<Digest>,
}

impl Proposer {
    pub fn new(
        name: Pubkey,
        keypair: Keypair,
        rx_mempool: Receiver<Digest>,
        rx_message: Receiver<ProposerMessage>,
        tx_loopback: Sender<Block>,
        network: Network,
    ) -> Self {
        Proposer {
            name,
            keypair,
            rx_mempool,
            rx_message,
            tx_loopback,
            network,
            buffer: HashSet::new(),
        }
    }

    async fn make_block(
        &mut self,
        round: Round,
        qc: QuorumCertificate,
        tc: Option<TimeoutCertificate>,
    ) {
        let payload: Vec<Digest> = self.buffer.drain().collect();
        let block = Block::new(qc, tc, self.name, round, payload, &self.keypair);
        info!("created {}", block);

        self.network
            .broadcast(&self.name, ConsensusMessage::Propose(block.clone()))
            .await;

        // The leader does not special-case itself: its own core admits the
        // block through the loopback path like any received proposal.
        if self.tx_loopback.send(block).await.is_err() {
            warn!("core loopback closed; own proposal dropped");
        }
    }

    pub async fn run(&mut self) {
        loop {
            tokio::select! {
                Some(digest) = self.rx_mempool.recv() => {
                    self.buffer.insert(digest);
                },
                Some(message) = self.rx_message.recv() => match message {
                    ProposerMessage::Make { round, qc, tc } => {
                        self.make_block(round, qc, tc).await
                    }
                    ProposerMessage::Cleanup(digests) => {
                        debug!(count = digests.len(), "dropping settled payload digests");
                        for digest in digests {
                            self.buffer.remove(&digest);
                        }
                    }
                },
                else => break,
            }
        }
    }
}
