use std::collections::HashMap;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::mpsc::{channel, Receiver, Sender};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::committee::Committee;
use super::error::{ConsensusError, ConsensusResult};
use super::message::{Block, ConsensusMessage, Round};
use super::store::Store;
use super::timer::Timer;
use super::CHANNEL_CAPACITY;
use crate::common::crypto::{Digest, Hashable, Pubkey};
use crate::network::Network;

/// Resolves a block's ancestor chain. A missing parent suspends the block:
/// the author is asked for it, the sync driver parks the block until the
/// parent is stored, and the block then re-enters the core via loopback.
pub struct Synchronizer {
    name: Pubkey,
    store: Store,
    network: Network,
    tx_sync_driver: Sender<SyncDriverMessage>,
}

impl Synchronizer {
    pub fn new(
        name: Pubkey,
        committee: Committee,
        store: Store,
        tx_loopback: Sender<Block>,
        sync_retry_delay: u64,
        network: Network,
    ) -> Self {
        let (tx_sync_driver, rx_sync_driver) = channel(CHANNEL_CAPACITY);
        SyncDriver::spawn(
            name,
            committee,
            store.clone(),
            rx_sync_driver,
            tx_loopback,
            sync_retry_delay,
            network.clone(),
        );
        Synchronizer {
            name,
            store,
            network,
            tx_sync_driver,
        }
    }

    /// The stored parent, or the synthetic genesis block for round-1 chains.
    /// `None` means the parent is being fetched and the caller must suspend.
    pub async fn get_parent_block(&mut self, block: &Block) -> ConsensusResult<Option<Block>> {
        if block.qc.is_genesis() {
            return Ok(Some(Block::genesis()));
        }
        let parent = *block.parent();
        match self.store.read(&parent) {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => {
                debug!(block = %block, missing = %parent, "missing parent, requesting sync");
                let message = ConsensusMessage::SyncRequest {
                    missing: parent,
                    origin: self.name,
                };
                if let Err(e) = self.network.send(&block.author, message).await {
                    warn!("sync request not delivered: {e}");
                }
                if self
                    .tx_sync_driver
                    .send(SyncDriverMessage::Wait(block.clone()))
                    .await
                    .is_err()
                {
                    warn!("sync driver is gone; block will only resume via re-delivery");
                }
                Ok(None)
            }
        }
    }

    /// The two immediate ancestors (b0, b1) of a block. `b1` may legitimately
    /// be in flight; `b0` absent means the store lost a block that was
    /// required for `b1`'s own admission, which is unrecoverable.
    pub async fn get_ancestors(
        &mut self,
        block: &Block,
    ) -> ConsensusResult<Option<(Block, Block)>> {
        let b1 = match self.get_parent_block(block).await? {
            Some(parent) => parent,
            None => return Ok(None),
        };
        let b0 = if b1.qc.is_genesis() {
            Block::genesis()
        } else {
            let digest = *b1.parent();
            let bytes = self
                .store
                .read(&digest)
                .ok_or(ConsensusError::MissingAncestor(digest))?;
            bincode::deserialize(&bytes)?
        };
        Ok(Some((b0, b1)))
    }

    /// Tear down waits for blocks at or below `round`.
    pub async fn cleanup(&mut self, round: Round) {
        let _ = self
            .tx_sync_driver
            .send(SyncDriverMessage::Cleanup(round))
            .await;
    }
}

enum SyncDriverMessage {
    Wait(Block),
    Cleanup(Round),
}

struct SyncDriver {
    name: Pubkey,
    committee: Committee,
    store: Store,
    rx_message: Receiver<SyncDriverMessage>,
    tx_loopback: Sender<Block>,
    sync_retry_delay: u64,
    network: Network,
}

impl SyncDriver {
    #[allow(clippy::too_many_arguments)]
    fn spawn(
        name: Pubkey,
        committee: Committee,
        store: Store,
        rx_message: Receiver<SyncDriverMessage>,
        tx_loopback: Sender<Block>,
        sync_retry_delay: u64,
        network: Network,
    ) {
        tokio::spawn(async move {
            Self {
                name,
                committee,
                store,
                rx_message,
                tx_loopback,
                sync_retry_delay,
                network,
            }
            .run()
            .await;
        });
    }

    async fn waiter(
        store: Store,
        parent: Digest,
        deliver: Block,
        mut cancel: oneshot::Receiver<()>,
    ) -> Option<Block> {
        tokio::select! {
            _ = store.notify_read(parent) => Some(deliver),
            _ = &mut cancel => None,
        }
    }

    async fn run(&mut self) {
        let mut waiting = FuturesUnordered::new();
        // Parked blocks by their own digest -> (round, awaited parent, cancel).
        let mut pending: HashMap<Digest, (Round, Digest, oneshot::Sender<()>)> = HashMap::new();
        let mut retry_timer = Timer::new(self.sync_retry_delay);

        loop {
            tokio::select! {
                Some(message) = self.rx_message.recv() => match message {
                    SyncDriverMessage::Wait(block) => {
                        let block_digest = block.digest();
                        if pending.contains_key(&block_digest) {
                            continue;
                        }
                        let parent = *block.parent();
                        let (tx_cancel, rx_cancel) = oneshot::channel();
                        pending.insert(block_digest, (block.round, parent, tx_cancel));
                        waiting.push(Self::waiter(
                            self.store.clone(),
                            parent,
                            block,
                            rx_cancel,
                        ));
                    }
                    SyncDriverMessage::Cleanup(round) => {
                        pending.retain(|_, (r, _, _)| *r > round);
                    }
                },
                Some(resolved) = waiting.next() => {
                    if let Some(block) = resolved {
                        pending.remove(&block.digest());
                        if self.tx_loopback.send(block).await.is_err() {
                            warn!("core loopback closed; dropping resumed block");
                        }
                    }
                },
                () = &mut retry_timer => {
                    // The original author may be down; widen the ask to the
                    // whole committee until the parent shows up.
                    for (_, parent, _) in pending.values() {
                        debug!(missing = %parent, "retrying sync request");
                        let message = ConsensusMessage::SyncRequest {
                            missing: *parent,
                            origin: self.name,
                        };
                        for (peer, _) in self.committee.broadcast_addresses(&self.name) {
                            if let Err(e) = self.network.send(&peer, message.clone()).await {
                                debug!("sync retry not delivered: {e}");
                            }
                        }
                    }
                    retry_timer.reset();
                },
                else => break,
            }
        }
    }
}
