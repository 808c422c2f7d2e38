use std::collections::HashMap;

use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::mpsc::{channel, Receiver, Sender};
use tokio::sync::oneshot;
use tracing::warn;

use super::message::{Block, Round};
use super::store::Store;
use super::CHANNEL_CAPACITY;
use crate::common::crypto::{Digest, Hashable, Pubkey};

/// Notifications for the external mempool collaborator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MempoolMessage {
    /// These payload digests are referenced by a block authored by the given
    /// authority but are not locally available; go fetch them.
    Synchronize(Vec<Digest>, Pubkey),
    /// Rounds at or below this one are settled; stop fetching for them.
    Cleanup(Round),
}

/// Gates block admission on payload availability. A block whose payload is
/// incomplete is parked with the payload waiter and re-enters the core
/// through the loopback path once every missing digest has been stored.
pub struct MempoolDriver {
    store: Store,
    tx_mempool: Sender<MempoolMessage>,
    tx_payload_waiter: Sender<PayloadWaiterMessage>,
}

impl MempoolDriver {
    pub fn new(
        store: Store,
        tx_mempool: Sender<MempoolMessage>,
        tx_loopback: Sender<Block>,
    ) -> Self {
        let (tx_payload_waiter, rx_payload_waiter) = channel(CHANNEL_CAPACITY);
        PayloadWaiter::spawn(store.clone(), rx_payload_waiter, tx_loopback);
        MempoolDriver {
            store,
            tx_mempool,
            tx_payload_waiter,
        }
    }

    /// True admits the block. False parks it: the external mempool is told
    /// what is missing and the waiter redelivers the block once satisfied.
    pub async fn verify(&mut self, block: &Block) -> bool {
        let missing: Vec<Digest> = block
            .payload
            .iter()
            .filter(|digest| !self.store.contains(digest))
            .copied()
            .collect();

        if missing.is_empty() {
            return true;
        }

        if self
            .tx_mempool
            .send(MempoolMessage::Synchronize(missing.clone(), block.author))
            .await
            .is_err()
        {
            warn!("external mempool channel closed; payload fetch not requested");
        }
        if self
            .tx_payload_waiter
            .send(PayloadWaiterMessage::Wait(missing, block.clone()))
            .await
            .is_err()
        {
            warn!("payload waiter is gone; block will only resume via re-delivery");
        }
        false
    }

    /// Cancel waits for rounds at or below `round`; those blocks are either
    /// committed or superseded.
    pub async fn cleanup(&mut self, round: Round) {
        if self
            .tx_mempool
            .send(MempoolMessage::Cleanup(round))
            .await
            .is_err()
        {
            warn!("external mempool channel closed; cleanup not propagated");
        }
        let _ = self
            .tx_payload_waiter
            .send(PayloadWaiterMessage::Cleanup(round))
            .await;
    }
}

enum PayloadWaiterMessage {
    Wait(Vec<Digest>, Block),
    Cleanup(Round),
}

struct PayloadWaiter {
    store: Store,
    rx_message: Receiver<PayloadWaiterMessage>,
    tx_loopback: Sender<Block>,
}

impl PayloadWaiter {
    fn spawn(store: Store, rx_message: Receiver<PayloadWaiterMessage>, tx_loopback: Sender<Block>) {
        tokio::spawn(async move {
            Self {
                store,
                rx_message,
                tx_loopback,
            }
            .run()
            .await;
        });
    }

    async fn waiter(
        store: Store,
        missing: Vec<Digest>,
        deliver: Block,
        mut cancel: oneshot::Receiver<()>,
    ) -> Option<Block> {
        let waits: Vec<_> = missing
            .into_iter()
            .map(|digest| {
                let store = store.clone();
                async move { store.notify_read(digest).await }
            })
            .collect();
        tokio::select! {
            _ = join_all(waits) => Some(deliver),
            _ = &mut cancel => None,
        }
    }

    async fn run(&mut self) {
        let mut waiting = FuturesUnordered::new();
        // One entry per parked block; dropping the cancel handle tears the
        // waiter down.
        let mut pending: HashMap<Digest, (Round, oneshot::Sender<()>)> = HashMap::new();

        loop {
            tokio::select! {
                Some(message) = self.rx_message.recv() => match message {
                    PayloadWaiterMessage::Wait(missing, block) => {
                        let block_digest = block.digest();
                        if pending.contains_key(&block_digest) {
                            continue;
                        }
                        let (tx_cancel, rx_cancel) = oneshot::channel();
                        pending.insert(block_digest, (block.round, tx_cancel));
                        waiting.push(Self::waiter(
                            self.store.clone(),
                            missing,
                            block,
                            rx_cancel,
                        ));
                    }
                    PayloadWaiterMessage::Cleanup(round) => {
                        pending.retain(|_, (r, _)| *r > round);
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
                else => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::crypto::Keypair;
    use crate::consensus::qc::QuorumCertificate;
    use std::time::Duration;
    use tokio::time::timeout;

    fn block_with_payload(payload: Vec<Digest>, keypair: &Keypair, round: Round) -> Block {
        Block::new(
            QuorumCertificate::genesis(),
            None,
            keypair.pubkey(),
            round,
            payload,
            keypair,
        )
    }

    #[tokio::test]
    async fn test_verify_admits_block_with_local_payload() {
        let keypair = Keypair::new_pair();
        let store = Store::new();
        let (tx_mempool, _rx_mempool) = channel(16);
        let (tx_loopback, _rx_loopback) = channel(16);
        let mut driver = MempoolDriver::new(store.clone(), tx_mempool, tx_loopback);

        let digest = Digest([5; 32]);
        store.write(digest, vec![1]);
        let block = block_with_payload(vec![digest], &keypair, 1);

        assert!(driver.verify(&block).await);
    }

    #[tokio::test]
    async fn test_verify_suspends_and_requests_missing_payload() {
        let keypair = Keypair::new_pair();
        let store = Store::new();
        let (tx_mempool, mut rx_mempool) = channel(16);
        let (tx_loopback, _rx_loopback) = channel(16);
        let mut driver = MempoolDriver::new(store, tx_mempool, tx_loopback);

        let digest = Digest([5; 32]);
        let block = block_with_payload(vec![digest], &keypair, 1);

        assert!(!driver.verify(&block).await);
        assert_eq!(
            rx_mempool.recv().await,
            Some(MempoolMessage::Synchronize(vec![digest], block.author))
        );
    }

    #[tokio::test]
    async fn test_suspended_block_resumes_once_payload_lands() {
        let keypair = Keypair::new_pair();
        let store = Store::new();
        let (tx_mempool, _rx_mempool) = channel(16);
        let (tx_loopback, mut rx_loopback) = channel(16);
        let mut driver = MempoolDriver::new(store.clone(), tx_mempool, tx_loopback);

        let digests = vec![Digest([5; 32]), Digest([6; 32])];
        let block = block_with_payload(digests.clone(), &keypair, 1);
        assert!(!driver.verify(&block).await);

        // First write satisfies half the wait; nothing resumes yet.
        store.write(digests[0], vec![1]);
        assert!(
            timeout(Duration::from_millis(50), rx_loopback.recv())
                .await
                .is_err()
        );

        store.write(digests[1], vec![2]);
        let resumed = timeout(Duration::from_secs(1), rx_loopback.recv())
            .await
            .expect("suspended block never resumed")
            .unwrap();
        assert_eq!(resumed, block);
    }

    #[tokio::test]
    async fn test_cleanup_cancels_pending_waits() {
        let keypair = Keypair::new_pair();
        let store = Store::new();
        let (tx_mempool, mut rx_mempool) = channel(16);
        let (tx_loopback, mut rx_loopback) = channel(16);
        let mut driver = MempoolDriver::new(store.clone(), tx_mempool, tx_loopback);

        let digest = Digest([5; 32]);
        let block = block_with_payload(vec![digest], &keypair, 1);
        assert!(!driver.verify(&block).await);

        driver.cleanup(1).await;
        assert_eq!(rx_mempool.recv().await, Some(MempoolMessage::Synchronize(vec![digest], block.author)));
        assert_eq!(rx_mempool.recv().await, Some(MempoolMessage::Cleanup(1)));

        // The wait was torn down: a late write must not resurrect the block.
        store.write(digest, vec![1]);
        assert!(
            timeout(Duration::from_millis(100), rx_loopback.recv())
                .await
                .is_err()
        );
    }
}
