use tokio::sync::mpsc::{channel, Receiver, Sender};

use super::Network;
use crate::common::crypto::{Digest, Keypair, Pubkey};
use crate::consensus::committee::{Committee, LeaderElector};
use crate::consensus::config::Parameters;
use crate::consensus::core::Core;
use crate::consensus::helper::Helper;
use crate::consensus::mempool::{MempoolDriver, MempoolMessage};
use crate::consensus::message::{Block, ConsensusMessage};
use crate::consensus::proposer::Proposer;
use crate::consensus::store::Store;
use crate::consensus::synchronizer::Synchronizer;
use crate::consensus::CHANNEL_CAPACITY;

/// One replica's cooperative task set: core, proposer, helper and the
/// background drivers, multiplexed over channels and registered on the
/// shared routing table.
pub struct Node {
    pub name: Pubkey,
}

impl Node {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        keypair: Keypair,
        committee: Committee,
        parameters: Parameters,
        store: Store,
        network: Network,
        rx_mempool: Receiver<Digest>,
        tx_mempool: Sender<MempoolMessage>,
        tx_commit: Sender<Block>,
    ) -> Self {
        let name = keypair.pubkey();

        let (tx_inbox, mut rx_inbox) = channel(CHANNEL_CAPACITY);
        let (tx_consensus, rx_consensus) = channel(CHANNEL_CAPACITY);
        let (tx_helper, rx_helper) = channel(CHANNEL_CAPACITY);
        let (tx_loopback, rx_loopback) = channel(CHANNEL_CAPACITY);
        let (tx_proposer, rx_proposer) = channel(CHANNEL_CAPACITY);

        network.register(name, tx_inbox);

        // Inbox router: sync requests go to the helper, protocol messages
        // to the core.
        tokio::spawn(async move {
            while let Some(message) = rx_inbox.recv().await {
                let forwarded = match message {
                    ConsensusMessage::SyncRequest { missing, origin } => {
                        tx_helper.send((missing, origin)).await.is_ok()
                    }
                    other => tx_consensus.send(other).await.is_ok(),
                };
                if !forwarded {
                    break;
                }
            }
        });

        let leader_elector = LeaderElector::new(&committee);
        let mempool_driver =
            MempoolDriver::new(store.clone(), tx_mempool, tx_loopback.clone());
        let synchronizer = Synchronizer::new(
            name,
            committee.clone(),
            store.clone(),
            tx_loopback.clone(),
            parameters.sync_retry_delay,
            network.clone(),
        );

        let mut core = Core::new(
            name,
            keypair.clone(),
            committee.clone(),
            leader_elector,
            store.clone(),
            mempool_driver,
            synchronizer,
            rx_consensus,
            rx_loopback,
            tx_proposer,
            tx_commit,
            network.clone(),
            parameters.timeout_delay,
        );
        tokio::spawn(async move { core.run().await });

        let mut proposer = Proposer::new(
            name,
            keypair,
            rx_mempool,
            rx_proposer,
            tx_loopback,
            network.clone(),
        );
        tokio::spawn(async move { proposer.run().await });

        let mut helper = Helper::new(committee, store, network, rx_helper);
        tokio::spawn(async move { helper.run().await });

        Node { name }
    }
}
