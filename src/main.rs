/*
    HotStuff solves the State Machine Replication (SMR) problem. At the core of SMR is a protocol for deciding on a growing log of command requests by clients. A group of state-machine replicas apply commands in sequence order consistently. A client sends a command request to all replicas, and waits for responses from (f + 1) of them.

    The protocol works in a succession of views numbered with monotonically increasing view numbers. Each viewNumber has a unique dedicated leader known to all. Each replica stores a tree of pending commands as its local data structure. Each tree node contains a proposed command (or a batch of them), metadata associated with the protocol, and a parent link. The branch led by a given node is the path from the node all the way to the tree root by visiting parent links. During the protocol, a monotonically growing branch becomes committed.

    This binary runs a small local committee end to end: four replicas over
    an in-process routing table, a mock external mempool feeding payload
    digests, and a logger draining each replica's commit stream.
*/

use std::time::Duration;

use sha2::{Digest as ShaDigest, Sha512};
use tokio::sync::mpsc::channel;
use tracing::info;

use chained_bft::common::crypto::{digest_from_hasher, Keypair};
use chained_bft::consensus::{
    Committee, MempoolMessage, Parameters, Store, CHANNEL_CAPACITY,
};
use chained_bft::network::node::Node;
use chained_bft::network::Network;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let keypairs: Vec<_> = (0..4).map(|_| Keypair::new_pair()).collect();
    let committee = Committee::new(
        keypairs
            .iter()
            .enumerate()
            .map(|(i, kp)| (kp.pubkey(), 1, format!("127.0.0.1:{}", 9000 + i)))
            .collect(),
        1,
    );
    let network = Network::new();
    let parameters = Parameters::default();

    for (i, keypair) in keypairs.into_iter().enumerate() {
        let name = keypair.pubkey();
        let store = Store::new();
        let (tx_payloads, rx_payloads) = channel(CHANNEL_CAPACITY);
        let (tx_mempool_out, mut rx_mempool_out) = channel(CHANNEL_CAPACITY);
        let (tx_commit, mut rx_commit) = channel::<chained_bft::consensus::Block>(CHANNEL_CAPACITY);

        // Mock external mempool: publish a fresh payload digest every 300ms
        // and serve Synchronize requests by "fetching" the missing bytes.
        let feeder_store = store.clone();
        tokio::spawn(async move {
            let mut counter: u64 = 0;
            loop {
                tokio::time::sleep(Duration::from_millis(300)).await;
                let mut hasher = Sha512::new();
                hasher.update(name);
                hasher.update(counter.to_be_bytes());
                let digest = digest_from_hasher(hasher);
                counter += 1;
                feeder_store.write(digest, digest.to_vec());
                if tx_payloads.send(digest).await.is_err() {
                    break;
                }
            }
        });
        let sync_store = store.clone();
        tokio::spawn(async move {
            while let Some(message) = rx_mempool_out.recv().await {
                if let MempoolMessage::Synchronize(digests, _) = message {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    for digest in digests {
                        sync_store.write(digest, digest.to_vec());
                    }
                }
            }
        });

        // Downstream application: just log the finalized chain.
        tokio::spawn(async move {
            while let Some(block) = rx_commit.recv().await {
                info!(replica = %name, "finalized {}", block);
            }
        });

        Node::spawn(
            keypair,
            committee.clone(),
            parameters,
            store,
            network.clone(),
            rx_payloads,
            tx_mempool_out,
            tx_commit,
        );
        info!(replica = %name, index = i, "replica spawned");
    }

    tokio::signal::ctrl_c().await.ok();
    info!("shutting down");
}
