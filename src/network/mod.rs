pub mod node;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::Sender;
use tracing::warn;

use crate::common::crypto::Pubkey;
use crate::consensus::error::{ConsensusError, ConsensusResult};
use crate::consensus::message::ConsensusMessage;

/*
    Network communication is point-to-point, authenticated and
    reliable: one correct replica receives a message from another correct
    replica if and only if the latter sent that message to the former. When
    we refer to a “broadcast”, it involves the broadcaster, if correct, sending the same point-to-point messages to all replicas, including itself.
    We adopt the partial synchrony model of Dwork et al. [25], where
    there is a known bound ∆ and an unknown Global Stabilization
    Time (GST), such that after GST, all transmissions between two correct replicas arrive within time ∆. Our protocol will ensure safety
    always, and will guarantee progress within a bounded duration
    after GST. (Guaranteeing progress before GST is impossible [27].)
    In practice, our protocol will guarantee progress if the system remains stable (i.e., if messages arrive within ∆ time) for sufficiently
    long after GST, though assuming that it does so forever simplifies
    discussion.
*/

/// In-process routing table standing in for real transport. Each replica
/// registers its inbox under its identity; instances are independent, so
/// several committees can run side by side in one process.
#[derive(Clone, Default)]
pub struct Network {
    routes: Arc<Mutex<HashMap<Pubkey, Sender<ConsensusMessage>>>>,
}

impl Network {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: Pubkey, inbox: Sender<ConsensusMessage>) {
        self.routes.lock().unwrap().insert(name, inbox);
    }

    /// Deliver to one identity. Failure to deliver is recoverable for the
    /// caller but never silent.
    pub async fn send(&self, to: &Pubkey, message: ConsensusMessage) -> ConsensusResult<()> {
        let route = self.routes.lock().unwrap().get(to).cloned();
        match route {
            Some(inbox) => inbox
                .send(message)
                .await
                .map_err(|_| ConsensusError::NetworkError(*to)),
            None => Err(ConsensusError::NetworkError(*to)),
        }
    }

    /// Best-effort delivery to every registered identity except `from`.
    pub async fn broadcast(&self, from: &Pubkey, message: ConsensusMessage) {
        let routes: Vec<(Pubkey, Sender<ConsensusMessage>)> = self
            .routes
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name != &from)
            .map(|(name, inbox)| (*name, inbox.clone()))
            .collect();

        for (name, inbox) in routes {
            if inbox.send(message.clone()).await.is_err() {
                warn!(peer = %name, "dropping broadcast to unreachable peer");
            }
        }
    }
}
