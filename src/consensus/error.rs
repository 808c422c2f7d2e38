use thiserror::Error;

use crate::common::crypto::{Digest, Pubkey};
use super::message::Round;

pub type ConsensusResult<T> = Result<T, ConsensusError>;

#[derive(Error, Debug)]
pub enum ConsensusError {
    #[error("serialization failure: {0}")]
    SerializationError(#[from] Box<bincode::ErrorKind>),

    #[error("message to {0} could not be delivered")]
    NetworkError(Pubkey),

    #[error("received message from unknown authority {0}")]
    UnknownAuthority(Pubkey),

    #[error("invalid signature from {author} on {digest}")]
    InvalidSignature { author: Pubkey, digest: Digest },

    #[error("authority {0} appears twice in the same aggregation")]
    AuthorityReuse(Pubkey),

    #[error("QC over {0} carries insufficient stake")]
    QCRequiresQuorum(Digest),

    #[error("TC for round {0} carries insufficient stake")]
    TCRequiresQuorum(Round),

    #[error("malformed block {0}")]
    MalformedBlock(Digest),

    #[error("block {digest} round {round} not proposed by the elected leader {leader}")]
    WrongLeader {
        digest: Digest,
        leader: Pubkey,
        round: Round,
    },

    // A delivered block's grandparent must already be local: its parent could
    // only be admitted after its own parent resolved. Hitting this means the
    // store is corrupt or the admission path is broken, not attacker input.
    #[error("ancestor {0} of an admitted block is missing from the store")]
    MissingAncestor(Digest),
}

impl ConsensusError {
    /// Fatal errors abort the replica's consensus task; everything else
    /// terminates processing of the offending message only.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ConsensusError::MissingAncestor(_))
    }
}
