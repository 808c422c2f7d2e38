use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest as ShaDigest, Sha512};

use super::committee::Committee;
use super::error::{ConsensusError, ConsensusResult};
use super::qc::{QuorumCertificate, TimeoutCertificate};
use crate::common::crypto::{digest_from_hasher, Digest, Hashable, Keypair, Pubkey, Signature};

/*
    A message m ...
    is automatically stamped with curView, the sender’s current view
    number. Each message has a type m.type ∈ {new-view, prepare,
    pre-commit, commit, decide}. m.node contains a proposed node
    (the leaf node of a proposed branch). There is an optional field
    m.justify. The leader always uses this field to carry the QC for the
    different phases. Replicas use it in new-view messages to carry the
    highest prepareQC . Each message sent in a replica role contains a
    partial signaturem.partialSig by the sender over the tuple ⟨m.type,
    m.viewNumber ,m.node⟩, which is added in the voteMsg() utility.
*/

pub type Round = u64;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsensusMessage {
    Propose(Block),
    Vote(Vote),
    Timeout(Timeout),
    Tc(TimeoutCertificate),
    SyncRequest { missing: Digest, origin: Pubkey },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub qc: QuorumCertificate,
    pub tc: Option<TimeoutCertificate>,
    pub author: Pubkey,
    pub round: Round,
    pub payload: Vec<Digest>,
    pub signature: Signature,
}

impl Block {
    pub fn new(
        qc: QuorumCertificate,
        tc: Option<TimeoutCertificate>,
        author: Pubkey,
        round: Round,
        payload: Vec<Digest>,
        keypair: &Keypair,
    ) -> Self {
        let mut block = Block {
            qc,
            tc,
            author,
            round,
            payload,
            signature: Signature::unsigned(),
        };
        block.signature = keypair.sign(&block.digest());
        block
    }

    pub fn genesis() -> Self {
        Block {
            qc: QuorumCertificate::genesis(),
            tc: None,
            author: Pubkey::default(),
            round: 0,
            payload: Vec::new(),
            signature: Signature::unsigned(),
        }
    }

    /// The parent link: a block extends whatever its QC certifies.
    pub fn parent(&self) -> &Digest {
        &self.qc.hash
    }

    pub fn verify(&self, committee: &Committee) -> ConsensusResult<()> {
        let voting_rights = committee.stake(&self.author);
        if voting_rights == 0 {
            return Err(ConsensusError::UnknownAuthority(self.author));
        }

        if self.signature.signer != self.author || !self.signature.verify(&self.digest()) {
            return Err(ConsensusError::InvalidSignature {
                author: self.author,
                digest: self.digest(),
            });
        }

        if !self.qc.is_genesis() {
            self.qc.verify(committee)?;
        }

        if let Some(tc) = &self.tc {
            if tc.round + 1 != self.round {
                return Err(ConsensusError::MalformedBlock(self.digest()));
            }
            tc.verify(committee)?;
        }

        Ok(())
    }
}

impl Hashable for Block {
    fn digest(&self) -> Digest {
        let mut hasher = Sha512::new();
        hasher.update(self.author);
        hasher.update(self.round.to_be_bytes());
        for digest in &self.payload {
            hasher.update(digest);
        }
        hasher.update(self.qc.hash);
        digest_from_hasher(hasher)
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "B{}({:?}, qc_round={}, payload={})",
            self.round,
            self.digest(),
            self.qc.round,
            self.payload.len()
        )
    }
}

/// One authority's endorsement of a specific block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub hash: Digest,
    pub round: Round,
    pub author: Pubkey,
    pub signature: Signature,
}

impl Vote {
    pub fn new(block: &Block, author: Pubkey, keypair: &Keypair) -> Self {
        let mut vote = Vote {
            hash: block.digest(),
            round: block.round,
            author,
            signature: Signature::unsigned(),
        };
        vote.signature = keypair.sign(&vote.digest());
        vote
    }

    pub fn verify(&self, committee: &Committee) -> ConsensusResult<()> {
        if committee.stake(&self.author) == 0 {
            return Err(ConsensusError::UnknownAuthority(self.author));
        }
        if self.signature.signer != self.author || !self.signature.verify(&self.digest()) {
            return Err(ConsensusError::InvalidSignature {
                author: self.author,
                digest: self.digest(),
            });
        }
        Ok(())
    }
}

impl Hashable for Vote {
    // All voters for one block sign the same tuple, so a QC's signatures
    // can all be checked against a single digest.
    fn digest(&self) -> Digest {
        let mut hasher = Sha512::new();
        hasher.update(self.hash);
        hasher.update(self.round.to_be_bytes());
        digest_from_hasher(hasher)
    }
}

impl fmt::Display for Vote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V{}({:?}, {:?})", self.round, self.author, self.hash)
    }
}

/// One authority's declaration that it gave up waiting in `round`,
/// justified by its current high QC.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeout {
    pub high_qc: QuorumCertificate,
    pub round: Round,
    pub author: Pubkey,
    pub signature: Signature,
}

impl Timeout {
    pub fn new(high_qc: QuorumCertificate, round: Round, author: Pubkey, keypair: &Keypair) -> Self {
        let mut timeout = Timeout {
            high_qc,
            round,
            author,
            signature: Signature::unsigned(),
        };
        timeout.signature = keypair.sign(&timeout.digest());
        timeout
    }

    pub fn verify(&self, committee: &Committee) -> ConsensusResult<()> {
        if committee.stake(&self.author) == 0 {
            return Err(ConsensusError::UnknownAuthority(self.author));
        }
        if self.signature.signer != self.author || !self.signature.verify(&self.digest()) {
            return Err(ConsensusError::InvalidSignature {
                author: self.author,
                digest: self.digest(),
            });
        }
        if !self.high_qc.is_genesis() {
            self.high_qc.verify(committee)?;
        }
        Ok(())
    }
}

impl Hashable for Timeout {
    fn digest(&self) -> Digest {
        timeout_digest(self.round, self.high_qc.round)
    }
}

/// Tuple signed by a timing-out authority; TC verification recomputes it
/// per contributor from the reported high-QC round.
pub fn timeout_digest(round: Round, high_qc_round: Round) -> Digest {
    let mut hasher = Sha512::new();
    hasher.update(round.to_be_bytes());
    hasher.update(high_qc_round.to_be_bytes());
    digest_from_hasher(hasher)
}

impl fmt::Display for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "T{}({:?}, high_qc_round={})",
            self.round, self.author, self.high_qc.round
        )
    }
}
