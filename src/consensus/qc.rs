use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest as ShaDigest, Sha512};

use super::committee::Committee;
use super::error::{ConsensusError, ConsensusResult};
use super::message::{timeout_digest, Round};
use crate::common::crypto::{digest_from_hasher, Digest, Pubkey, Signature};

/*
    A Quorum Certificate (QC) over a tuple
    ⟨type, viewNumber, node⟩ is a data type that combines a collection
    of signatures for the same tuple signed by (n − f ) replicas. Given
    a QC qc, we use qc.type, qc.viewNumber , qc.node to refer to the
    matching fields of the original tuple.
*/

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumCertificate {
    pub hash: Digest,
    pub round: Round,
    pub votes: Vec<(Pubkey, Signature)>,
}

impl QuorumCertificate {
    /// The genesis QC needs no quorum: it is the agreed starting point.
    pub fn genesis() -> Self {
        QuorumCertificate {
            hash: Digest::default(),
            round: 0,
            votes: Vec::new(),
        }
    }

    pub fn is_genesis(&self) -> bool {
        self.round == 0
    }

    /// The tuple every contributing vote signed.
    pub fn signed_digest(&self) -> Digest {
        let mut hasher = Sha512::new();
        hasher.update(self.hash);
        hasher.update(self.round.to_be_bytes());
        digest_from_hasher(hasher)
    }

    pub fn verify(&self, committee: &Committee) -> ConsensusResult<()> {
        if self.is_genesis() {
            return Ok(());
        }

        let mut weight = 0;
        let mut used = HashSet::new();
        for (name, _) in &self.votes {
            if used.contains(name) {
                return Err(ConsensusError::AuthorityReuse(*name));
            }
            let voting_rights = committee.stake(name);
            if voting_rights == 0 {
                return Err(ConsensusError::UnknownAuthority(*name));
            }
            used.insert(*name);
            weight += voting_rights;
        }
        if weight < committee.quorum_threshold() {
            return Err(ConsensusError::QCRequiresQuorum(self.hash));
        }

        let digest = self.signed_digest();
        for (name, signature) in &self.votes {
            if signature.signer != *name || !signature.verify(&digest) {
                return Err(ConsensusError::InvalidSignature {
                    author: *name,
                    digest,
                });
            }
        }

        Ok(())
    }
}

impl fmt::Display for QuorumCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QC({:?}, round={})", self.hash, self.round)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutCertificate {
    pub round: Round,
    pub votes: Vec<(Pubkey, Signature, Round)>,
}

impl TimeoutCertificate {
    /// High-QC rounds reported by the contributors; the maximum bounds what
    /// a safe proposal after this round change must extend.
    pub fn high_qc_rounds(&self) -> Vec<Round> {
        self.votes.iter().map(|(_, _, round)| *round).collect()
    }

    pub fn verify(&self, committee: &Committee) -> ConsensusResult<()> {
        let mut weight = 0;
        let mut used = HashSet::new();
        for (name, _, _) in &self.votes {
            if used.contains(name) {
                return Err(ConsensusError::AuthorityReuse(*name));
            }
            let voting_rights = committee.stake(name);
            if voting_rights == 0 {
                return Err(ConsensusError::UnknownAuthority(*name));
            }
            used.insert(*name);
            weight += voting_rights;
        }
        if weight < committee.quorum_threshold() {
            return Err(ConsensusError::TCRequiresQuorum(self.round));
        }

        for (name, signature, high_qc_round) in &self.votes {
            let digest = timeout_digest(self.round, *high_qc_round);
            if signature.signer != *name || !signature.verify(&digest) {
                return Err(ConsensusError::InvalidSignature {
                    author: *name,
                    digest,
                });
            }
        }

        Ok(())
    }
}

impl fmt::Display for TimeoutCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TC(round={})", self.round)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::crypto::{Hashable, Keypair};
    use crate::consensus::message::{Block, Timeout, Vote};

    fn committee_of(keypairs: &[Keypair]) -> Committee {
        let info = keypairs
            .iter()
            .enumerate()
            .map(|(i, kp)| (kp.pubkey(), 1, format!("127.0.0.1:{}", 9000 + i)))
            .collect();
        Committee::new(info, 1)
    }

    fn qc_over(block: &Block, signers: &[&Keypair]) -> QuorumCertificate {
        let votes = signers
            .iter()
            .map(|kp| {
                let vote = Vote::new(block, kp.pubkey(), kp);
                (vote.author, vote.signature)
            })
            .collect();
        QuorumCertificate {
            hash: block.digest(),
            round: block.round,
            votes,
        }
    }

    #[test]
    fn test_genesis_qc_is_always_valid() {
        let keypairs: Vec<_> = (0..4).map(|_| Keypair::new_pair()).collect();
        let committee = committee_of(&keypairs);

        assert!(QuorumCertificate::genesis().verify(&committee).is_ok());
    }

    #[test]
    fn test_qc_with_quorum_verifies() {
        let keypairs: Vec<_> = (0..4).map(|_| Keypair::new_pair()).collect();
        let committee = committee_of(&keypairs);
        let block = Block::new(
            QuorumCertificate::genesis(),
            None,
            keypairs[0].pubkey(),
            1,
            Vec::new(),
            &keypairs[0],
        );

        let qc = qc_over(&block, &[&keypairs[0], &keypairs[1], &keypairs[2]]);
        assert!(qc.verify(&committee).is_ok());
    }

    #[test]
    fn test_qc_below_quorum_is_rejected() {
        let keypairs: Vec<_> = (0..4).map(|_| Keypair::new_pair()).collect();
        let committee = committee_of(&keypairs);
        let block = Block::new(
            QuorumCertificate::genesis(),
            None,
            keypairs[0].pubkey(),
            1,
            Vec::new(),
            &keypairs[0],
        );

        let qc = qc_over(&block, &[&keypairs[0], &keypairs[1]]);
        assert!(matches!(
            qc.verify(&committee),
            Err(ConsensusError::QCRequiresQuorum(_))
        ));
    }

    #[test]
    fn test_qc_authority_reuse_is_rejected_not_deduped() {
        let keypairs: Vec<_> = (0..4).map(|_| Keypair::new_pair()).collect();
        let committee = committee_of(&keypairs);
        let block = Block::new(
            QuorumCertificate::genesis(),
            None,
            keypairs[0].pubkey(),
            1,
            Vec::new(),
            &keypairs[0],
        );

        // Same authority stamped three times reaches raw weight 3, which must
        // still be refused as Byzantine evidence.
        let qc = qc_over(&block, &[&keypairs[0], &keypairs[0], &keypairs[0]]);
        assert!(matches!(
            qc.verify(&committee),
            Err(ConsensusError::AuthorityReuse(_))
        ));
    }

    #[test]
    fn test_qc_with_outsider_is_rejected() {
        let keypairs: Vec<_> = (0..4).map(|_| Keypair::new_pair()).collect();
        let committee = committee_of(&keypairs);
        let outsider = Keypair::new_pair();
        let block = Block::new(
            QuorumCertificate::genesis(),
            None,
            keypairs[0].pubkey(),
            1,
            Vec::new(),
            &keypairs[0],
        );

        let qc = qc_over(&block, &[&keypairs[0], &keypairs[1], &outsider]);
        assert!(matches!(
            qc.verify(&committee),
            Err(ConsensusError::UnknownAuthority(_))
        ));
    }

    #[test]
    fn test_tc_verifies_and_reports_high_qc_rounds() {
        let keypairs: Vec<_> = (0..4).map(|_| Keypair::new_pair()).collect();
        let committee = committee_of(&keypairs);

        let votes = keypairs
            .iter()
            .take(3)
            .map(|kp| {
                let timeout = Timeout::new(QuorumCertificate::genesis(), 4, kp.pubkey(), kp);
                (timeout.author, timeout.signature, timeout.high_qc.round)
            })
            .collect();
        let tc = TimeoutCertificate { round: 4, votes };

        assert!(tc.verify(&committee).is_ok());
        assert_eq!(tc.high_qc_rounds(), vec![0, 0, 0]);
    }

    #[test]
    fn test_tc_below_quorum_is_rejected() {
        let keypairs: Vec<_> = (0..4).map(|_| Keypair::new_pair()).collect();
        let committee = committee_of(&keypairs);

        let votes = keypairs
            .iter()
            .take(2)
            .map(|kp| {
                let timeout = Timeout::new(QuorumCertificate::genesis(), 4, kp.pubkey(), kp);
                (timeout.author, timeout.signature, timeout.high_qc.round)
            })
            .collect();
        let tc = TimeoutCertificate { round: 4, votes };

        assert!(matches!(
            tc.verify(&committee),
            Err(ConsensusError::TCRequiresQuorum(4))
        ));
    }
}
