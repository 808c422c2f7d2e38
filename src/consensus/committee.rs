use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::common::crypto::Pubkey;
use super::message::Round;

pub type Stake = u64;
pub type EpochNumber = u64;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Authority {
    pub stake: Stake,
    pub address: String,
}

/// Static weighted membership for one run; never mutated after formation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Committee {
    pub authorities: HashMap<Pubkey, Authority>,
    pub epoch: EpochNumber,
}

impl Committee {
    pub fn new(info: Vec<(Pubkey, Stake, String)>, epoch: EpochNumber) -> Self {
        let authorities = info
            .into_iter()
            .map(|(name, stake, address)| (name, Authority { stake, address }))
            .collect();
        Committee { authorities, epoch }
    }

    pub fn size(&self) -> usize {
        self.authorities.len()
    }

    /// Stake of an identity; 0 means "not a member", which callers must
    /// treat as a rejection.
    pub fn stake(&self, name: &Pubkey) -> Stake {
        self.authorities.get(name).map_or(0, |a| a.stake)
    }

    pub fn total_stake(&self) -> Stake {
        self.authorities.values().map(|a| a.stake).sum()
    }

    /// Minimum aggregate stake implying at most f lying authorities when
    /// total = 3f+1. The exact floor(2T/3)+1 form preserves the safety
    /// margin for uneven stake splits.
    pub fn quorum_threshold(&self) -> Stake {
        2 * self.total_stake() / 3 + 1
    }

    pub fn address(&self, name: &Pubkey) -> Option<String> {
        self.authorities.get(name).map(|a| a.address.clone())
    }

    pub fn broadcast_addresses(&self, myself: &Pubkey) -> Vec<(Pubkey, String)> {
        self.authorities
            .iter()
            .filter(|(name, _)| name != &myself)
            .map(|(name, authority)| (*name, authority.address.clone()))
            .collect()
    }
}

/// Round-robin over the canonically sorted identities. Stateless and
/// clock-free so every replica elects the same leader for every round.
#[derive(Clone, Debug)]
pub struct LeaderElector {
    keys: Vec<Pubkey>,
}

impl LeaderElector {
    pub fn new(committee: &Committee) -> Self {
        let mut keys: Vec<_> = committee.authorities.keys().copied().collect();
        keys.sort();
        LeaderElector { keys }
    }

    pub fn get_leader(&self, round: Round) -> Pubkey {
        self.keys[round as usize % self.keys.len()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::crypto::Keypair;

    fn committee_with_stakes(stakes: &[Stake]) -> Committee {
        let info = stakes
            .iter()
            .enumerate()
            .map(|(i, stake)| {
                (
                    Keypair::new_pair().pubkey(),
                    *stake,
                    format!("127.0.0.1:{}", 9000 + i),
                )
            })
            .collect();
        Committee::new(info, 1)
    }

    #[test]
    fn test_quorum_threshold_equal_stakes() {
        // 4 authorities of stake 1: total 4, threshold floor(8/3)+1 = 3.
        let committee = committee_with_stakes(&[1, 1, 1, 1]);
        assert_eq!(committee.quorum_threshold(), 3);
    }

    #[test]
    fn test_quorum_threshold_weighted() {
        let committee = committee_with_stakes(&[10, 20, 30, 40]);
        assert_eq!(committee.total_stake(), 100);
        assert_eq!(committee.quorum_threshold(), 67);
    }

    #[test]
    fn test_unknown_identity_has_zero_stake() {
        let committee = committee_with_stakes(&[1, 1, 1, 1]);
        let outsider = Keypair::new_pair().pubkey();
        assert_eq!(committee.stake(&outsider), 0);
    }

    #[test]
    fn test_leader_election_is_deterministic() {
        let committee = committee_with_stakes(&[1, 1, 1, 1]);
        let elector_a = LeaderElector::new(&committee);
        let elector_b = LeaderElector::new(&committee);

        for round in 0..20 {
            assert_eq!(elector_a.get_leader(round), elector_b.get_leader(round));
        }
    }

    #[test]
    fn test_leader_rotation_covers_committee() {
        let committee = committee_with_stakes(&[1, 1, 1, 1]);
        let elector = LeaderElector::new(&committee);

        let mut seen = std::collections::HashSet::new();
        for round in 0..4 {
            seen.insert(elector.get_leader(round));
        }
        assert_eq!(seen.len(), committee.size());
    }

    #[test]
    fn test_broadcast_addresses_excludes_self() {
        let committee = committee_with_stakes(&[1, 1, 1, 1]);
        let me = *committee.authorities.keys().next().unwrap();

        let peers = committee.broadcast_addresses(&me);
        assert_eq!(peers.len(), 3);
        assert!(peers.iter().all(|(name, _)| name != &me));
    }
}
