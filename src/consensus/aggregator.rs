use std::collections::{HashMap, HashSet};

use super::committee::{Committee, Stake};
use super::error::{ConsensusError, ConsensusResult};
use super::message::{Round, Timeout, Vote};
use super::qc::{QuorumCertificate, TimeoutCertificate};
use crate::common::crypto::{Digest, Pubkey, Signature};

/// Accumulates votes into QCs and timeouts into TCs, per round, by stake
/// weight. Votes fork per block digest; timeouts do not, so one TC maker
/// per round suffices.
pub struct Aggregator {
    committee: Committee,
    votes_aggregators: HashMap<Round, HashMap<Digest, QCMaker>>,
    timeouts_aggregators: HashMap<Round, TCMaker>,
}

impl Aggregator {
    pub fn new(committee: Committee) -> Self {
        Aggregator {
            committee,
            votes_aggregators: HashMap::new(),
            timeouts_aggregators: HashMap::new(),
        }
    }

    pub fn add_vote(&mut self, vote: Vote) -> ConsensusResult<Option<QuorumCertificate>> {
        self.votes_aggregators
            .entry(vote.round)
            .or_default()
            .entry(vote.hash)
            .or_insert_with(QCMaker::new)
            .append(vote, &self.committee)
    }

    pub fn add_timeout(&mut self, timeout: Timeout) -> ConsensusResult<Option<TimeoutCertificate>> {
        self.timeouts_aggregators
            .entry(timeout.round)
            .or_insert_with(TCMaker::new)
            .append(timeout, &self.committee)
    }

    /// Prune accumulators below `round`. Called on every round advance so
    /// memory stays bounded to the active window.
    pub fn cleanup(&mut self, round: Round) {
        self.votes_aggregators.retain(|r, _| *r >= round);
        self.timeouts_aggregators.retain(|r, _| *r >= round);
    }
}

struct QCMaker {
    weight: Stake,
    votes: Vec<(Pubkey, Signature)>,
    used: HashSet<Pubkey>,
}

impl QCMaker {
    fn new() -> Self {
        QCMaker {
            weight: 0,
            votes: Vec::new(),
            used: HashSet::new(),
        }
    }

    fn append(
        &mut self,
        vote: Vote,
        committee: &Committee,
    ) -> ConsensusResult<Option<QuorumCertificate>> {
        let author = vote.author;
        if !self.used.insert(author) {
            return Err(ConsensusError::AuthorityReuse(author));
        }
        self.votes.push((author, vote.signature));
        self.weight += committee.stake(&author);
        if self.weight >= committee.quorum_threshold() {
            // Zeroing the weight ensures this maker emits at most once.
            self.weight = 0;
            return Ok(Some(QuorumCertificate {
                hash: vote.hash,
                round: vote.round,
                votes: self.votes.clone(),
            }));
        }
        Ok(None)
    }
}

struct TCMaker {
    weight: Stake,
    votes: Vec<(Pubkey, Signature, Round)>,
    used: HashSet<Pubkey>,
}

impl TCMaker {
    fn new() -> Self {
        TCMaker {
            weight: 0,
            votes: Vec::new(),
            used: HashSet::new(),
        }
    }

    fn append(
        &mut self,
        timeout: Timeout,
        committee: &Committee,
    ) -> ConsensusResult<Option<TimeoutCertificate>> {
        let author = timeout.author;
        if !self.used.insert(author) {
            return Err(ConsensusError::AuthorityReuse(author));
        }
        self.votes
            .push((author, timeout.signature, timeout.high_qc.round));
        self.weight += committee.stake(&author);
        if self.weight >= committee.quorum_threshold() {
            self.weight = 0;
            return Ok(Some(TimeoutCertificate {
                round: timeout.round,
                votes: self.votes.clone(),
            }));
        }
        Ok(None)
    }
}
