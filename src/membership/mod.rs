use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identity of a Raft cluster member.
///
/// This is not a network address. A member that leaves the cluster and joins
/// again with fresh state must use a new `MemberId`.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize, Display,
)]
#[display(fmt = "{}", _0)]
pub struct MemberId(Uuid);

impl MemberId {
    /// Generates a fresh member identity.
    pub fn new() -> MemberId {
        MemberId(Uuid::new_v4())
    }
}

/// The set of members involved in the Raft cluster.
///
/// Voting members count toward quorum and can lead. Non-voting members
/// receive replicated entries but never vote.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub voting: BTreeSet<MemberId>,
    pub non_voting: BTreeSet<MemberId>,
}

impl Config {
    pub fn new(voting: BTreeSet<MemberId>, non_voting: BTreeSet<MemberId>) -> Config {
        Config { voting, non_voting }
    }

    /// Configuration with voting members only.
    pub fn with_voting(voting: BTreeSet<MemberId>) -> Config {
        Config {
            voting,
            non_voting: BTreeSet::new(),
        }
    }

    /// All members, voting and non-voting.
    pub fn all_members(&self) -> BTreeSet<MemberId> {
        self.voting.union(&self.non_voting).cloned().collect()
    }

    pub fn is_member(&self, member_id: &MemberId) -> bool {
        self.voting.contains(member_id) || self.non_voting.contains(member_id)
    }

    /// True if `members` constitutes a strict majority of the voting set.
    pub fn is_quorum(&self, members: &BTreeSet<MemberId>) -> bool {
        let votes = members.intersection(&self.voting).count();

        votes * 2 > self.voting.len()
    }

    pub fn is_valid_leader(&self, member_id: &MemberId) -> bool {
        self.voting.contains(member_id)
    }
}

/// Either a single configuration or a joint consensus of an old and a new
/// configuration.
///
/// For a single configuration `config` holds it and `new_config` is empty.
/// For a joint consensus `config` holds the old configuration and
/// `new_config` holds the new one.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ComplexConfig {
    pub config: Config,
    pub new_config: Option<Config>,
}

impl ComplexConfig {
    pub fn single(config: Config) -> ComplexConfig {
        ComplexConfig {
            config,
            new_config: None,
        }
    }

    pub fn joint(old_config: Config, new_config: Config) -> ComplexConfig {
        ComplexConfig {
            config: old_config,
            new_config: Some(new_config),
        }
    }

    pub fn is_joint_consensus(&self) -> bool {
        self.new_config.is_some()
    }

    /// Entries are replicated to every member of both configurations.
    pub fn all_members(&self) -> BTreeSet<MemberId> {
        let mut members = self.config.all_members();
        if let Some(new_config) = &self.new_config {
            members.extend(new_config.all_members());
        }

        members
    }

    pub fn is_member(&self, member_id: &MemberId) -> bool {
        if self.config.is_member(member_id) {
            return true;
        }
        match &self.new_config {
            Some(new_config) => new_config.is_member(member_id),
            None => false,
        }
    }

    /// Elections and commitment require separate majorities from both the old
    /// and the new configuration while in joint consensus.
    pub fn is_quorum(&self, members: &BTreeSet<MemberId>) -> bool {
        match &self.new_config {
            Some(new_config) => self.config.is_quorum(members) && new_config.is_quorum(members),
            None => self.config.is_quorum(members),
        }
    }

    /// A member from either configuration may serve as leader.
    pub fn is_valid_leader(&self, member_id: &MemberId) -> bool {
        if self.config.is_valid_leader(member_id) {
            return true;
        }
        match &self.new_config {
            Some(new_config) => new_config.is_valid_leader(member_id),
            None => false,
        }
    }
}
