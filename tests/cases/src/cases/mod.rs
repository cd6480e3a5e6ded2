pub mod joint_consensus;
pub mod partition;
pub mod replication;
pub mod single_member;
pub mod snapshot;
pub mod split_vote;
