//! Replica-set configuration

use crate::error::{Result, TopologyError};
use crate::member::HostAndPort;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Default period after which an unanswered heartbeat window is abandoned
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(10);

/// Static configuration for one replica-set member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberConfig {
    /// Stable member id, unique within the set and preserved across reconfigs
    pub id: i64,

    /// Network identity
    pub host: HostAndPort,

    /// Election priority; zero means the member never stands for election
    pub priority: f64,

    /// Voting weight in elections and majority checks
    pub votes: u32,

    /// Deliberate replication delay for this member
    pub slave_delay: Duration,

    /// Hidden members are skipped on the first sync-source pass
    pub hidden: bool,

    /// Arbiters vote but hold no data
    pub arbiter: bool,

    /// Whether this member builds indexes
    pub builds_indexes: bool,
}

impl MemberConfig {
    pub fn new(id: i64, host: HostAndPort) -> Self {
        Self {
            id,
            host,
            priority: 1.0,
            votes: 1,
            slave_delay: Duration::ZERO,
            hidden: false,
            arbiter: false,
            builds_indexes: true,
        }
    }

    pub fn with_priority(mut self, priority: f64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_votes(mut self, votes: u32) -> Self {
        self.votes = votes;
        self
    }

    pub fn with_slave_delay(mut self, delay: Duration) -> Self {
        self.slave_delay = delay;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    pub fn arbiter(mut self) -> Self {
        self.arbiter = true;
        self
    }

    pub fn without_indexes(mut self) -> Self {
        self.builds_indexes = false;
        self
    }

    /// Whether this member may ever stand for election.
    pub fn is_electable(&self) -> bool {
        !self.arbiter && self.priority > 0.0
    }

    pub fn is_voter(&self) -> bool {
        self.votes > 0
    }
}

/// Immutable snapshot of the replica-set configuration.
///
/// A default-constructed config is *uninitialized* (version 0); installing one
/// via the coordinator requires a built, validated config with version >= 1.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplSetConfig {
    set_name: String,
    version: i64,
    members: Vec<MemberConfig>,
    chaining_allowed: bool,
    heartbeat_timeout: Duration,
}

impl ReplSetConfig {
    /// Start building a configuration
    pub fn builder() -> ReplSetConfigBuilder {
        ReplSetConfigBuilder::new()
    }

    /// An uninitialized placeholder config (version 0, no members)
    pub fn uninitialized() -> Self {
        Self {
            set_name: String::new(),
            version: 0,
            members: Vec::new(),
            chaining_allowed: true,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.version > 0
    }

    pub fn set_name(&self) -> &str {
        &self.set_name
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn num_members(&self) -> usize {
        self.members.len()
    }

    pub fn members(&self) -> &[MemberConfig] {
        &self.members
    }

    pub fn member_at(&self, index: usize) -> &MemberConfig {
        &self.members[index]
    }

    pub fn is_chaining_allowed(&self) -> bool {
        self.chaining_allowed
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_timeout
    }

    pub fn find_member_index_by_host(&self, host: &HostAndPort) -> Option<usize> {
        self.members.iter().position(|m| &m.host == host)
    }

    pub fn find_member_index_by_id(&self, id: i64) -> Option<usize> {
        self.members.iter().position(|m| m.id == id)
    }

    pub fn find_member_by_id(&self, id: i64) -> Option<&MemberConfig> {
        self.members.iter().find(|m| m.id == id)
    }

    /// Sum of voting weights across the whole config
    pub fn total_votes(&self) -> u32 {
        self.members.iter().map(|m| m.votes).sum()
    }
}

/// Builder for [`ReplSetConfig`]
#[derive(Debug, Default)]
pub struct ReplSetConfigBuilder {
    set_name: Option<String>,
    version: i64,
    members: Vec<MemberConfig>,
    chaining_allowed: bool,
    heartbeat_timeout: Option<Duration>,
}

impl ReplSetConfigBuilder {
    pub fn new() -> Self {
        Self {
            chaining_allowed: true,
            version: 1,
            ..Default::default()
        }
    }

    pub fn set_name(mut self, name: impl Into<String>) -> Self {
        self.set_name = Some(name.into());
        self
    }

    pub fn version(mut self, version: i64) -> Self {
        self.version = version;
        self
    }

    pub fn member(mut self, member: MemberConfig) -> Self {
        self.members.push(member);
        self
    }

    pub fn chaining_allowed(mut self, allowed: bool) -> Self {
        self.chaining_allowed = allowed;
        self
    }

    pub fn heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Result<ReplSetConfig> {
        let set_name = self
            .set_name
            .filter(|n| !n.is_empty())
            .ok_or_else(|| TopologyError::InvalidConfig("replica set name is required".into()))?;

        if self.version < 1 {
            return Err(TopologyError::InvalidConfig(format!(
                "config version must be >= 1, got {}",
                self.version
            )));
        }
        if self.members.is_empty() {
            return Err(TopologyError::InvalidConfig(
                "config must have at least one member".into(),
            ));
        }

        let mut ids = HashSet::new();
        let mut hosts = HashSet::new();
        for member in &self.members {
            if !ids.insert(member.id) {
                return Err(TopologyError::InvalidConfig(format!(
                    "duplicate member id {}",
                    member.id
                )));
            }
            if !hosts.insert(member.host.clone()) {
                return Err(TopologyError::InvalidConfig(format!(
                    "duplicate member host {}",
                    member.host
                )));
            }
            if member.priority < 0.0 {
                return Err(TopologyError::InvalidConfig(format!(
                    "member {} has negative priority",
                    member.id
                )));
            }
        }

        if !self.members.iter().any(|m| m.is_voter()) {
            return Err(TopologyError::InvalidConfig(
                "config must have at least one voting member".into(),
            ));
        }

        Ok(ReplSetConfig {
            set_name,
            version: self.version,
            members: self.members,
            chaining_allowed: self.chaining_allowed,
            heartbeat_timeout: self.heartbeat_timeout.unwrap_or(DEFAULT_HEARTBEAT_TIMEOUT),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: i64, port: u16) -> MemberConfig {
        MemberConfig::new(id, HostAndPort::new("db", port))
    }

    #[test]
    fn test_builder_validation() {
        // Missing name
        assert!(ReplSetConfig::builder().member(member(0, 1)).build().is_err());

        // No members
        assert!(ReplSetConfig::builder().set_name("rs0").build().is_err());

        // Duplicate id
        let err = ReplSetConfig::builder()
            .set_name("rs0")
            .member(member(1, 1))
            .member(member(1, 2))
            .build()
            .unwrap_err();
        assert!(matches!(err, TopologyError::InvalidConfig(_)));

        // Duplicate host
        assert!(ReplSetConfig::builder()
            .set_name("rs0")
            .member(member(1, 1))
            .member(member(2, 1))
            .build()
            .is_err());

        // All members votes=0
        assert!(ReplSetConfig::builder()
            .set_name("rs0")
            .member(member(1, 1).with_votes(0))
            .build()
            .is_err());

        let config = ReplSetConfig::builder()
            .set_name("rs0")
            .version(3)
            .member(member(1, 1))
            .member(member(2, 2).with_votes(0))
            .build()
            .unwrap();
        assert!(config.is_initialized());
        assert_eq!(config.version(), 3);
        assert_eq!(config.total_votes(), 1);
        assert_eq!(config.find_member_index_by_id(2), Some(1));
        assert_eq!(
            config.find_member_index_by_host(&HostAndPort::new("db", 1)),
            Some(0)
        );
    }

    #[test]
    fn test_uninitialized_config() {
        let config = ReplSetConfig::uninitialized();
        assert!(!config.is_initialized());
        assert_eq!(config.num_members(), 0);
        assert_eq!(config.heartbeat_timeout(), DEFAULT_HEARTBEAT_TIMEOUT);
    }

    #[test]
    fn test_electability_flags() {
        assert!(member(0, 1).is_electable());
        assert!(!member(0, 1).arbiter().is_electable());
        assert!(!member(0, 1).with_priority(0.0).is_electable());
        assert!(!member(0, 1).with_votes(0).is_voter());
    }
}
