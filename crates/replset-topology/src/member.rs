//! Member identity, externally-visible member states, and per-peer heartbeat
//! bookkeeping.

use crate::error::TopologyError;
use crate::optime::{Date, OpTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Network identity of a replica-set member.
///
/// Hostnames are kept as strings; resolution is the transport's problem.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HostAndPort {
    host: String,
    port: u16,
}

impl HostAndPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for HostAndPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for HostAndPort {
    type Err = TopologyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| TopologyError::BadValue(format!("missing port in \"{}\"", s)))?;
        if host.is_empty() {
            return Err(TopologyError::BadValue(format!("missing host in \"{}\"", s)));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| TopologyError::BadValue(format!("invalid port in \"{}\"", s)))?;
        Ok(HostAndPort::new(host, port))
    }
}

/// Externally-visible state of a replica-set member.
///
/// The numeric codes are part of the status wire format and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemberState {
    Startup = 0,
    Primary = 1,
    Secondary = 2,
    Recovering = 3,
    Startup2 = 5,
    #[default]
    Unknown = 6,
    Arbiter = 7,
    Down = 8,
    Rollback = 9,
    Removed = 10,
}

impl MemberState {
    pub fn code(&self) -> i32 {
        *self as i32
    }

    pub fn is_primary(&self) -> bool {
        matches!(self, MemberState::Primary)
    }

    pub fn is_secondary(&self) -> bool {
        matches!(self, MemberState::Secondary)
    }

    /// Whether a member in this state can serve as a sync source.
    pub fn is_readable(&self) -> bool {
        matches!(self, MemberState::Primary | MemberState::Secondary)
    }

    pub fn is_removed(&self) -> bool {
        matches!(self, MemberState::Removed)
    }
}

impl fmt::Display for MemberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MemberState::Startup => "STARTUP",
            MemberState::Primary => "PRIMARY",
            MemberState::Secondary => "SECONDARY",
            MemberState::Recovering => "RECOVERING",
            MemberState::Startup2 => "STARTUP2",
            MemberState::Unknown => "UNKNOWN",
            MemberState::Arbiter => "ARBITER",
            MemberState::Down => "DOWN",
            MemberState::Rollback => "ROLLBACK",
            MemberState::Removed => "REMOVED",
        };
        f.write_str(s)
    }
}

/// Health of a peer as observed through heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Health {
    /// No heartbeat has completed yet
    #[default]
    Unknown,
    /// Last heartbeat window ended in failure
    Down,
    /// Last heartbeat succeeded
    Up,
}

impl Health {
    /// Numeric form used in status reporting (-1 unknown, 0 down, 1 up)
    pub fn as_f64(&self) -> f64 {
        match self {
            Health::Unknown => -1.0,
            Health::Down => 0.0,
            Health::Up => 1.0,
        }
    }
}

/// Everything we know about one configured member, learned from heartbeats.
///
/// One instance per member, parallel to the config's member list; the whole
/// vector is rebuilt whenever a configuration is installed so the
/// `config_index` invariant can never drift.
#[derive(Debug, Clone)]
pub struct MemberHeartbeatData {
    config_index: usize,
    health: Health,
    state: MemberState,
    op_time: OpTime,
    election_time: OpTime,
    up_since: Option<Date>,
    last_heartbeat: Option<Date>,
    last_heartbeat_recv: Option<Date>,
    last_heartbeat_msg: String,
    sync_source: Option<HostAndPort>,
    auth_issue: bool,
}

impl MemberHeartbeatData {
    pub fn new(config_index: usize) -> Self {
        Self {
            config_index,
            health: Health::Unknown,
            state: MemberState::Unknown,
            op_time: OpTime::ZERO,
            election_time: OpTime::ZERO,
            up_since: None,
            last_heartbeat: None,
            last_heartbeat_recv: None,
            last_heartbeat_msg: String::new(),
            sync_source: None,
            auth_issue: false,
        }
    }

    pub fn config_index(&self) -> usize {
        self.config_index
    }

    pub fn health(&self) -> Health {
        self.health
    }

    /// Confirmed reachable: the last completed heartbeat window succeeded.
    pub fn up(&self) -> bool {
        self.health == Health::Up
    }

    /// Not confirmed down: up, or never heard from at all.
    pub fn maybe_up(&self) -> bool {
        self.health != Health::Down
    }

    pub fn state(&self) -> MemberState {
        self.state
    }

    pub fn op_time(&self) -> OpTime {
        self.op_time
    }

    pub fn election_time(&self) -> OpTime {
        self.election_time
    }

    pub fn up_since(&self) -> Option<Date> {
        self.up_since
    }

    pub fn last_heartbeat(&self) -> Option<Date> {
        self.last_heartbeat
    }

    pub fn last_heartbeat_recv(&self) -> Option<Date> {
        self.last_heartbeat_recv
    }

    pub fn last_heartbeat_msg(&self) -> &str {
        &self.last_heartbeat_msg
    }

    pub fn sync_source(&self) -> Option<&HostAndPort> {
        self.sync_source.as_ref()
    }

    pub fn has_auth_issue(&self) -> bool {
        self.auth_issue
    }

    /// Record a successful heartbeat from this member.
    pub fn set_up_values(
        &mut self,
        now: Date,
        state: MemberState,
        election_time: OpTime,
        op_time: OpTime,
        sync_source: Option<HostAndPort>,
        heartbeat_msg: &str,
    ) {
        self.health = Health::Up;
        if self.up_since.is_none() {
            self.up_since = Some(now);
        }
        self.last_heartbeat = Some(now);
        self.auth_issue = false;
        self.state = state;
        self.election_time = election_time;
        self.op_time = op_time;
        self.sync_source = sync_source;
        self.last_heartbeat_msg = heartbeat_msg.to_owned();
    }

    /// Record a failed heartbeat window. The last known opTime is retained;
    /// `up()` gates every consumer that must ignore stale values.
    pub fn set_down_values(&mut self, now: Date, heartbeat_msg: &str) {
        self.health = Health::Down;
        self.up_since = None;
        self.last_heartbeat = Some(now);
        self.auth_issue = false;
        self.state = MemberState::Down;
        self.sync_source = None;
        self.last_heartbeat_msg = heartbeat_msg.to_owned();
    }

    /// Record an authentication failure against this member.
    pub fn set_auth_issue(&mut self, now: Date) {
        self.health = Health::Down;
        self.up_since = None;
        self.last_heartbeat = Some(now);
        self.auth_issue = true;
        self.state = MemberState::Unknown;
        self.sync_source = None;
        self.last_heartbeat_msg.clear();
    }

    /// Overwrite only the state, leaving heartbeat bookkeeping alone.
    /// Used for the self entry, which no heartbeat ever updates.
    pub fn set_state(&mut self, state: MemberState) {
        self.state = state;
    }

    pub fn set_last_heartbeat_recv(&mut self, now: Date) {
        self.last_heartbeat_recv = Some(now);
    }
}
