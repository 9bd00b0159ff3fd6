//! The topology coordinator - a deterministic, single-threaded state machine
//! that decides what role this node plays in its replica set.
//!
//! The coordinator consumes timestamped inputs (heartbeat responses, election
//! requests, configuration updates) and emits pure decisions: "become a
//! candidate", "ask that primary to step down", "reply with this vote". It
//! performs no I/O and never reads a clock; callers inject `now` with every
//! call, which makes the whole machine replayable under virtual time.
//!
//! All state lives behind one owner. Every public method assumes exclusive
//! access and completes without blocking, so processing order alone
//! determines the outcome.

use crate::config::{MemberConfig, ReplSetConfig};
use crate::error::{Result, TopologyError};
use crate::member::{HostAndPort, MemberHeartbeatData, MemberState};
use crate::optime::{Date, OpTime};
use crate::ping::PingStats;
use crate::protocol::{
    ElectArgs, ElectResponse, FreezeResponse, FreshArgs, FreshResponse, HeartbeatRequest,
    HeartbeatResponse, MemberStatus, ReplSetStatus, SyncFromResponse, PROTOCOL_VERSION,
};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Interval between the end of one heartbeat window and the start of the next
/// for a given target.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(2000);

/// Maximum number of retries for a failed heartbeat within one window.
pub const MAX_HEARTBEAT_RETRIES: u32 = 2;

/// How long a yes-vote binds this node before it may vote for a different
/// candidate.
pub const VOTE_LEASE: Duration = Duration::from_secs(30);

/// Default freshness floor for sync-source candidates.
pub const DEFAULT_MAX_SYNC_SOURCE_LAG: Duration = Duration::from_secs(30);

/// How far behind the latest known opTime a member may be and still count as
/// electable, in seconds.
const ELECTION_FRESHNESS_SECS: u64 = 10;

/// Unchanged heartbeat messages are re-logged at most this often.
const HB_MSG_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Identifier stamped on a won election, opaque to the coordinator.
pub type ElectionId = u64;

/// Disposition of the serial-executor callback that invoked a responder.
///
/// When the executor cancels a scheduled callback (shutdown), responders must
/// return [`TopologyError::ShutdownInProgress`] without touching any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallbackState {
    #[default]
    Active,
    Canceled,
}

impl CallbackState {
    pub fn is_canceled(&self) -> bool {
        matches!(self, CallbackState::Canceled)
    }
}

/// Which part this node currently plays in the election protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// Why a member cannot stand for election right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnelectableReason {
    /// A majority of voting members is not reachable (self only)
    CannotSeeMajority,
    /// The member is an arbiter
    ArbiterIAm,
    /// The member has priority zero
    NoPriority,
    /// A freeze or step-down period is still in effect (self only)
    StepDownPeriodActive,
    /// The member is not currently a secondary
    NotSecondary,
    /// The member's opTime is too far behind the most up-to-date member
    NotCloseEnoughToLatestOptime,
}

impl std::fmt::Display for UnelectableReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UnelectableReason::CannotSeeMajority => "I cannot see a majority",
            UnelectableReason::ArbiterIAm => "member is an arbiter",
            UnelectableReason::NoPriority => "member has zero priority",
            UnelectableReason::StepDownPeriodActive => {
                "I am still waiting for stepdown period to end"
            }
            UnelectableReason::NotSecondary => "member is not currently a secondary",
            UnelectableReason::NotCloseEnoughToLatestOptime => {
                "member is more than 10 seconds behind the most up-to-date member"
            }
        };
        f.write_str(s)
    }
}

/// What the caller should do after the coordinator ingests an input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyAction {
    /// Nothing to do
    NoAction,
    /// A peer advertised a newer configuration; fetch and install it
    Reconfig,
    /// This node became a candidate; run the election protocol
    StartElection,
    /// This node relinquished leadership; finish stepping down locally
    StepDownSelf,
    /// Ask the remote member at this config index to step down
    StepDownRemote(usize),
    /// This node stepped down and now recognizes the member at this config
    /// index as primary
    StepDownSelfAndReplaceWith(usize),
}

/// A [`TopologyAction`] plus the instant at which the next heartbeat to the
/// originating target should start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatResponseAction {
    action: TopologyAction,
    next_heartbeat_start: Option<Date>,
}

impl HeartbeatResponseAction {
    fn new(action: TopologyAction) -> Self {
        Self {
            action,
            next_heartbeat_start: None,
        }
    }

    fn with_next_heartbeat_start(mut self, when: Date) -> Self {
        self.next_heartbeat_start = Some(when);
        self
    }

    pub fn action(&self) -> TopologyAction {
        self.action
    }

    pub fn next_heartbeat_start(&self) -> Option<Date> {
        self.next_heartbeat_start
    }
}

/// Record of the last yes-vote this node cast.
#[derive(Debug, Clone)]
struct LastVote {
    when: Date,
    who_id: i64,
    who_host: HostAndPort,
}

/// The replica-set topology coordinator.
///
/// Single owner, no interior mutability: the caller serializes access.
#[derive(Debug)]
pub struct TopologyCoordinator {
    role: Role,
    /// Sub-state while `role` is [`Role::Follower`]; one of STARTUP2,
    /// SECONDARY, RECOVERING, ROLLBACK
    follower_mode: MemberState,
    config: ReplSetConfig,
    self_index: Option<usize>,
    /// One entry per configured member, parallel to the member list
    hbdata: Vec<MemberHeartbeatData>,
    current_primary_index: Option<usize>,
    election_time: OpTime,
    election_id: Option<ElectionId>,
    sync_source: Option<HostAndPort>,
    sync_source_blacklist: HashMap<HostAndPort, Date>,
    force_sync_source_index: Option<usize>,
    step_down_until: Date,
    maintenance_mode_calls: u32,
    pings: HashMap<HostAndPort, PingStats>,
    last_vote: Option<LastVote>,
    hb_msg: String,
    hb_msg_logged_at: Date,
    max_sync_source_lag: Duration,
}

impl Default for TopologyCoordinator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SYNC_SOURCE_LAG)
    }
}

impl TopologyCoordinator {
    /// Create a coordinator with no configuration installed.
    pub fn new(max_sync_source_lag: Duration) -> Self {
        let coordinator = Self {
            role: Role::Follower,
            follower_mode: MemberState::Startup2,
            config: ReplSetConfig::uninitialized(),
            self_index: None,
            hbdata: Vec::new(),
            current_primary_index: None,
            election_time: OpTime::ZERO,
            election_id: None,
            sync_source: None,
            sync_source_blacklist: HashMap::new(),
            force_sync_source_index: None,
            step_down_until: Date::ZERO,
            maintenance_mode_calls: 0,
            pings: HashMap::new(),
            last_vote: None,
            hb_msg: String::new(),
            hb_msg_logged_at: Date::ZERO,
            max_sync_source_lag,
        };
        assert_eq!(coordinator.member_state(), MemberState::Startup);
        coordinator
    }

    // ==================== Role & state view ====================

    pub fn role(&self) -> Role {
        self.role
    }

    /// The externally-visible member state, derived from role, follower
    /// sub-mode, configuration, and the maintenance counter.
    pub fn member_state(&self) -> MemberState {
        let Some(self_index) = self.self_index else {
            return if self.config.is_initialized() {
                MemberState::Removed
            } else {
                MemberState::Startup
            };
        };
        if self.role == Role::Leader {
            return MemberState::Primary;
        }
        if self.config.member_at(self_index).arbiter {
            return MemberState::Arbiter;
        }
        if self.maintenance_mode_calls > 0 && self.follower_mode == MemberState::Secondary {
            return MemberState::Recovering;
        }
        self.follower_mode
    }

    /// Switch the follower sub-mode. Only legal while a follower, and only
    /// to SECONDARY, RECOVERING, ROLLBACK, or STARTUP2.
    pub fn set_follower_mode(&mut self, mode: MemberState) {
        assert_eq!(self.role, Role::Follower, "follower mode requires follower role");
        assert!(
            matches!(
                mode,
                MemberState::Secondary
                    | MemberState::Recovering
                    | MemberState::Rollback
                    | MemberState::Startup2
            ),
            "{mode} is not a follower mode"
        );
        self.follower_mode = mode;
    }

    pub fn adjust_maintenance_count(&mut self, delta: i32) {
        assert_eq!(self.role, Role::Follower, "maintenance mode requires follower role");
        let updated = self.maintenance_mode_calls as i64 + delta as i64;
        assert!(updated >= 0, "maintenance count cannot go negative");
        self.maintenance_mode_calls = updated as u32;
    }

    pub fn maintenance_count(&self) -> u32 {
        self.maintenance_mode_calls
    }

    pub fn config(&self) -> &ReplSetConfig {
        &self.config
    }

    pub fn current_primary_index(&self) -> Option<usize> {
        self.current_primary_index
    }

    pub fn election_time(&self) -> OpTime {
        self.election_time
    }

    pub fn election_id(&self) -> Option<ElectionId> {
        self.election_id
    }

    pub fn step_down_time(&self) -> Date {
        self.step_down_until
    }

    /// Heartbeat bookkeeping for the member at `index`.
    pub fn member_data(&self, index: usize) -> &MemberHeartbeatData {
        &self.hbdata[index]
    }

    /// Hosts of all peers not confirmed down, for protocol broadcasts.
    pub fn maybe_up_hosts(&self) -> Vec<HostAndPort> {
        self.hbdata
            .iter()
            .filter(|data| Some(data.config_index()) != self.self_index)
            .filter(|data| data.maybe_up())
            .map(|data| self.config.member_at(data.config_index()).host.clone())
            .collect()
    }

    // ==================== Heartbeat scheduler ====================

    /// Build the next heartbeat request for `target`, returning the request
    /// and how long the caller should wait for a reply.
    ///
    /// Opens a fresh retry window when the previous one is exhausted (too
    /// many failures) or has outlived the configured heartbeat timeout.
    pub fn prepare_heartbeat_request(
        &mut self,
        now: Date,
        our_set_name: &str,
        target: &HostAndPort,
    ) -> (HeartbeatRequest, Duration) {
        let timeout_period = self.config.heartbeat_timeout();
        let stats = self.pings.entry(target.clone()).or_default();
        let mut already_elapsed = now.saturating_duration_since(stats.last_heartbeat_start_date());
        if stats.failures_since_last_start() > MAX_HEARTBEAT_RETRIES
            || already_elapsed >= timeout_period
        {
            stats.start(now);
            already_elapsed = Duration::ZERO;
        }

        let request = if self.config.is_initialized() {
            let (sender_host, sender_id) = match self.self_index {
                Some(index) => {
                    let me = self.config.member_at(index);
                    (Some(me.host.clone()), Some(me.id))
                }
                None => (None, None),
            };
            HeartbeatRequest {
                protocol_version: PROTOCOL_VERSION,
                check_empty: false,
                set_name: self.config.set_name().to_owned(),
                config_version: self.config.version(),
                sender_host,
                sender_id,
            }
        } else {
            HeartbeatRequest {
                protocol_version: PROTOCOL_VERSION,
                check_empty: false,
                set_name: our_set_name.to_owned(),
                config_version: 0,
                sender_host: None,
                sender_id: None,
            }
        };

        (request, timeout_period.saturating_sub(already_elapsed))
    }

    // ==================== Heartbeat ingestion ====================

    /// Ingest the outcome of a heartbeat to `target` and decide what to do.
    ///
    /// The returned action always carries the instant at which the next
    /// heartbeat to this target should start: immediately while the retry
    /// budget and timeout allow, otherwise one heartbeat interval from now.
    pub fn process_heartbeat_response(
        &mut self,
        now: Date,
        round_trip: Duration,
        target: &HostAndPort,
        response: Result<HeartbeatResponse>,
        my_last_op_applied: OpTime,
    ) -> HeartbeatResponseAction {
        let timeout_period = self.config.heartbeat_timeout();
        let stats = self.pings.entry(target.clone()).or_default();
        assert!(
            stats.last_heartbeat_start_date() != Date::ZERO,
            "heartbeat response from {target} without a prior request"
        );
        match &response {
            Err(_) => stats.miss(),
            Ok(hb) => {
                stats.hit(round_trip.as_millis() as u64);
                if hb.state_disagreement {
                    debug!(
                        "{} thinks that we are down because they cannot send us heartbeats",
                        target
                    );
                }
            }
        }

        let already_elapsed = now.saturating_duration_since(stats.last_heartbeat_start_date());
        let next_heartbeat_start = if stats.failures_since_last_start() <= MAX_HEARTBEAT_RETRIES
            && already_elapsed < timeout_period
        {
            if response.is_err() {
                debug!(
                    "bad heartbeat response from {}; trying again; retries left: {}; {}ms have already elapsed",
                    target,
                    MAX_HEARTBEAT_RETRIES - stats.failures_since_last_start(),
                    already_elapsed.as_millis()
                );
            }
            now
        } else {
            now + HEARTBEAT_INTERVAL
        };

        if let Ok(hb) = &response {
            if let Some(new_config) = &hb.config {
                if new_config.version() > self.config.version() {
                    return HeartbeatResponseAction::new(TopologyAction::Reconfig)
                        .with_next_heartbeat_start(next_heartbeat_start);
                }
                // The target may race us to a reconfig, or echo a version we
                // already have; neither requires action.
                if new_config.version() < self.config.version() {
                    debug!("config version from heartbeat was older than ours");
                } else {
                    trace!("config from heartbeat response was same as ours");
                }
            }
        }

        let Some(member_index) = self.config.find_member_index_by_host(target) else {
            debug!("could not find {} in current config so ignoring the heartbeat", target);
            return HeartbeatResponseAction::new(TopologyAction::NoAction)
                .with_next_heartbeat_start(next_heartbeat_start);
        };

        match response {
            Err(TopologyError::Unauthorized(_)) => {
                self.hbdata[member_index].set_auth_issue(now);
            }
            Err(err) => {
                self.hbdata[member_index].set_down_values(now, &err.to_string());
            }
            Ok(hb) => {
                let existing = &self.hbdata[member_index];
                let state = hb.state.unwrap_or(MemberState::Unknown);
                let election_time = hb.election_time.unwrap_or(existing.election_time());
                let op_time = hb.op_time.unwrap_or(existing.op_time());
                self.hbdata[member_index].set_up_values(
                    now,
                    state,
                    election_time,
                    op_time,
                    hb.syncing_to.clone(),
                    &hb.hb_msg,
                );
            }
        }

        self.update_heartbeat_data(member_index, now, my_last_op_applied)
            .with_next_heartbeat_start(next_heartbeat_start)
    }

    // ==================== Primary reconciliation ====================

    /// Reconcile our notion of who is primary after the entry at
    /// `updated_index` changed, then consider standing for election.
    fn update_heartbeat_data(
        &mut self,
        updated_index: usize,
        now: Date,
        last_op_applied: OpTime,
    ) -> HeartbeatResponseAction {
        assert_ne!(
            Some(updated_index),
            self.self_index,
            "heartbeat data for self is never updated from the network"
        );

        // Phase 1: agree on which member, if any, is primary.

        // If the updated member is the one we think is primary, confirm the
        // update still supports that belief.
        if Some(updated_index) == self.current_primary_index {
            let updated = &self.hbdata[updated_index];
            if !updated.up() || !updated.state().is_primary() {
                self.current_primary_index = None;
            }
        }

        // A sufficiently fresh member with strictly higher priority than the
        // current primary displaces it.
        if let Some(primary_index) = self.current_primary_index {
            if let Some(highest_index) = self.highest_priority_electable_index() {
                let primary = self.config.member_at(primary_index);
                let highest = self.config.member_at(highest_index);
                let highest_op_time = self.hbdata[highest_index].op_time();
                if highest.priority > primary.priority
                    && self.op_time_close_enough_to_latest_to_elect(highest_op_time)
                {
                    info!(
                        "stepping down {} (priority {}), {} is priority {} and {} seconds behind",
                        primary.host,
                        primary.priority,
                        highest.host,
                        highest.priority,
                        self.latest_known_op_time().secs.saturating_sub(highest_op_time.secs)
                    );
                    if self.i_am_primary() {
                        return self.step_down_self();
                    }
                    self.current_primary_index = None;
                    return HeartbeatResponseAction::new(TopologyAction::StepDownRemote(
                        primary_index,
                    ));
                }
            }
        }

        // Scan the peers for anyone claiming to be primary.
        let mut remote_primary_index: Option<usize> = None;
        for (index, data) in self.hbdata.iter().enumerate() {
            if Some(index) == self.self_index {
                continue;
            }
            if data.state().is_primary() && data.up() {
                if remote_primary_index.is_some() {
                    // Two remote primaries at once happens transiently while
                    // heartbeats race a step-down; wait for things to settle.
                    info!("two remote primaries (transiently)");
                    return HeartbeatResponseAction::new(TopologyAction::NoAction);
                }
                remote_primary_index = Some(index);
            }
        }

        if let Some(remote_index) = remote_primary_index {
            if self.current_primary_index == Some(remote_index) {
                return HeartbeatResponseAction::new(TopologyAction::NoAction);
            }
            self.set_hb_msg(now, "");

            if self.i_am_primary() {
                // Two primaries; the one elected earlier steps down.
                let remote_election_time = self.hbdata[remote_index].election_time();
                info!(
                    "another primary seen with election time {}; my election time is {}",
                    remote_election_time, self.election_time
                );
                if remote_election_time > self.election_time {
                    info!("stepping down; another primary was elected more recently");
                    return self.step_down_self_and_replace_with(Some(remote_index));
                }
                info!("another primary detected; it should step down, it was elected earlier than me");
                return HeartbeatResponseAction::new(TopologyAction::StepDownRemote(remote_index));
            }

            self.current_primary_index = Some(remote_index);
            return HeartbeatResponseAction::new(TopologyAction::NoAction);
        }

        // Phase 2: no remote claims to be primary; consider candidacy.

        if self.i_am_primary() {
            if self.my_unelectable_reason(now, last_op_applied)
                == Some(UnelectableReason::CannotSeeMajority)
            {
                warn!("can't see a majority of the set, relinquishing primary");
                return self.step_down_self();
            }
            return HeartbeatResponseAction::new(TopologyAction::NoAction);
        }

        assert!(
            self.current_primary_index.is_none(),
            "no remote primary and not primary ourselves, yet a primary index remains"
        );

        if self.role == Role::Candidate {
            return HeartbeatResponseAction::new(TopologyAction::NoAction);
        }
        if self.my_unelectable_reason(now, last_op_applied).is_some() {
            return HeartbeatResponseAction::new(TopologyAction::NoAction);
        }

        self.role = Role::Candidate;
        HeartbeatResponseAction::new(TopologyAction::StartElection)
    }

    /// Why this node cannot stand for election right now, or `None` if it can.
    pub fn my_unelectable_reason(&self, now: Date, last_applied: OpTime) -> Option<UnelectableReason> {
        if !self.majority_seems_up() {
            return Some(UnelectableReason::CannotSeeMajority);
        }
        let Some(self_index) = self.self_index else {
            // Removed from the config; nothing to elect.
            return Some(UnelectableReason::NotSecondary);
        };
        let me = self.config.member_at(self_index);
        if me.arbiter {
            Some(UnelectableReason::ArbiterIAm)
        } else if me.priority <= 0.0 {
            Some(UnelectableReason::NoPriority)
        } else if self.step_down_until > now {
            Some(UnelectableReason::StepDownPeriodActive)
        } else if !self.member_state().is_secondary() {
            Some(UnelectableReason::NotSecondary)
        } else if !self.op_time_close_enough_to_latest_to_elect(last_applied) {
            Some(UnelectableReason::NotCloseEnoughToLatestOptime)
        } else {
            None
        }
    }

    /// Why the member at `index` cannot stand for election, judged from its
    /// heartbeat data, or `None` if it looks electable.
    fn unelectable_reason(&self, index: usize) -> Option<UnelectableReason> {
        let member = self.config.member_at(index);
        let data = &self.hbdata[index];
        if member.arbiter {
            Some(UnelectableReason::ArbiterIAm)
        } else if member.priority <= 0.0 {
            Some(UnelectableReason::NoPriority)
        } else if data.state() != MemberState::Secondary {
            Some(UnelectableReason::NotSecondary)
        } else if !self.op_time_close_enough_to_latest_to_elect(data.op_time()) {
            Some(UnelectableReason::NotCloseEnoughToLatestOptime)
        } else {
            None
        }
    }

    fn majority_seems_up(&self) -> bool {
        let up_votes: u64 = self
            .hbdata
            .iter()
            .filter(|data| data.up())
            .map(|data| u64::from(self.config.member_at(data.config_index()).votes))
            .sum();
        2 * up_votes > u64::from(self.config.total_votes())
    }

    fn op_time_close_enough_to_latest_to_elect(&self, op_time: OpTime) -> bool {
        let latest_secs = self.latest_known_op_time().secs;
        latest_secs != 0 && op_time.secs >= latest_secs.saturating_sub(ELECTION_FRESHNESS_SECS)
    }

    /// The newest opTime reported by any reachable member.
    fn latest_known_op_time(&self) -> OpTime {
        self.hbdata
            .iter()
            .filter(|data| data.up())
            .map(|data| data.op_time())
            .max()
            .unwrap_or(OpTime::ZERO)
    }

    /// Index of the electable member with the highest priority, ties going
    /// to the lowest config index.
    fn highest_priority_electable_index(&self) -> Option<usize> {
        let mut max_index: Option<usize> = None;
        for index in 0..self.config.num_members() {
            if self.unelectable_reason(index).is_some() {
                continue;
            }
            let higher = match max_index {
                None => true,
                Some(current) => {
                    self.config.member_at(index).priority > self.config.member_at(current).priority
                }
            };
            if higher {
                max_index = Some(index);
            }
        }
        max_index
    }

    fn i_am_primary(&self) -> bool {
        if self.role == Role::Leader {
            assert_eq!(
                self.current_primary_index, self.self_index,
                "a leader must consider itself primary"
            );
            true
        } else {
            false
        }
    }

    fn self_config(&self) -> &MemberConfig {
        let index = self
            .self_index
            .expect("operation requires this node to be in the replica set config");
        self.config.member_at(index)
    }

    // ==================== Sync-source selection ====================

    /// Pick a member to replicate from, or `None` if no peer qualifies.
    pub fn choose_new_sync_source(&mut self, now: Date, last_op_applied: OpTime) -> Option<HostAndPort> {
        let Some(self_index) = self.self_index else {
            self.sync_source = None;
            return None;
        };

        // A caller-requested target wins outright and is consumed here.
        if let Some(forced_index) = self.force_sync_source_index.take() {
            assert!(forced_index < self.config.num_members());
            let host = self.config.member_at(forced_index).host.clone();
            self.sync_source = Some(host.clone());
            self.set_hb_msg(now, &format!("syncing from: {} by request", host));
            return Some(host);
        }

        // Wait for two full rounds of pings from the other members so the
        // latency estimates mean something.
        let need_more_pings =
            (self.hbdata.len() as i64 - 1) * 2 - self.total_ping_count() as i64;
        if need_more_pings > 0 {
            info!("waiting for {} pings from other members before syncing", need_more_pings);
            self.sync_source = None;
            return None;
        }

        if !self.config.is_chaining_allowed() {
            match self.current_primary_index {
                None => {
                    self.sync_source = None;
                    return None;
                }
                Some(primary_index) => {
                    let host = self.config.member_at(primary_index).host.clone();
                    self.sync_source = Some(host.clone());
                    return Some(host);
                }
            }
        }

        // Reject candidates more than max_sync_source_lag behind the
        // primary. Without a known primary opTime (e.g. right after an
        // election), use a floor that excludes nobody.
        let max_lag_secs = self.max_sync_source_lag.as_secs();
        let mut primary_op_time = match self.current_primary_index {
            Some(primary_index) => self.hbdata[primary_index].op_time(),
            None => OpTime::new(max_lag_secs, 0),
        };
        if primary_op_time.secs < max_lag_secs {
            primary_op_time = OpTime::new(max_lag_secs, 0);
        }
        let oldest_sync_op_time = OpTime::new(primary_op_time.secs - max_lag_secs, 0);

        let self_builds_indexes = self.config.member_at(self_index).builds_indexes;
        let self_slave_delay = self.config.member_at(self_index).slave_delay;

        // Two passes: the first skips slave-delayed, hidden, and excessively
        // lagged members; the second admits them in case nothing else is
        // reachable.
        let mut closest_index: Option<usize> = None;
        for attempt in 0..2 {
            for index in 0..self.hbdata.len() {
                if index == self_index {
                    continue;
                }
                if !self.hbdata[index].up() {
                    continue;
                }
                if !self.hbdata[index].state().is_readable() {
                    continue;
                }
                let candidate = self.config.member_at(index);
                if self_builds_indexes && !candidate.builds_indexes {
                    continue;
                }
                if self.hbdata[index].state() == MemberState::Secondary {
                    // Only secondaries that are ahead of us are useful.
                    if self.hbdata[index].op_time() <= last_op_applied {
                        continue;
                    }
                    if attempt == 0 && self.hbdata[index].op_time() < oldest_sync_op_time {
                        continue;
                    }
                }
                if let Some(current) = closest_index {
                    let candidate_ping = self.ping_millis(&self.config.member_at(index).host);
                    let current_ping = self.ping_millis(&self.config.member_at(current).host);
                    if candidate_ping > current_ping {
                        continue;
                    }
                }
                if attempt == 0
                    && (self_slave_delay < self.config.member_at(index).slave_delay
                        || self.config.member_at(index).hidden)
                {
                    continue;
                }
                let host = self.config.member_at(index).host.clone();
                if let Some(&until) = self.sync_source_blacklist.get(&host) {
                    if until > now {
                        debug!(
                            "not syncing from {}, it is blacklisted for {}ms more",
                            host,
                            until.saturating_duration_since(now).as_millis()
                        );
                        continue;
                    }
                    self.sync_source_blacklist.remove(&host);
                }
                closest_index = Some(index);
            }
            if closest_index.is_some() {
                break;
            }
        }

        let Some(closest) = closest_index else {
            self.sync_source = None;
            return None;
        };
        let host = self.config.member_at(closest).host.clone();
        self.sync_source = Some(host.clone());
        self.set_hb_msg(now, &format!("syncing to: {}", host));
        Some(host)
    }

    /// Exclude `host` from sync-source candidacy until `until`.
    pub fn blacklist_sync_source(&mut self, host: HostAndPort, until: Date) {
        debug!("blacklisting {} until {}", host, until);
        self.sync_source_blacklist.insert(host, until);
    }

    pub fn sync_source_address(&self) -> Option<&HostAndPort> {
        self.sync_source.as_ref()
    }

    /// Force the next sync-source choice to the member at `index`.
    pub fn set_force_sync_source_index(&mut self, index: usize) {
        assert!(index < self.config.num_members());
        self.force_sync_source_index = Some(index);
    }

    fn total_ping_count(&self) -> u64 {
        self.pings.values().map(|stats| stats.count()).sum()
    }

    fn ping_millis(&self, host: &HostAndPort) -> u64 {
        self.pings.get(host).map(|stats| stats.millis()).unwrap_or(u64::MAX)
    }

    // ==================== Command responders ====================

    /// Answer a sync-from command: validate `target` and, if acceptable,
    /// arrange for the next sync-source choice to pick it.
    pub fn prepare_sync_from_response(
        &mut self,
        cb: CallbackState,
        target: &HostAndPort,
        last_op_applied: OpTime,
    ) -> Result<SyncFromResponse> {
        if cb.is_canceled() {
            return Err(TopologyError::ShutdownInProgress);
        }

        let self_config = self.self_config();
        if self_config.arbiter {
            return Err(TopologyError::NotSecondary("arbiters don't sync".into()));
        }
        if self.self_index == self.current_primary_index {
            return Err(TopologyError::NotSecondary("primaries don't sync".into()));
        }

        let Some(target_index) = self.config.find_member_index_by_host(target) else {
            return Err(TopologyError::NodeNotFound(format!(
                "could not find member \"{}\" in replica set",
                target
            )));
        };
        if Some(target_index) == self.self_index {
            return Err(TopologyError::InvalidOptions("I cannot sync from myself".into()));
        }
        let target_config = self.config.member_at(target_index);
        if target_config.arbiter {
            return Err(TopologyError::InvalidOptions(format!(
                "cannot sync from \"{}\" because it is an arbiter",
                target
            )));
        }
        if !target_config.builds_indexes && self.self_config().builds_indexes {
            return Err(TopologyError::InvalidOptions(format!(
                "cannot sync from \"{}\" because it does not build indexes",
                target
            )));
        }

        let target_data = &self.hbdata[target_index];
        if target_data.has_auth_issue() {
            return Err(TopologyError::Unauthorized(format!(
                "not authorized to communicate with {}",
                target
            )));
        }
        if !target_data.maybe_up() {
            return Err(TopologyError::HostUnreachable(format!(
                "I cannot reach the requested member: {}",
                target
            )));
        }

        let mut response = SyncFromResponse {
            sync_from_requested: target.clone(),
            prev_sync_target: self.sync_source.clone(),
            warning: None,
        };
        if target_data.op_time().secs + 10 < last_op_applied.secs {
            warn!(
                "attempting to sync from {}, but its latest opTime is {} and ours is {} so this may not work",
                target,
                target_data.op_time().secs,
                last_op_applied.secs
            );
            response.warning = Some(format!(
                "requested member \"{}\" is more than 10 seconds behind us",
                target
            ));
        }

        self.set_force_sync_source_index(target_index);
        Ok(response)
    }

    // ==================== Election protocol replies ====================

    /// Answer a `fresh` challenge from a would-be candidate.
    pub fn prepare_fresh_response(
        &mut self,
        cb: CallbackState,
        args: &FreshArgs,
        last_op_applied: OpTime,
    ) -> Result<FreshResponse> {
        if cb.is_canceled() {
            return Err(TopologyError::ShutdownInProgress);
        }
        if args.set_name != self.config.set_name() {
            return Err(TopologyError::ReplicaSetNotFound {
                expected: self.config.set_name().to_owned(),
                received: args.set_name.clone(),
            });
        }

        let mut fresher = false;
        let mut info = None;
        if self.config.version() > args.config_version {
            info!(
                "member {} is not yet aware its config version {} is stale",
                args.who, args.config_version
            );
            info = Some("config version stale".to_owned());
            fresher = true;
        } else if args.op_time < last_op_applied || args.op_time < self.latest_known_op_time() {
            // Not only our own opTime counts; any member we can reach does.
            fresher = true;
        }

        let errmsg = self.should_veto_member(args.id, last_op_applied);
        Ok(FreshResponse {
            op_time: last_op_applied,
            fresher,
            veto: errmsg.is_some(),
            errmsg,
            info,
        })
    }

    /// Veto rationale for the member with id `member_id` standing for
    /// election, or `None` to let it proceed.
    fn should_veto_member(&self, member_id: i64, last_op_applied: OpTime) -> Option<String> {
        let Some(hopeful_index) = self.config.find_member_index_by_id(member_id) else {
            return Some(format!("couldn't find member with id {}", member_id));
        };
        let hopeful_host = &self.config.member_at(hopeful_index).host;

        if self.i_am_primary() && last_op_applied >= self.hbdata[hopeful_index].op_time() {
            // Our own heartbeat entry is not refreshed while we are primary,
            // so judge our freshness from the caller-supplied opTime.
            return Some(format!(
                "I am already primary, {} can try again once I've stepped down",
                hopeful_host
            ));
        }

        if let Some(primary_index) = self.current_primary_index {
            if primary_index != hopeful_index
                && self.hbdata[primary_index].op_time() >= self.hbdata[hopeful_index].op_time()
            {
                return Some(format!(
                    "{} is trying to elect itself but {} is already primary and more up-to-date",
                    hopeful_host,
                    self.config.member_at(primary_index).host
                ));
            }
        }

        if let Some(highest_index) = self.highest_priority_electable_index() {
            let hopeful = self.config.member_at(hopeful_index);
            let highest = self.config.member_at(highest_index);
            if highest.priority > hopeful.priority {
                return Some(format!(
                    "{} has lower priority of {} than {} which has a priority of {}",
                    hopeful.host, hopeful.priority, highest.host, highest.priority
                ));
            }
        }

        if let Some(reason) = self.unelectable_reason(hopeful_index) {
            return Some(format!(
                "I don't think {} is electable because the {}",
                hopeful_host, reason
            ));
        }

        None
    }

    /// Answer an `elect` request with a vote.
    pub fn prepare_elect_response(
        &mut self,
        cb: CallbackState,
        args: &ElectArgs,
        now: Date,
    ) -> Result<ElectResponse> {
        if cb.is_canceled() {
            return Err(TopologyError::ShutdownInProgress);
        }

        let my_version = self.config.version();
        let hopeful_index = self.config.find_member_index_by_id(args.who_id);
        let hopeful_host = hopeful_index.map(|index| self.config.member_at(index).host.clone());

        let mut vote: i64 = 0;
        if args.set_name != self.config.set_name() {
            warn!(
                "received an elect request for '{}' but our set name is '{}'",
                args.set_name,
                self.config.set_name()
            );
        } else if args.config_version > my_version {
            vote = -10000;
            warn!(
                "not voting for member {}: their config version {} is newer than ours ({})",
                args.who_id, args.config_version, my_version
            );
        } else if args.config_version < my_version {
            // They are stale but harmless; abstain and let the reconfig
            // propagate to them.
            info!(
                "received stale config version during election; our version: {}, theirs: {}",
                my_version, args.config_version
            );
        } else if hopeful_host.is_none() {
            vote = -10000;
            warn!("couldn't find member with id {}", args.who_id);
        } else if self.i_am_primary() {
            vote = -10000;
            info!(
                "I am already primary, {} can try again once I've stepped down",
                hopeful_host.as_ref().unwrap()
            );
        } else if let Some(primary_index) = self.current_primary_index {
            vote = -10000;
            info!(
                "{} is trying to elect itself but {} is already primary",
                hopeful_host.as_ref().unwrap(),
                self.config.member_at(primary_index).host
            );
        } else if self
            .highest_priority_electable_index()
            .is_some_and(|highest_index| {
                self.config.member_at(highest_index).priority
                    > self.config.member_at(hopeful_index.unwrap()).priority
            })
        {
            vote = -10000;
            info!(
                "{} has lower priority than another electable member",
                hopeful_host.as_ref().unwrap()
            );
        } else if let Some(last_vote) = self.last_vote.as_ref().filter(|last_vote| {
            now.saturating_duration_since(last_vote.when) < VOTE_LEASE
                && last_vote.who_id != args.who_id
        }) {
            info!(
                "voting no for {}; voted for {} {} secs ago",
                hopeful_host.as_ref().unwrap(),
                last_vote.who_host,
                now.saturating_duration_since(last_vote.when).as_secs()
            );
        } else {
            let host = hopeful_host.clone().unwrap();
            self.last_vote = Some(LastVote {
                when: now,
                who_id: args.who_id,
                who_host: host.clone(),
            });
            vote = i64::from(self.self_config().votes);
            info!("voting yea for {} ({})", host, args.who_id);
        }

        Ok(ElectResponse {
            vote,
            round: args.round,
        })
    }

    /// Cast a vote for ourselves, subject to the same lease as votes for
    /// anyone else. Returns whether the vote was cast.
    pub fn vote_for_myself(&mut self, now: Date) -> bool {
        let me = self.self_config();
        let my_id = me.id;
        let my_host = me.host.clone();
        if let Some(last_vote) = self.last_vote.as_ref().filter(|last_vote| {
            now.saturating_duration_since(last_vote.when) < VOTE_LEASE
                && last_vote.who_id != my_id
        }) {
            info!(
                "not voting yea for {}; voted for {} {} secs ago",
                my_id,
                last_vote.who_host,
                now.saturating_duration_since(last_vote.when).as_secs()
            );
            return false;
        }
        self.last_vote = Some(LastVote {
            when: now,
            who_id: my_id,
            who_host: my_host,
        });
        true
    }

    // ==================== Heartbeat response construction ====================

    /// Answer a peer's heartbeat request.
    pub fn prepare_heartbeat_response(
        &mut self,
        cb: CallbackState,
        now: Date,
        args: &HeartbeatRequest,
        our_set_name: &str,
        last_op_applied: OpTime,
    ) -> Result<HeartbeatResponse> {
        if cb.is_canceled() {
            return Err(TopologyError::ShutdownInProgress);
        }
        if args.protocol_version != PROTOCOL_VERSION {
            return Err(TopologyError::BadValue(format!(
                "incompatible replset protocol version: {}",
                args.protocol_version
            )));
        }
        if our_set_name != args.set_name {
            warn!(
                "replica set names do not match, ours: {}; remote node's: {}",
                our_set_name, args.set_name
            );
            return Err(TopologyError::MismatchedSetName {
                ours: our_set_name.to_owned(),
                remote: args.set_name.clone(),
            });
        }
        if self.config.set_name() != args.set_name {
            return Err(TopologyError::MismatchedSetName {
                ours: self.config.set_name().to_owned(),
                remote: args.set_name.clone(),
            });
        }

        let my_state = self.member_state();
        let mut response = HeartbeatResponse {
            set_name: Some(self.config.set_name().to_owned()),
            state: Some(my_state),
            election_time: None,
            electable: Some(self.my_unelectable_reason(now, last_op_applied).is_none()),
            hb_msg: self.hb_msg.clone(),
            time: now.as_secs(),
            op_time: Some(last_op_applied),
            syncing_to: self.sync_source.clone(),
            config_version: self.config.version(),
            config: None,
            state_disagreement: false,
            mismatched: false,
        };
        if my_state.is_primary() {
            let self_index = self.self_index.expect("a primary is always in its config");
            response.election_time = Some(self.hbdata[self_index].election_time());
        }
        // Deliver our config if the caller's is older.
        if self.config.version() > args.config_version {
            response.config = Some(self.config.clone());
        }

        // Resolve the sender in our member list; ids are only comparable
        // when both sides run the same config version.
        let sender_index = if self.config.version() == args.config_version {
            args.sender_id
                .and_then(|id| self.config.find_member_index_by_id(id))
        } else {
            None
        };
        if let Some(from) = sender_index {
            // If we thought the sender was down, let it know.
            if !self.hbdata[from].up() {
                response.state_disagreement = true;
            }
            self.hbdata[from].set_last_heartbeat_recv(now);
        }

        Ok(response)
    }

    // ==================== Status & freeze ====================

    /// Produce the whole-set status report.
    pub fn prepare_status_response(
        &mut self,
        cb: CallbackState,
        now: Date,
        self_uptime: Duration,
        last_op_applied: OpTime,
    ) -> Result<ReplSetStatus> {
        if cb.is_canceled() {
            return Err(TopologyError::ShutdownInProgress);
        }

        let my_state = self.member_state();
        let mut members = Vec::with_capacity(self.hbdata.len());
        for data in &self.hbdata {
            let index = data.config_index();
            let member = self.config.member_at(index);
            let entry = if Some(index) == self.self_index {
                MemberStatus {
                    id: member.id,
                    name: member.host.to_string(),
                    health: 1.0,
                    state: data.state().code(),
                    state_str: data.state().to_string(),
                    uptime: Some(self_uptime.as_secs()),
                    op_time: (!member.arbiter).then_some(last_op_applied),
                    maintenance_mode: (self.maintenance_mode_calls > 0)
                        .then_some(self.maintenance_mode_calls),
                    info_message: (!self.hb_msg.is_empty()).then(|| self.hb_msg.clone()),
                    election_time: data.state().is_primary().then(|| data.election_time()),
                    is_self: Some(true),
                    ..Default::default()
                }
            } else {
                let mut entry = MemberStatus {
                    id: member.id,
                    name: member.host.to_string(),
                    health: data.health().as_f64(),
                    state: data.state().code(),
                    state_str: if data.health() == crate::member::Health::Down {
                        // Stale state info would only confuse the reader.
                        "(not reachable/healthy)".to_owned()
                    } else {
                        data.state().to_string()
                    },
                    ..Default::default()
                };
                if data.state() != MemberState::Unknown {
                    entry.uptime = Some(
                        data.up_since()
                            .map(|since| now.saturating_duration_since(since).as_secs())
                            .unwrap_or(0),
                    );
                    entry.op_time = (!member.arbiter).then_some(data.op_time());
                    entry.last_heartbeat = data.last_heartbeat();
                    entry.last_heartbeat_recv = data.last_heartbeat_recv();
                    let ping = self.ping_millis(&member.host);
                    if ping != u64::MAX {
                        entry.ping_ms = Some(ping);
                    }
                    if !data.last_heartbeat_msg().is_empty() {
                        entry.last_heartbeat_message = Some(data.last_heartbeat_msg().to_owned());
                    }
                    if data.has_auth_issue() {
                        entry.authenticated = Some(false);
                    }
                    entry.syncing_to = data.sync_source().map(|host| host.to_string());
                    if data.state().is_primary() {
                        entry.election_time = Some(data.election_time());
                    }
                }
                entry
            };
            members.push(entry);
        }

        members.sort_by_cached_key(|member| serde_json::to_string(member).unwrap_or_default());

        let syncing_to = (!my_state.is_primary() && !my_state.is_removed())
            .then(|| self.sync_source.as_ref().map(|host| host.to_string()))
            .flatten();

        Ok(ReplSetStatus {
            set: self.config.set_name().to_owned(),
            date: now,
            my_state: my_state.code(),
            syncing_to,
            members,
        })
    }

    /// Answer a freeze command. `secs == 0` lifts the freeze; any other value
    /// refuses candidacy for that long, unless we are primary.
    pub fn prepare_freeze_response(
        &mut self,
        cb: CallbackState,
        now: Date,
        secs: u64,
    ) -> Result<FreezeResponse> {
        if cb.is_canceled() {
            return Err(TopologyError::ShutdownInProgress);
        }

        let mut response = FreezeResponse::default();
        if secs == 0 {
            self.step_down_until = now;
            info!("'unfreezing'");
            response.info = Some("unfreezing".to_owned());
        } else {
            if secs == 1 {
                response.warning = Some("you really want to freeze for only 1 second?".to_owned());
            }
            if !self.i_am_primary() {
                self.set_step_down_time(now + Duration::from_secs(secs));
                info!("'freezing' for {} seconds", secs);
            } else {
                info!("received freeze command but we are primary");
            }
        }
        Ok(response)
    }

    /// Push the earliest instant of renewed candidacy forward; it never moves
    /// backward.
    pub fn set_step_down_time(&mut self, new_time: Date) {
        assert!(
            new_time > self.step_down_until,
            "step-down time may only advance"
        );
        self.step_down_until = new_time;
    }

    // ==================== Configuration apply ====================

    /// Install a new configuration and rebuild all per-member bookkeeping.
    ///
    /// Always lands in Follower, except that the sole electable member of a
    /// one-node set becomes a candidate immediately, in lieu of heartbeats.
    pub fn update_config(
        &mut self,
        new_config: ReplSetConfig,
        self_index: Option<usize>,
        now: Date,
        last_op_applied: OpTime,
    ) {
        assert_ne!(self.role, Role::Candidate, "cannot install a config mid-election");
        if let Some(index) = self_index {
            assert!(index < new_config.num_members(), "self index out of range");
        }

        let total_votes = new_config.total_votes();
        if total_votes > 0 && total_votes % 2 == 0 {
            warn!(
                "even number of voting members in replica set config - add an arbiter or set \
                 votes to 0 on one of the existing members"
            );
        }

        self.config = new_config;
        self.self_index = self_index;
        self.role = Role::Follower;
        self.current_primary_index = None;
        self.force_sync_source_index = None;

        self.hbdata = (0..self.config.num_members())
            .map(MemberHeartbeatData::new)
            .collect();
        if let Some(index) = self_index {
            // The self entry must read as up for vote counting; no heartbeat
            // will ever refresh it.
            let state = self.member_state();
            self.hbdata[index].set_up_values(now, state, OpTime::ZERO, last_op_applied, None, "");
        }

        if self.config.num_members() == 1
            && self_index == Some(0)
            && self.config.member_at(0).is_electable()
        {
            self.role = Role::Candidate;
        }
    }

    // ==================== Win/lose election hooks ====================

    /// Take leadership after winning an election.
    pub fn process_win_election(
        &mut self,
        now: Date,
        election_id: ElectionId,
        my_last_op_applied: OpTime,
        election_op_time: OpTime,
    ) {
        assert_eq!(self.role, Role::Candidate, "only candidates win elections");
        let self_index = self
            .self_index
            .expect("a candidate is always in its config");
        self.election_time = election_op_time;
        self.election_id = Some(election_id);
        self.role = Role::Leader;
        self.current_primary_index = Some(self_index);
        self.hbdata[self_index].set_up_values(
            now,
            MemberState::Primary,
            election_op_time,
            my_last_op_applied,
            None,
            "",
        );
    }

    /// Return to following after losing an election.
    pub fn process_lose_election(&mut self, now: Date, my_last_op_applied: OpTime) {
        assert_eq!(self.role, Role::Candidate, "only candidates lose elections");
        let self_index = self
            .self_index
            .expect("a candidate is always in its config");
        let sync_source = self.sync_source.clone();
        self.election_time = OpTime::ZERO;
        self.election_id = None;
        self.role = Role::Follower;
        let state = self.member_state();
        self.hbdata[self_index].set_up_values(
            now,
            state,
            OpTime::ZERO,
            my_last_op_applied,
            sync_source,
            "",
        );
    }

    /// Relinquish leadership voluntarily.
    pub fn step_down(&mut self) -> HeartbeatResponseAction {
        self.step_down_self()
    }

    fn step_down_self(&mut self) -> HeartbeatResponseAction {
        self.step_down_self_and_replace_with(None)
    }

    fn step_down_self_and_replace_with(
        &mut self,
        new_primary: Option<usize>,
    ) -> HeartbeatResponseAction {
        assert_eq!(self.role, Role::Leader, "only a leader can step down");
        assert!(self.self_index.is_some());
        assert_ne!(new_primary, self.self_index);
        assert_eq!(self.current_primary_index, self.self_index);
        self.current_primary_index = new_primary;
        self.role = Role::Follower;
        let state = self.member_state();
        self.hbdata[self.self_index.unwrap()].set_state(state);
        match new_primary {
            Some(index) => {
                HeartbeatResponseAction::new(TopologyAction::StepDownSelfAndReplaceWith(index))
            }
            None => HeartbeatResponseAction::new(TopologyAction::StepDownSelf),
        }
    }

    // ==================== Internals ====================

    /// Record a short diagnostic message carried in heartbeat replies.
    /// An unchanged message is re-logged at most once a minute.
    fn set_hb_msg(&mut self, now: Date, msg: &str) {
        if msg == self.hb_msg
            && now.saturating_duration_since(self.hb_msg_logged_at) < HB_MSG_LOG_INTERVAL
        {
            return;
        }
        self.hb_msg = msg.to_owned();
        if !msg.is_empty() {
            self.hb_msg_logged_at = now;
            info!("{}", msg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(port: u16) -> HostAndPort {
        HostAndPort::new("db", port)
    }

    fn three_member_config() -> ReplSetConfig {
        ReplSetConfig::builder()
            .set_name("rs0")
            .member(MemberConfig::new(0, host(1)))
            .member(MemberConfig::new(1, host(2)))
            .member(MemberConfig::new(2, host(3)))
            .build()
            .unwrap()
    }

    #[test]
    fn test_starts_in_startup() {
        let coordinator = TopologyCoordinator::default();
        assert_eq!(coordinator.role(), Role::Follower);
        assert_eq!(coordinator.member_state(), MemberState::Startup);
    }

    #[test]
    fn test_removed_when_not_in_initialized_config() {
        let mut coordinator = TopologyCoordinator::default();
        coordinator.update_config(three_member_config(), None, Date::ZERO, OpTime::ZERO);
        assert_eq!(coordinator.member_state(), MemberState::Removed);
    }

    #[test]
    fn test_single_member_config_becomes_candidate() {
        let config = ReplSetConfig::builder()
            .set_name("rs0")
            .member(MemberConfig::new(0, host(1)))
            .build()
            .unwrap();
        let mut coordinator = TopologyCoordinator::default();
        coordinator.update_config(config, Some(0), Date::ZERO, OpTime::ZERO);
        assert_eq!(coordinator.role(), Role::Candidate);
    }

    #[test]
    fn test_single_member_zero_priority_stays_follower() {
        let config = ReplSetConfig::builder()
            .set_name("rs0")
            .member(MemberConfig::new(0, host(1)).with_priority(0.0))
            .build()
            .unwrap();
        let mut coordinator = TopologyCoordinator::default();
        coordinator.update_config(config, Some(0), Date::ZERO, OpTime::ZERO);
        assert_eq!(coordinator.role(), Role::Follower);
    }

    #[test]
    fn test_zero_priority_self_is_unelectable() {
        // A one-member set is trivially a majority, so the priority check is
        // the one that fires.
        let config = ReplSetConfig::builder()
            .set_name("rs0")
            .member(MemberConfig::new(0, host(1)).with_priority(0.0))
            .build()
            .unwrap();
        let mut coordinator = TopologyCoordinator::default();
        coordinator.update_config(config, Some(0), Date::ZERO, OpTime::ZERO);
        assert_eq!(
            coordinator.my_unelectable_reason(Date::from_millis(1_000), OpTime::ZERO),
            Some(UnelectableReason::NoPriority)
        );
    }

    #[test]
    fn test_update_config_resets_primary_and_is_idempotent() {
        let mut coordinator = TopologyCoordinator::default();
        let now = Date::from_millis(1_000);
        coordinator.update_config(three_member_config(), Some(0), now, OpTime::new(5, 0));
        assert_eq!(coordinator.role(), Role::Follower);
        assert_eq!(coordinator.current_primary_index(), None);
        assert_eq!(coordinator.member_state(), MemberState::Startup2);
        assert!(coordinator.member_data(0).up());
        assert_eq!(coordinator.member_data(0).op_time(), OpTime::new(5, 0));

        coordinator.update_config(three_member_config(), Some(0), now, OpTime::new(5, 0));
        assert_eq!(coordinator.role(), Role::Follower);
        assert_eq!(coordinator.current_primary_index(), None);
        assert_eq!(coordinator.member_state(), MemberState::Startup2);
    }

    #[test]
    fn test_maintenance_mode_masks_secondary() {
        let mut coordinator = TopologyCoordinator::default();
        coordinator.update_config(three_member_config(), Some(0), Date::ZERO, OpTime::ZERO);
        coordinator.set_follower_mode(MemberState::Secondary);
        assert_eq!(coordinator.member_state(), MemberState::Secondary);

        coordinator.adjust_maintenance_count(1);
        coordinator.adjust_maintenance_count(1);
        assert_eq!(coordinator.member_state(), MemberState::Recovering);
        assert_eq!(coordinator.maintenance_count(), 2);

        coordinator.adjust_maintenance_count(-2);
        assert_eq!(coordinator.member_state(), MemberState::Secondary);
    }

    #[test]
    #[should_panic(expected = "maintenance count cannot go negative")]
    fn test_maintenance_count_cannot_go_negative() {
        let mut coordinator = TopologyCoordinator::default();
        coordinator.update_config(three_member_config(), Some(0), Date::ZERO, OpTime::ZERO);
        coordinator.adjust_maintenance_count(-1);
    }

    #[test]
    fn test_arbiter_self_reports_arbiter_state() {
        let config = ReplSetConfig::builder()
            .set_name("rs0")
            .member(MemberConfig::new(0, host(1)).arbiter())
            .member(MemberConfig::new(1, host(2)))
            .build()
            .unwrap();
        let mut coordinator = TopologyCoordinator::default();
        coordinator.update_config(config, Some(0), Date::ZERO, OpTime::ZERO);
        assert_eq!(coordinator.member_state(), MemberState::Arbiter);
    }

    #[test]
    #[should_panic(expected = "step-down time may only advance")]
    fn test_step_down_time_never_regresses() {
        let mut coordinator = TopologyCoordinator::default();
        coordinator.update_config(three_member_config(), Some(0), Date::ZERO, OpTime::ZERO);
        coordinator.set_step_down_time(Date::from_millis(10_000));
        coordinator.set_step_down_time(Date::from_millis(5_000));
    }

    #[test]
    fn test_win_then_step_down_round_trip() {
        let mut coordinator = TopologyCoordinator::default();
        let config = ReplSetConfig::builder()
            .set_name("rs0")
            .member(MemberConfig::new(0, host(1)))
            .build()
            .unwrap();
        let now = Date::from_millis(1_000);
        coordinator.update_config(config, Some(0), now, OpTime::new(1, 0));
        assert_eq!(coordinator.role(), Role::Candidate);

        coordinator.process_win_election(now, 7, OpTime::new(1, 0), OpTime::new(2, 0));
        assert_eq!(coordinator.role(), Role::Leader);
        assert_eq!(coordinator.member_state(), MemberState::Primary);
        assert_eq!(coordinator.current_primary_index(), Some(0));
        assert_eq!(coordinator.election_time(), OpTime::new(2, 0));
        assert_eq!(coordinator.election_id(), Some(7));

        let action = coordinator.step_down();
        assert_eq!(action.action(), TopologyAction::StepDownSelf);
        assert_eq!(coordinator.role(), Role::Follower);
        assert_eq!(coordinator.current_primary_index(), None);
    }

    #[test]
    fn test_lose_election_returns_to_follower() {
        let mut coordinator = TopologyCoordinator::default();
        let config = ReplSetConfig::builder()
            .set_name("rs0")
            .member(MemberConfig::new(0, host(1)))
            .build()
            .unwrap();
        let now = Date::from_millis(1_000);
        coordinator.update_config(config, Some(0), now, OpTime::new(1, 0));
        assert_eq!(coordinator.role(), Role::Candidate);

        coordinator.process_lose_election(now, OpTime::new(1, 0));
        assert_eq!(coordinator.role(), Role::Follower);
        assert_eq!(coordinator.election_id(), None);
        assert_eq!(coordinator.election_time(), OpTime::ZERO);
    }

    #[test]
    fn test_responders_reject_canceled_callbacks() {
        let mut coordinator = TopologyCoordinator::default();
        coordinator.update_config(three_member_config(), Some(0), Date::ZERO, OpTime::ZERO);

        let err = coordinator
            .prepare_freeze_response(CallbackState::Canceled, Date::ZERO, 5)
            .unwrap_err();
        assert_eq!(err, TopologyError::ShutdownInProgress);
        // And no state was touched.
        assert_eq!(coordinator.step_down_time(), Date::ZERO);

        let err = coordinator
            .prepare_status_response(
                CallbackState::Canceled,
                Date::ZERO,
                Duration::ZERO,
                OpTime::ZERO,
            )
            .unwrap_err();
        assert_eq!(err, TopologyError::ShutdownInProgress);
    }
}
