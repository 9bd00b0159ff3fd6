//! # Replset Topology
//!
//! A deterministic topology coordinator for one node of a replica set:
//! - **Role management**: follower, candidate, or leader, derived state view
//! - **Heartbeat protocol**: request scheduling, retry windows, ingestion
//! - **Primary reconciliation**: split-primary resolution, priority step-down
//! - **Elections**: fresh/elect replies, vote leases, candidacy decisions
//! - **Sync-source selection**: freshness, latency, chaining, blacklist
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                     Surrounding subsystems                    │
//! │   network transport · oplog applier · storage · dispatcher    │
//! └──────────────┬──────────────────────────────▲─────────────────┘
//!                │ (now, message, opTime)       │ actions/replies
//! ┌──────────────▼──────────────────────────────┴─────────────────┐
//! │                     TopologyCoordinator                       │
//! │  heartbeat scheduler │ primary reconciliation │ sync sources  │
//! │  election replies    │ status/freeze replies  │ config apply  │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! The coordinator performs no I/O and never reads a clock: callers feed it
//! timestamped inputs and execute the decisions it returns. Given the same
//! input sequence it always produces the same outputs, so every behavior can
//! be tested under virtual time.
//!
//! ## Example Usage
//!
//! ```rust
//! use replset_topology::{
//!     Date, HostAndPort, MemberConfig, OpTime, ReplSetConfig, Role, TopologyCoordinator,
//! };
//!
//! let config = ReplSetConfig::builder()
//!     .set_name("rs0")
//!     .member(MemberConfig::new(0, HostAndPort::new("db1", 27017)))
//!     .member(MemberConfig::new(1, HostAndPort::new("db2", 27017)))
//!     .build()
//!     .unwrap();
//!
//! let mut coordinator = TopologyCoordinator::default();
//! coordinator.update_config(config, Some(0), Date::from_millis(0), OpTime::ZERO);
//! assert_eq!(coordinator.role(), Role::Follower);
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod member;
pub mod optime;
pub mod ping;
pub mod protocol;

// Re-export main types
pub use config::{MemberConfig, ReplSetConfig, ReplSetConfigBuilder, DEFAULT_HEARTBEAT_TIMEOUT};
pub use coordinator::{
    CallbackState, ElectionId, HeartbeatResponseAction, Role, TopologyAction, TopologyCoordinator,
    UnelectableReason, DEFAULT_MAX_SYNC_SOURCE_LAG, HEARTBEAT_INTERVAL, MAX_HEARTBEAT_RETRIES,
    VOTE_LEASE,
};
pub use error::{Result, TopologyError};
pub use member::{Health, HostAndPort, MemberHeartbeatData, MemberState};
pub use optime::{Date, OpTime};
pub use ping::PingStats;
pub use protocol::{
    ElectArgs, ElectResponse, FreezeResponse, FreshArgs, FreshResponse, HeartbeatRequest,
    HeartbeatResponse, MemberStatus, ReplSetStatus, SyncFromResponse, PROTOCOL_VERSION,
};
