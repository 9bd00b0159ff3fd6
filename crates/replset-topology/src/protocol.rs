//! Messages exchanged by the election and heartbeat protocol.
//!
//! These are plain values; encoding them for the wire (and decoding peer
//! replies into them) is the transport's job.

use crate::config::ReplSetConfig;
use crate::member::{HostAndPort, MemberState};
use crate::optime::{Date, OpTime};
use serde::{Deserialize, Serialize};

/// Heartbeat protocol version this coordinator speaks
pub const PROTOCOL_VERSION: u32 = 1;

/// An outbound heartbeat request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    pub protocol_version: u32,
    pub check_empty: bool,
    pub set_name: String,
    pub config_version: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_host: Option<HostAndPort>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<i64>,
}

/// A heartbeat reply, both produced for peers and ingested from them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub set_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<MemberState>,
    /// Set only by primaries
    #[serde(skip_serializing_if = "Option::is_none")]
    pub election_time: Option<OpTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub electable: Option<bool>,
    pub hb_msg: String,
    /// Sender's clock at reply time, in seconds
    pub time: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub op_time: Option<OpTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub syncing_to: Option<HostAndPort>,
    pub config_version: i64,
    /// Full config, attached when the caller's version is stale
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<ReplSetConfig>,
    /// The sender thought we were down when this heartbeat arrived
    pub state_disagreement: bool,
    /// The sender belongs to a different replica set
    pub mismatched: bool,
}

/// Arguments of a `fresh` challenge: "is anyone fresher than me before I
/// stand for election?"
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FreshArgs {
    pub set_name: String,
    pub who: HostAndPort,
    pub id: i64,
    pub config_version: i64,
    pub op_time: OpTime,
}

/// Reply to a `fresh` challenge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FreshResponse {
    pub op_time: OpTime,
    pub fresher: bool,
    pub veto: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errmsg: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
}

/// Arguments of an `elect` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElectArgs {
    pub set_name: String,
    pub who_id: i64,
    pub config_version: i64,
    /// Opaque round identifier, echoed back verbatim
    pub round: u64,
}

/// Reply to an `elect` request. `vote` is the voter's weight for yes,
/// zero for abstain, and -10000 for a protocol-level objection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElectResponse {
    pub vote: i64,
    pub round: u64,
}

/// Reply to a freeze command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FreezeResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// Reply to a sync-from command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncFromResponse {
    pub sync_from_requested: HostAndPort,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_sync_target: Option<HostAndPort>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// One member's row in the status report.
///
/// Field order matters: the members list is sorted lexicographically on the
/// serialized form, and `_id` leads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberStatus {
    #[serde(rename = "_id")]
    pub id: i64,
    pub name: String,
    pub health: f64,
    pub state: i32,
    pub state_str: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub op_time: Option<OpTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maintenance_mode: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<Date>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_recv: Option<Date>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ping_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authenticated: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub syncing_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub election_time: Option<OpTime>,
    #[serde(rename = "self", skip_serializing_if = "Option::is_none")]
    pub is_self: Option<bool>,
}

/// Whole-set status report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplSetStatus {
    pub set: String,
    pub date: Date,
    pub my_state: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub syncing_to: Option<String>,
    pub members: Vec<MemberStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_request_omits_unset_sender() {
        let request = HeartbeatRequest {
            protocol_version: PROTOCOL_VERSION,
            check_empty: false,
            set_name: "rs0".into(),
            config_version: 0,
            sender_host: None,
            sender_id: None,
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(!json.contains("senderHost"));
        assert!(!json.contains("senderId"));
        assert!(json.contains("\"protocolVersion\":1"));
    }

    #[test]
    fn test_member_status_serializes_id_first() {
        let status = MemberStatus {
            id: 2,
            name: "db2:27017".into(),
            health: 1.0,
            state: 2,
            state_str: "SECONDARY".into(),
            ..Default::default()
        };
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.starts_with("{\"_id\":2"));
        assert!(json.contains("\"stateStr\":\"SECONDARY\""));
        // None fields are dropped entirely.
        assert!(!json.contains("maintenanceMode"));
    }

    #[test]
    fn test_heartbeat_response_round_trip() {
        let response = HeartbeatResponse {
            set_name: Some("rs0".into()),
            state: Some(MemberState::Primary),
            election_time: Some(OpTime::new(100, 0)),
            electable: Some(false),
            hb_msg: String::new(),
            time: 42,
            op_time: Some(OpTime::new(99, 3)),
            syncing_to: None,
            config_version: 7,
            config: None,
            state_disagreement: false,
            mismatched: false,
        };
        let json = serde_json::to_string(&response).unwrap();
        let back: HeartbeatResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(back, response);
    }
}
