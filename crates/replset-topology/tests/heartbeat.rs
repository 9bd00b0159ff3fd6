//! Heartbeat scheduling, ingestion, and response construction.

use replset_topology::{
    CallbackState, Date, HeartbeatRequest, HeartbeatResponse, HostAndPort, MemberConfig,
    MemberState, OpTime, ReplSetConfig, TopologyAction, TopologyCoordinator, TopologyError,
    DEFAULT_HEARTBEAT_TIMEOUT, HEARTBEAT_INTERVAL, PROTOCOL_VERSION,
};
use std::time::Duration;

fn host(port: u16) -> HostAndPort {
    HostAndPort::new("db", port)
}

fn three_member_config(version: i64) -> ReplSetConfig {
    ReplSetConfig::builder()
        .set_name("rs0")
        .version(version)
        .member(MemberConfig::new(0, host(1)))
        .member(MemberConfig::new(1, host(2)))
        .member(MemberConfig::new(2, host(3)))
        .build()
        .unwrap()
}

fn secondary_hb(op_time: OpTime) -> HeartbeatResponse {
    HeartbeatResponse {
        set_name: Some("rs0".into()),
        state: Some(MemberState::Secondary),
        op_time: Some(op_time),
        config_version: 1,
        ..Default::default()
    }
}

/// Run one full request/response exchange with `target`.
fn deliver(
    coordinator: &mut TopologyCoordinator,
    now: Date,
    target: &HostAndPort,
    response: Result<HeartbeatResponse, TopologyError>,
    last_op_applied: OpTime,
) -> replset_topology::HeartbeatResponseAction {
    let _ = coordinator.prepare_heartbeat_request(now, "rs0", target);
    coordinator.process_heartbeat_response(
        now,
        Duration::from_millis(10),
        target,
        response,
        last_op_applied,
    )
}

#[test]
fn test_request_before_config_uses_caller_set_name() {
    let mut coordinator = TopologyCoordinator::default();
    let (request, timeout) =
        coordinator.prepare_heartbeat_request(Date::from_millis(0), "rs0", &host(9));
    assert_eq!(
        request,
        HeartbeatRequest {
            protocol_version: PROTOCOL_VERSION,
            check_empty: false,
            set_name: "rs0".into(),
            config_version: 0,
            sender_host: None,
            sender_id: None,
        }
    );
    assert_eq!(timeout, DEFAULT_HEARTBEAT_TIMEOUT);
}

#[test]
fn test_request_carries_self_identity_once_configured() {
    let mut coordinator = TopologyCoordinator::default();
    coordinator.update_config(three_member_config(4), Some(0), Date::ZERO, OpTime::ZERO);

    let (request, _) =
        coordinator.prepare_heartbeat_request(Date::from_millis(0), "ignored", &host(2));
    assert_eq!(request.set_name, "rs0");
    assert_eq!(request.config_version, 4);
    assert_eq!(request.sender_host, Some(host(1)));
    assert_eq!(request.sender_id, Some(0));
}

#[test]
fn test_retry_budget_then_backoff() {
    let mut coordinator = TopologyCoordinator::default();
    coordinator.update_config(three_member_config(1), Some(0), Date::ZERO, OpTime::ZERO);
    let peer = host(2);

    let t0 = Date::from_millis(100_000);
    let (_, timeout) = coordinator.prepare_heartbeat_request(t0, "rs0", &peer);
    assert_eq!(timeout, DEFAULT_HEARTBEAT_TIMEOUT);

    // First failure: one retry burned, schedule an immediate retry.
    let action = coordinator.process_heartbeat_response(
        t0,
        Duration::from_millis(10),
        &peer,
        Err(TopologyError::HostUnreachable("db:2".into())),
        OpTime::ZERO,
    );
    assert_eq!(action.next_heartbeat_start(), Some(t0));

    // The retry request must not restart the window.
    let t1 = t0 + Duration::from_millis(100);
    let (_, timeout) = coordinator.prepare_heartbeat_request(t1, "rs0", &peer);
    assert_eq!(timeout, DEFAULT_HEARTBEAT_TIMEOUT - Duration::from_millis(100));

    // Second failure: still within the retry budget.
    let action = coordinator.process_heartbeat_response(
        t1,
        Duration::from_millis(10),
        &peer,
        Err(TopologyError::HostUnreachable("db:2".into())),
        OpTime::ZERO,
    );
    assert_eq!(action.next_heartbeat_start(), Some(t1));

    // Third failure exhausts the budget: back off a full interval.
    let t2 = t1 + Duration::from_millis(100);
    let _ = coordinator.prepare_heartbeat_request(t2, "rs0", &peer);
    let action = coordinator.process_heartbeat_response(
        t2,
        Duration::from_millis(10),
        &peer,
        Err(TopologyError::HostUnreachable("db:2".into())),
        OpTime::ZERO,
    );
    assert_eq!(action.next_heartbeat_start(), Some(t2 + HEARTBEAT_INTERVAL));
}

#[test]
fn test_success_schedules_next_interval() {
    let mut coordinator = TopologyCoordinator::default();
    coordinator.update_config(three_member_config(1), Some(0), Date::ZERO, OpTime::ZERO);

    let now = Date::from_millis(50_000);
    let action = deliver(
        &mut coordinator,
        now,
        &host(2),
        Ok(secondary_hb(OpTime::new(3, 0))),
        OpTime::ZERO,
    );
    assert_eq!(action.action(), TopologyAction::NoAction);
    assert_eq!(action.next_heartbeat_start(), Some(now + HEARTBEAT_INTERVAL));
}

#[test]
fn test_newer_config_in_response_triggers_reconfig() {
    let mut coordinator = TopologyCoordinator::default();
    coordinator.update_config(three_member_config(1), Some(0), Date::ZERO, OpTime::ZERO);

    let mut response = secondary_hb(OpTime::new(3, 0));
    response.config = Some(three_member_config(2));
    response.config_version = 2;

    let now = Date::from_millis(50_000);
    let action = deliver(&mut coordinator, now, &host(2), Ok(response), OpTime::ZERO);
    assert_eq!(action.action(), TopologyAction::Reconfig);
    assert_eq!(action.next_heartbeat_start(), Some(now + HEARTBEAT_INTERVAL));
}

#[test]
fn test_same_or_older_config_in_response_is_ignored() {
    let mut coordinator = TopologyCoordinator::default();
    coordinator.update_config(three_member_config(2), Some(0), Date::ZERO, OpTime::ZERO);

    let mut response = secondary_hb(OpTime::new(3, 0));
    response.config = Some(three_member_config(2));
    response.config_version = 2;
    let action = deliver(
        &mut coordinator,
        Date::from_millis(1_000),
        &host(2),
        Ok(response),
        OpTime::ZERO,
    );
    assert_eq!(action.action(), TopologyAction::NoAction);
    // The peer's data was still ingested.
    assert!(coordinator.member_data(1).up());
}

#[test]
fn test_response_from_host_outside_config_is_ignored() {
    let mut coordinator = TopologyCoordinator::default();
    coordinator.update_config(three_member_config(1), Some(0), Date::ZERO, OpTime::ZERO);

    let stranger = host(99);
    let action = deliver(
        &mut coordinator,
        Date::from_millis(1_000),
        &stranger,
        Ok(secondary_hb(OpTime::new(3, 0))),
        OpTime::ZERO,
    );
    assert_eq!(action.action(), TopologyAction::NoAction);
    for index in 0..3 {
        if index != 0 {
            assert!(!coordinator.member_data(index).up());
        }
    }
}

#[test]
fn test_failure_then_recovery_updates_member_data() {
    let mut coordinator = TopologyCoordinator::default();
    coordinator.update_config(three_member_config(1), Some(0), Date::ZERO, OpTime::ZERO);

    let t0 = Date::from_millis(10_000);
    deliver(
        &mut coordinator,
        t0,
        &host(2),
        Err(TopologyError::HostUnreachable("db:2".into())),
        OpTime::ZERO,
    );
    let data = coordinator.member_data(1);
    assert!(!data.up());
    assert_eq!(data.state(), MemberState::Down);
    assert!(data.last_heartbeat_msg().contains("host unreachable"));

    let t1 = Date::from_millis(20_000);
    deliver(
        &mut coordinator,
        t1,
        &host(2),
        Ok(secondary_hb(OpTime::new(7, 1))),
        OpTime::ZERO,
    );
    let data = coordinator.member_data(1);
    assert!(data.up());
    assert_eq!(data.state(), MemberState::Secondary);
    assert_eq!(data.op_time(), OpTime::new(7, 1));
    assert_eq!(data.up_since(), Some(t1));
}

#[test]
fn test_heartbeat_reply_rejects_wrong_protocol_version() {
    let mut coordinator = TopologyCoordinator::default();
    coordinator.update_config(three_member_config(1), Some(0), Date::ZERO, OpTime::ZERO);

    let args = HeartbeatRequest {
        protocol_version: 2,
        check_empty: false,
        set_name: "rs0".into(),
        config_version: 1,
        sender_host: None,
        sender_id: None,
    };
    let err = coordinator
        .prepare_heartbeat_response(CallbackState::Active, Date::ZERO, &args, "rs0", OpTime::ZERO)
        .unwrap_err();
    assert!(matches!(err, TopologyError::BadValue(_)));
}

#[test]
fn test_heartbeat_reply_rejects_mismatched_set_name() {
    let mut coordinator = TopologyCoordinator::default();
    coordinator.update_config(three_member_config(1), Some(0), Date::ZERO, OpTime::ZERO);

    let args = HeartbeatRequest {
        protocol_version: PROTOCOL_VERSION,
        check_empty: false,
        set_name: "rs1".into(),
        config_version: 1,
        sender_host: None,
        sender_id: None,
    };
    let err = coordinator
        .prepare_heartbeat_response(CallbackState::Active, Date::ZERO, &args, "rs0", OpTime::ZERO)
        .unwrap_err();
    assert!(err.is_set_mismatch());
}

#[test]
fn test_heartbeat_reply_attaches_config_for_stale_caller() {
    let mut coordinator = TopologyCoordinator::default();
    coordinator.update_config(three_member_config(3), Some(0), Date::ZERO, OpTime::new(9, 0));

    let args = HeartbeatRequest {
        protocol_version: PROTOCOL_VERSION,
        check_empty: false,
        set_name: "rs0".into(),
        config_version: 1,
        sender_host: Some(host(2)),
        sender_id: Some(1),
    };
    let response = coordinator
        .prepare_heartbeat_response(
            CallbackState::Active,
            Date::from_millis(42_000),
            &args,
            "rs0",
            OpTime::new(9, 0),
        )
        .unwrap();
    assert_eq!(response.set_name.as_deref(), Some("rs0"));
    assert_eq!(response.config_version, 3);
    assert_eq!(response.config.as_ref().map(|c| c.version()), Some(3));
    assert_eq!(response.time, 42);
    assert_eq!(response.op_time, Some(OpTime::new(9, 0)));
    assert_eq!(response.state, Some(MemberState::Startup2));
    // Config versions differ, so the sender was not resolved.
    assert_eq!(coordinator.member_data(1).last_heartbeat_recv(), None);
}

#[test]
fn test_heartbeat_reply_notes_state_disagreement() {
    let mut coordinator = TopologyCoordinator::default();
    coordinator.update_config(three_member_config(1), Some(0), Date::ZERO, OpTime::ZERO);

    // We believe the peer is down...
    deliver(
        &mut coordinator,
        Date::from_millis(5_000),
        &host(2),
        Err(TopologyError::HostUnreachable("db:2".into())),
        OpTime::ZERO,
    );

    // ...yet it heartbeats us.
    let args = HeartbeatRequest {
        protocol_version: PROTOCOL_VERSION,
        check_empty: false,
        set_name: "rs0".into(),
        config_version: 1,
        sender_host: Some(host(2)),
        sender_id: Some(1),
    };
    let now = Date::from_millis(6_000);
    let response = coordinator
        .prepare_heartbeat_response(CallbackState::Active, now, &args, "rs0", OpTime::ZERO)
        .unwrap();
    assert!(response.state_disagreement);
    assert_eq!(coordinator.member_data(1).last_heartbeat_recv(), Some(now));
}
