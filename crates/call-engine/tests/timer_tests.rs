//! Time-driven behavior under a paused tokio clock: collaborator deadlines,
//! ring and wait limits, maximum call duration and agent wrap-up

mod common;

use std::time::Duration;

use pbx_call_engine::entities::{OutboundRule, QueueMember, Trunk};
use pbx_call_engine::prelude::*;
use pretty_assertions::assert_eq;

use common::{Pbx, extension, pbx};

async fn internal_pair() -> Pbx {
    let store = InMemoryEntityStore::shared();
    store.add_extension(extension("e101", "101", Role::User)).unwrap();
    store.add_extension(extension("e102", "102", Role::User)).unwrap();
    let pbx = pbx(store).await;
    pbx.register("101", "sip:101@10.0.0.21:5060").await;
    pbx.register("102", "sip:102@10.0.0.22:5060").await;
    pbx
}

async fn queue_with_agent(queue: QueueDefinition) -> Pbx {
    let store = InMemoryEntityStore::shared();
    store.add_trunk(Trunk::new("t1", "sip.carrier.example")).unwrap();
    store.add_extension(extension("e100", "100", Role::Agent)).unwrap();
    store.add_queue(queue).unwrap();
    store.add_member(QueueMember::new("q1", "e100")).unwrap();
    store
        .add_inbound_rule(InboundRule::new("r1", "+4930*", 10, Destination::queue("q1")))
        .unwrap();

    let pbx = pbx(store).await;
    pbx.register("100", "sip:100@10.0.0.10:5060").await;
    pbx.engine.agent_login("e100", &[]).await.unwrap();
    pbx
}

async fn latest_status(pbx: &Pbx, queue_id: &str) -> (usize, usize) {
    let stats = pbx.engine.queue_stats(queue_id).await.unwrap();
    (stats.available_agents, stats.wrap_up_agents)
}

#[tokio::test(start_paused = true)]
async fn test_hanging_media_offer_fails_call() {
    let pbx = internal_pair().await;
    pbx.media.hang_on("offer");

    let err = pbx
        .engine
        .handle_invite(pbx.invite("m1", "101", "102"))
        .await
        .unwrap_err();
    assert!(err.is_transport());

    let call = pbx.engine.get_call("m1").await.unwrap();
    assert_eq!(call.hangup_cause(), Some(HangupCause::Failed));
    assert_eq!(pbx.media.count("delete"), 1);
    assert_eq!(pbx.signaling.count("create_outbound_dialog"), 0);
    assert_eq!(pbx.signaling.count("destroy_dialog"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_call_times_out() {
    let pbx = internal_pair().await;
    let ring_timeout = pbx.engine.config().timeouts.ring_timeout();

    pbx.engine
        .handle_invite(pbx.invite("r1", "101", "102"))
        .await
        .unwrap();

    tokio::time::sleep(ring_timeout - Duration::from_secs(1)).await;
    assert_eq!(
        pbx.engine.get_call("r1").await.unwrap().kind(),
        CallStateKind::Ringing
    );

    tokio::time::sleep(Duration::from_secs(2)).await;
    let call = pbx.engine.get_call("r1").await.unwrap();
    assert_eq!(call.hangup_cause(), Some(HangupCause::NoAnswer));
    assert_eq!(pbx.signaling.count("destroy_dialog"), 1);
    assert_eq!(pbx.media.live_sessions(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_answered_call_ignores_ring_timer() {
    let pbx = internal_pair().await;
    pbx.engine
        .handle_invite(pbx.invite("r2", "101", "102"))
        .await
        .unwrap();
    pbx.engine
        .on_answer("r2", AnswerInfo::new("b", common::CALLER_SDP))
        .await
        .unwrap();

    tokio::time::sleep(pbx.engine.config().timeouts.ring_timeout() * 2).await;
    assert_eq!(
        pbx.engine.get_call("r2").await.unwrap().kind(),
        CallStateKind::Answered
    );
}

#[tokio::test(start_paused = true)]
async fn test_queue_wait_limit_overflows() {
    let mut queue = QueueDefinition::new("q1", QueueStrategy::LongestIdle);
    queue.max_wait_time_secs = 60;
    let pbx = queue_with_agent(queue).await;

    let call = pbx
        .engine
        .handle_invite(pbx.invite("w1", "+4915112345678", "+4930123456").from_trunk("t1"))
        .await
        .unwrap();
    assert_eq!(call.queue.unwrap().offered_to, vec!["e100"]);

    // still ringing the agent past the generic ring timeout
    tokio::time::sleep(Duration::from_secs(45)).await;
    assert_eq!(
        pbx.engine.get_call("w1").await.unwrap().kind(),
        CallStateKind::Ringing
    );

    tokio::time::sleep(Duration::from_secs(16)).await;
    let call = pbx.engine.get_call("w1").await.unwrap();
    assert_eq!(call.hangup_cause(), Some(HangupCause::Timeout));
    assert_eq!(pbx.signaling.count("cancel_outbound_dialogs"), 1);

    let stats = pbx.engine.queue_stats("q1").await.unwrap();
    assert_eq!(stats.waiting_calls, 0);
    assert_eq!(stats.available_agents, 1);
}

#[tokio::test(start_paused = true)]
async fn test_outbound_call_cut_at_max_duration() {
    let store = InMemoryEntityStore::shared();
    store.add_trunk(Trunk::new("t2", "sip.carrier.example")).unwrap();
    store.add_extension(extension("e200", "200", Role::User)).unwrap();
    let mut rule = OutboundRule::new("o1", "0*", 10, "t2");
    rule.max_duration_secs = Some(120);
    store.add_outbound_rule(rule).unwrap();
    let pbx = pbx(store).await;

    pbx.engine
        .handle_invite(pbx.invite("d1", "200", "0891234567"))
        .await
        .unwrap();
    pbx.engine
        .on_answer("d1", AnswerInfo::new("far", common::CALLER_SDP))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(119)).await;
    assert_eq!(
        pbx.engine.get_call("d1").await.unwrap().kind(),
        CallStateKind::Answered
    );

    tokio::time::sleep(Duration::from_secs(2)).await;
    let call = pbx.engine.get_call("d1").await.unwrap();
    assert_eq!(call.hangup_cause(), Some(HangupCause::Timeout));
    assert_eq!(pbx.engine.routing().trunk_usage().in_use("t2"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_agent_returns_from_wrap_up() {
    let mut queue = QueueDefinition::new("q1", QueueStrategy::LongestIdle);
    queue.wrap_up_time_secs = 15;
    let pbx = queue_with_agent(queue).await;

    pbx.engine
        .handle_invite(pbx.invite("u1", "+4915112345678", "+4930123456").from_trunk("t1"))
        .await
        .unwrap();
    pbx.engine
        .on_answer("u1", AnswerInfo::new("a", common::CALLER_SDP))
        .await
        .unwrap();
    pbx.engine.handle_bye("u1").await.unwrap();
    assert_eq!(latest_status(&pbx, "q1").await, (0, 1));

    tokio::time::sleep(Duration::from_secs(16)).await;
    assert_eq!(latest_status(&pbx, "q1").await, (1, 0));
}

#[tokio::test(start_paused = true)]
async fn test_manual_status_change_survives_wrap_up_timer() {
    let pbx = queue_with_agent(QueueDefinition::new("q1", QueueStrategy::LongestIdle)).await;

    pbx.engine
        .handle_invite(pbx.invite("u2", "+4915112345678", "+4930123456").from_trunk("t1"))
        .await
        .unwrap();
    pbx.engine
        .on_answer("u2", AnswerInfo::new("a", common::CALLER_SDP))
        .await
        .unwrap();
    pbx.engine.handle_bye("u2").await.unwrap();

    pbx.advance_secs(1);
    pbx.engine
        .set_agent_state("e100", None, AgentStatus::Break, Some("coffee".to_string()))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(latest_status(&pbx, "q1").await, (0, 0));
}
