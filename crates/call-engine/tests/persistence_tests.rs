//! Call records written to a SQLite file survive the engine

mod common;

use std::path::PathBuf;

use anyhow::Result;
use pbx_call_engine::entities::Trunk;
use pbx_call_engine::prelude::*;
use serial_test::serial;

use common::{extension, pbx_with_config};

fn database_file() -> PathBuf {
    let path = std::env::temp_dir().join("pbx_call_engine_records_test.db");
    let _ = std::fs::remove_file(&path);
    path
}

#[tokio::test]
#[serial]
async fn test_queue_call_record_persisted_to_sqlite() -> Result<()> {
    let path = database_file();
    let url = format!("sqlite://{}", path.display());

    let store = InMemoryEntityStore::shared();
    store.add_trunk(Trunk::new("t1", "sip.carrier.example"))?;
    store.add_extension(extension("e100", "100", Role::Agent))?;
    store.add_queue(QueueDefinition::new("q1", QueueStrategy::LongestIdle))?;
    store.add_member(QueueMember::new("q1", "e100"))?;
    store.add_inbound_rule(InboundRule::new("r1", "+4930*", 10, Destination::queue("q1")))?;

    let mut config = EngineConfig::default();
    config.database.url = Some(url.clone());
    let pbx = pbx_with_config(store, config).await;
    pbx.register("100", "sip:100@10.0.0.10:5060").await;
    pbx.engine.agent_login("e100", &[]).await?;

    pbx.engine
        .handle_invite(pbx.invite("p1", "+4915112345678", "+4930123456").from_trunk("t1"))
        .await?;
    pbx.advance_secs(12);
    pbx.engine
        .on_answer("p1", AnswerInfo::new("a", common::CALLER_SDP))
        .await?;
    pbx.advance_secs(90);
    pbx.engine.handle_bye("p1").await?;
    drop(pbx);

    let records = SqliteCallRecordStore::connect(&url, 1).await?;
    let record = records.get("p1").await?.expect("record persisted");
    assert_eq!(record.kind(), CallStateKind::Ended);
    assert_eq!(record.hangup_cause(), Some(HangupCause::NormalClearing));
    assert_eq!(record.talk_secs(), Some(90));
    let link = record.queue.clone().expect("queue link");
    assert_eq!(link.agent_extension_id.as_deref(), Some("e100"));
    assert_eq!(link.wait_secs, Some(12.0));

    let completed = records.completed_for_queue("q1").await?;
    assert_eq!(completed.len(), 1);
    assert!(records.get("never-seen").await?.is_none());

    let _ = std::fs::remove_file(&path);
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_failed_call_record_persisted_to_sqlite() -> Result<()> {
    let path = database_file();
    let url = format!("sqlite://{}", path.display());

    let store = InMemoryEntityStore::shared();
    store.add_extension(extension("e101", "101", Role::User))?;
    store.add_extension(extension("e102", "102", Role::User))?;
    let mut config = EngineConfig::default();
    config.database.url = Some(url.clone());
    let pbx = pbx_with_config(store, config).await;
    pbx.register("101", "sip:101@10.0.0.21:5060").await;

    // 102 never registered
    assert!(pbx.engine.handle_invite(pbx.invite("p2", "101", "102")).await.is_err());
    drop(pbx);

    let records = SqliteCallRecordStore::connect(&url, 1).await?;
    let record = records.get("p2").await?.expect("record persisted");
    assert_eq!(record.direction, Direction::Internal);
    assert_eq!(record.hangup_cause(), Some(HangupCause::Failed));
    assert!(record.answered_at().is_none());

    let _ = std::fs::remove_file(&path);
    Ok(())
}
