//! Happy-path evaluation: raw samples through accumulators, threshold
//! lookup, ranking and alarm delivery.

use chrono::Utc;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

#[tokio::test]
async fn memory_cycle_within_limits_emits_ok_alarm() {
    let profile = MockServer::start().await;
    let sink = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(profile_body(RULE_ID, ">", &[(5, 80), (9, 95)])),
        )
        .mount(&profile)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&sink)
        .await;

    let mut pipeline = build_pipeline(&profile, &sink, 2).await;

    // usage = 100 - 500/1000*100 = 50% → nothing broken
    let ts = Utc::now();
    for (offset, payload) in memory_cycle(7, ts, 500, 1000).iter().enumerate() {
        let env = pipeline.envelope(offset as i64, payload);
        pipeline.front.dispatch(env).await.unwrap();
    }

    // every raw sample commits, the last one only after its alarm delivered
    for offset in 0..8 {
        pipeline.expect_commit(offset).await;
    }

    let alarms = sink_alarms(&sink).await;
    assert_eq!(alarms.len(), 1);
    assert_eq!(alarms[0]["level"], 0);
    assert_eq!(alarms[0]["message"], "Ok.");
    assert_eq!(alarms[0]["event_id"], RULE_ID);
    assert_eq!(alarms[0]["check"], "cyclone(memory.usage.percent)");
    assert_eq!(alarms[0]["team"], "storage");

    pipeline.shutdown().await;
}

#[tokio::test]
async fn broken_threshold_emits_highest_level() {
    let profile = MockServer::start().await;
    let sink = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(profile_body(RULE_ID, ">", &[(5, 80), (9, 95)])),
        )
        .mount(&profile)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&sink)
        .await;

    let mut pipeline = build_pipeline(&profile, &sink, 2).await;

    // usage = 100 - 30/1000*100 = 97% → breaks both levels, 9 wins
    let ts = Utc::now();
    for (offset, payload) in memory_cycle(7, ts, 30, 1000).iter().enumerate() {
        let env = pipeline.envelope(offset as i64, payload);
        pipeline.front.dispatch(env).await.unwrap();
    }
    for offset in 0..8 {
        pipeline.expect_commit(offset).await;
    }

    let alarms = sink_alarms(&sink).await;
    assert_eq!(alarms.len(), 1);
    assert_eq!(alarms[0]["level"], 9);
    assert_eq!(
        alarms[0]["message"],
        "Metric memory.usage.percent has broken threshold. Value 97.00 > 95"
    );
    assert_eq!(alarms[0]["sourcehost"], "web01.example.com");
    assert_eq!(alarms[0]["on_call"], "storage pager");

    pipeline.shutdown().await;
}

#[tokio::test]
async fn intermediate_level_breaks_when_top_holds() {
    let profile = MockServer::start().await;
    let sink = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(profile_body(RULE_ID, ">", &[(5, 80), (9, 95)])),
        )
        .mount(&profile)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&sink)
        .await;

    let mut pipeline = build_pipeline(&profile, &sink, 1).await;

    // usage = 85% → level 5 broken, level 9 holds
    let ts = Utc::now();
    for (offset, payload) in memory_cycle(7, ts, 150, 1000).iter().enumerate() {
        let env = pipeline.envelope(offset as i64, payload);
        pipeline.front.dispatch(env).await.unwrap();
    }
    for offset in 0..8 {
        pipeline.expect_commit(offset).await;
    }

    let alarms = sink_alarms(&sink).await;
    assert_eq!(alarms.len(), 1);
    assert_eq!(alarms[0]["level"], 5);
    assert_eq!(
        alarms[0]["message"],
        "Metric memory.usage.percent has broken threshold. Value 85.00 > 80"
    );

    pipeline.shutdown().await;
}

#[tokio::test]
async fn tagged_raw_metric_evaluates_directly() {
    let profile = MockServer::start().await;
    let sink = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(profile_body(RULE_ID, ">=", &[(3, 10)])),
        )
        .mount(&profile)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&sink)
        .await;

    let mut pipeline = build_pipeline(&profile, &sink, 1).await;

    // a path outside every accumulator family passes through unchanged
    let payload = metric_payload(42, "/sys/load/15min", Utc::now(), "long", "12", &[RULE_ID]);
    let env = pipeline.envelope(0, &payload);
    pipeline.front.dispatch(env).await.unwrap();
    pipeline.expect_commit(0).await;

    let alarms = sink_alarms(&sink).await;
    assert_eq!(alarms.len(), 1);
    assert_eq!(alarms[0]["level"], 3);
    assert_eq!(
        alarms[0]["message"],
        "Metric /sys/load/15min has broken threshold. Value 12 >= 10"
    );
    assert_eq!(alarms[0]["check"], "cyclone(/sys/load/15min)");

    pipeline.shutdown().await;
}

#[tokio::test]
async fn assets_are_sharded_across_workers_and_all_commit() {
    let profile = MockServer::start().await;
    let sink = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&profile)
        .await;

    let mut pipeline = build_pipeline(&profile, &sink, 4).await;

    for offset in 0..20i64 {
        let payload = metric_payload(
            offset, // asset id spreads over all four shards
            "/sys/load/1min",
            Utc::now(),
            "real",
            "0.5",
            &[RULE_ID],
        );
        let env = pipeline.envelope(offset, &payload);
        pipeline.front.dispatch(env).await.unwrap();
    }

    let mut committed = std::collections::HashSet::new();
    for _ in 0..20 {
        let ack = tokio::time::timeout(std::time::Duration::from_secs(5), pipeline.commit_rx.recv())
            .await
            .expect("commit must arrive")
            .unwrap();
        committed.insert(ack.offset);
    }
    assert_eq!(committed.len(), 20);

    pipeline.shutdown().await;
}
