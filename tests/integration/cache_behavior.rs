//! Cache interaction through the full pipeline: negative caching and the
//! wait-for-backend retry loop.

use chrono::Utc;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

#[tokio::test]
async fn negative_cache_prevents_repeat_profile_fetches() {
    let profile = MockServer::start().await;
    let sink = MockServer::start().await;

    // the profile service must only ever see one request for this lookup key
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&profile)
        .await;

    let mut pipeline = build_pipeline(&profile, &sink, 1).await;

    // same asset and path twice → same lookup key
    for offset in 0..2i64 {
        let payload = metric_payload(7, "/sys/load/1min", Utc::now(), "real", "0.5", &[RULE_ID]);
        let env = pipeline.envelope(offset, &payload);
        pipeline.front.dispatch(env).await.unwrap();
        pipeline.expect_commit(offset).await;
    }

    assert_eq!(pipeline.stats.snapshot().alarms, 0);
    pipeline.shutdown().await;
}

#[tokio::test]
async fn cache_outage_parks_the_envelope_until_recovery() {
    let profile = MockServer::start().await;
    let sink = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(profile_body(RULE_ID, ">", &[(9, 95)])),
        )
        .mount(&profile)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&sink)
        .await;

    let mut pipeline = build_pipeline(&profile, &sink, 1).await;

    // backend down: the lookup is transient and the worker parks the message
    pipeline.backend.set_unavailable(true);

    let payload = metric_payload(7, "/sys/load/1min", Utc::now(), "real", "99.5", &[RULE_ID]);
    let env = pipeline.envelope(6, &payload);
    pipeline.front.dispatch(env).await.unwrap();

    // nothing commits while the backend is down
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    assert!(pipeline.commit_rx.try_recv().is_err());

    // backend recovers; the parked envelope is retried and completes
    pipeline.backend.set_unavailable(false);
    pipeline.expect_commit(6).await;

    let alarms = sink_alarms(&sink).await;
    assert_eq!(alarms.len(), 1);
    assert_eq!(alarms[0]["level"], 9);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn untagged_metric_gets_tag_hints_from_the_profile_service() {
    let profile = MockServer::start().await;
    let sink = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(profile_body(RULE_ID, ">", &[(9, 95)])),
        )
        .mount(&profile)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&sink)
        .await;

    let mut pipeline = build_pipeline(&profile, &sink, 1).await;

    // no tags on the wire: the worker injects the configured rule IDs
    let payload = metric_payload(7, "/sys/load/1min", Utc::now(), "real", "99.5", &[]);
    let env = pipeline.envelope(8, &payload);
    pipeline.front.dispatch(env).await.unwrap();
    pipeline.expect_commit(8).await;

    let alarms = sink_alarms(&sink).await;
    assert_eq!(alarms.len(), 1);
    assert_eq!(alarms[0]["event_id"], RULE_ID);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn untagged_unconfigured_metric_commits_without_probe_loop() {
    let profile = MockServer::start().await;
    let sink = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&profile)
        .await;

    let mut pipeline = build_pipeline(&profile, &sink, 1).await;

    let payload = metric_payload(7, "/sys/load/1min", Utc::now(), "real", "0.5", &[]);
    let env = pipeline.envelope(9, &payload);
    pipeline.front.dispatch(env).await.unwrap();
    pipeline.expect_commit(9).await;

    assert_eq!(pipeline.stats.snapshot().alarms, 0);
    pipeline.shutdown().await;
}
