//! Sink failure handling: transient resend with gauge toggling, permanent
//! failures killing the worker, and commit gating.

use chrono::Utc;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

#[tokio::test]
async fn transient_sink_failure_resends_and_commits_once() {
    let profile = MockServer::start().await;
    let sink = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(profile_body(RULE_ID, ">", &[(9, 95)])),
        )
        .mount(&profile)
        .await;

    // one 503, then the sink recovers
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&sink)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&sink)
        .await;

    let mut pipeline = build_pipeline(&profile, &sink, 1).await;

    let payload = metric_payload(7, "/sys/load/1min", Utc::now(), "real", "99.5", &[RULE_ID]);
    let env = pipeline.envelope(3, &payload);
    pipeline.front.dispatch(env).await.unwrap();

    // committed exactly once, after the resend succeeded
    pipeline.expect_commit(3).await;
    assert!(pipeline.commit_rx.try_recv().is_err());

    // the gauge was toggled back off by the successful resend
    assert_eq!(pipeline.stats.alarmapi_error(), 0);

    // first POST failed, second succeeded
    let requests = sink.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn permanent_sink_failure_is_fatal_and_never_commits() {
    let profile = MockServer::start().await;
    let sink = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(profile_body(RULE_ID, ">", &[(9, 95)])),
        )
        .mount(&profile)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(422).set_body_string("schema mismatch"))
        .mount(&sink)
        .await;

    let mut pipeline = build_pipeline(&profile, &sink, 1).await;

    let payload = metric_payload(7, "/sys/load/1min", Utc::now(), "real", "99.5", &[RULE_ID]);
    let env = pipeline.envelope(4, &payload);
    pipeline.front.dispatch(env).await.unwrap();

    let death = tokio::time::timeout(std::time::Duration::from_secs(5), pipeline.death_rx.recv())
        .await
        .expect("worker death must be reported")
        .expect("death channel open");
    assert!(death.to_string().contains("422"));

    // the offset was never released
    assert!(pipeline.commit_rx.try_recv().is_err());

    pipeline.shutdown().await;
}

#[tokio::test]
async fn commit_waits_for_every_alarm_of_the_envelope() {
    let profile = MockServer::start().await;
    let sink = MockServer::start().await;

    // two rules under the same lookup key, both matched by the metric's tags
    let second_rule = "7bd2b1aa-3410-4c31-bb18-6f5e63f25de8";
    let mut body = profile_body(RULE_ID, ">", &[(9, 95)]);
    {
        let configurations = body["configurations"].as_array_mut().unwrap();
        let mut second = configurations[0].clone();
        second["configuration_item_id"] = serde_json::json!(second_rule);
        configurations.push(second);
    }

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(&profile)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(std::time::Duration::from_millis(100)))
        .expect(2)
        .mount(&sink)
        .await;

    let mut pipeline = build_pipeline(&profile, &sink, 1).await;

    let payload = metric_payload(
        7,
        "/sys/load/1min",
        Utc::now(),
        "real",
        "99.5",
        &[RULE_ID, second_rule],
    );
    let env = pipeline.envelope(5, &payload);
    pipeline.front.dispatch(env).await.unwrap();

    pipeline.expect_commit(5).await;

    // both POSTs happened before the single commit
    let requests = sink.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    assert!(pipeline.commit_rx.try_recv().is_err());

    pipeline.shutdown().await;
}
