//! Shutdown drain and dispatcher-level drops.

use chrono::Utc;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

#[tokio::test]
async fn aged_out_envelope_commits_and_never_reaches_a_worker() {
    let profile = MockServer::start().await;
    let sink = MockServer::start().await;

    // no profile mock mounted: a forwarded envelope would 404-count requests
    let mut pipeline = build_pipeline(&profile, &sink, 2).await;

    let old_ts = Utc::now() - chrono::Duration::hours(2);
    let payload = metric_payload(7, "/sys/load/1min", old_ts, "real", "0.5", &[RULE_ID]);
    let env = pipeline.envelope(12, &payload);
    pipeline.front.dispatch(env).await.unwrap();

    pipeline.expect_commit(12).await;
    assert!(profile.received_requests().await.unwrap().is_empty());
    assert_eq!(pipeline.stats.snapshot().processed, 0);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn shutdown_completes_or_abandons_every_envelope() {
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

    let mut pipeline = build_pipeline(&profile, &sink, 2).await;

    for offset in 0..10i64 {
        let payload = metric_payload(
            offset % 2, // both workers participate
            "/sys/load/1min",
            Utc::now(),
            "real",
            "99.5",
            &[RULE_ID],
        );
        let env = pipeline.envelope(offset, &payload);
        pipeline.front.dispatch(env).await.unwrap();
    }

    // shutdown with work still in flight
    pipeline.shutdown_tx.send(true).unwrap();
    for handle in pipeline.workers {
        tokio::time::timeout(std::time::Duration::from_secs(10), handle.join)
            .await
            .expect("worker must stop within the drain window")
            .unwrap();
    }

    // whatever was accepted either committed or was abandoned cleanly; with
    // a healthy sink everything commits
    let mut committed = std::collections::HashSet::new();
    while let Ok(ack) = pipeline.commit_rx.try_recv() {
        committed.insert(ack.offset);
    }
    assert_eq!(committed.len(), 10, "all envelopes must release their offset");
}

#[tokio::test]
async fn closing_the_input_channel_stops_the_worker() {
    let profile = MockServer::start().await;
    let sink = MockServer::start().await;

    let pipeline = build_pipeline(&profile, &sink, 1).await;
    let Pipeline {
        front,
        mut workers,
        shutdown_tx,
        ..
    } = pipeline;

    // dropping the dispatcher and the handle's sender closes the input
    drop(front);
    let handle = workers.remove(0);
    drop(handle.input);

    tokio::time::timeout(std::time::Duration::from_secs(5), handle.join)
        .await
        .expect("worker must stop when its input closes")
        .unwrap();

    // the shutdown signal was never used
    drop(shutdown_tx);
}
