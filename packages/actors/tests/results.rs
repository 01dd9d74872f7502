#![allow(clippy::disallowed_methods)]

mod common;

use common::*;
use queue_core::{BatchOptions, BatchStatus, JobStatus, QueueEvent};
use serde_json::json;

#[tokio::test]
async fn result_files_are_ingested_per_domain() {
    let h = Harness::start(WRITE_RESULT, |c| c).await;
    let mut rx = h.manager.subscribe();

    let created = h
        .manager
        .create_batch(["acme.com", "my-site.co.uk"], BatchOptions::default())
        .await
        .unwrap();
    collect_until_complete(&mut rx, created.batch_id).await;

    let mut results = h.manager.get_batch_results(created.batch_id).await.unwrap();
    results.sort_by(|a, b| a.domain.cmp(&b.domain));

    let domains: Vec<&str> = results.iter().map(|r| r.domain.as_str()).collect();
    assert_eq!(domains, vec!["acme.com", "my-site.co.uk"]);
    assert_eq!(results[0].data, json!({"domain": "acme.com", "score": 7}));
    assert_eq!(results[1].data, json!({"domain": "my-site.co.uk", "score": 7}));
}

#[tokio::test]
async fn missing_result_file_still_completes_the_job() {
    let body = format!(r#"if [ "$1" = withdata.com ]; then {WRITE_RESULT}; fi"#);
    let h = Harness::start(&body, |c| c).await;
    let mut rx = h.manager.subscribe();

    let created = h
        .manager
        .create_batch(["withdata.com", "nodata.com"], BatchOptions::default())
        .await
        .unwrap();
    collect_until_complete(&mut rx, created.batch_id).await;

    let report = h.status(created.batch_id).await;
    assert_eq!(report.batch.completed_jobs, 2);
    assert!(report.jobs.iter().all(|j| j.status == JobStatus::Completed));

    let results = h.manager.get_batch_results(created.batch_id).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].domain, "withdata.com");
}

#[tokio::test]
async fn unparsable_result_file_is_ignored() {
    let body = r#"dir="prospects/$(printf %s "$1" | tr . -)"; mkdir -p "$dir"; echo "not json" > "$dir/research-data.json""#;
    let h = Harness::start(body, |c| c).await;
    let mut rx = h.manager.subscribe();

    let created = h.manager.create_batch(["acme.com"], BatchOptions::default()).await.unwrap();
    collect_until_complete(&mut rx, created.batch_id).await;

    assert_eq!(h.status(created.batch_id).await.batch.completed_jobs, 1);
    assert!(h.manager.get_batch_results(created.batch_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_job_leaves_no_result_even_if_file_exists() {
    let body = format!("{WRITE_RESULT}; exit 1");
    let h = Harness::start(&body, |c| c).await;
    let mut rx = h.manager.subscribe();

    let created = h.manager.create_batch(["acme.com"], BatchOptions::default()).await.unwrap();
    collect_until_complete(&mut rx, created.batch_id).await;

    assert_eq!(h.status(created.batch_id).await.batch.failed_jobs, 1);
    assert!(h.manager.get_batch_results(created.batch_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn progress_events_are_streamed() {
    let body = r#"echo "Fetching https://$1"; echo "Checking crunchbase funding"; echo "oops" >&2"#;
    let h = Harness::start(body, |c| c).await;
    let mut rx = h.manager.subscribe();

    let created = h.manager.create_batch(["acme.com"], BatchOptions::default()).await.unwrap();
    let events = collect_until_complete(&mut rx, created.batch_id).await;

    let phases: Vec<(u8, String)> = events
        .iter()
        .filter_map(|e| match e {
            QueueEvent::JobPhase { phase, name, .. } => Some((*phase, name.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(
        phases,
        vec![
            (1, "Company Discovery".to_string()),
            (4, "Financial Intelligence".to_string())
        ]
    );
    assert!(events.iter().any(|e| matches!(e, QueueEvent::JobLog { text, .. } if text == "Fetching https://acme.com")));

    let names: Vec<&str> = events.iter().map(|e| e.name()).collect();
    assert_eq!(names.first(), Some(&"batch:created"));
    assert!(names.contains(&"batch:started"));
    assert!(names.contains(&"job:start"));
    assert!(names.contains(&"job:complete"));
    assert_eq!(names.last(), Some(&"batch:complete"));

    let report = h.status(created.batch_id).await;
    assert_eq!(report.batch.status, BatchStatus::Completed);
}
