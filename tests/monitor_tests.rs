mod test_harness;

use bigdata_director::director::SubmissionRequest;
use bigdata_director::external::{JobAttributes, SandboxKind};
use bigdata_director::ledger::{JobLedger, LedgerStatus, NewLedgerEntry};
use bigdata_director::monitor::{MISSING_OUTPUT_ATTRIBUTE, STALLED_ATTRIBUTE};
use bigdata_director::tracking::ORIGIN_MONITOR;

use test_harness::{agent_toml, script_v1_submit, v1_listing, EndpointSpec, Harness};

const BACKEND_ID: &str = "job_201301011200_0001";

const COMPLETION: &str = "\
Job: job_201301011200_0001
map() completion: 1.0
reduce() completion: 1.0
Counters: 29
\tFile System Counters
\t\tHDFS_BYTES_READ=2048
\t\tHDFS_BYTES_WRITTEN=512
\tMap-Reduce Framework
\t\tMap input records=120
\t\tCPU time spent (ms)=4500
";

/// Submit job 1 through the director so the ledger holds a real entry.
async fn submitted_job(harness: &Harness) {
    script_v1_submit(&harness.executor, 1, BACKEND_ID);
    let attributes = JobAttributes {
        name: "wordcount".to_string(),
        owner: "alice".to_string(),
        owner_group: "cesga_user".to_string(),
        output_sandbox: vec!["std.out".to_string()],
        ..JobAttributes::default()
    };
    harness.queue.describe(
        1,
        test_harness::JobDescription {
            arguments: None,
            dataset: Some("/data/x".to_string()),
            attributes: attributes.clone(),
        },
    );

    let (director, endpoint) = harness.director_for("CESGA");
    let request = SubmissionRequest::new(1, &endpoint, 2, "/data/x", attributes);
    assert_eq!(director.submit(&request).await.unwrap(), BACKEND_ID);
}

#[tokio::test]
async fn test_running_job_moves_to_running_once() {
    let toml = agent_toml(&[EndpointSpec::hadoop_v1("CESGA", 2)], 1, 4, "");
    let harness = Harness::new(&toml);
    submitted_job(&harness).await;
    harness
        .executor
        .respond("hadoop job -list all", &v1_listing(&[(BACKEND_ID, 1)]));

    let monitor = harness.node.monitor();
    let report = monitor.run_once().await;
    assert_eq!(report.checked, 1);
    assert_eq!(report.transitions, 1);

    let entry = harness.ledger.get(1).unwrap().unwrap();
    assert_eq!(entry.status, LedgerStatus::Running);
    let history = harness.ledger.history(1).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].entry.status, LedgerStatus::Running);

    let last = harness.tracker.statuses(1).pop().unwrap();
    assert_eq!(last.status, "Running");
    assert_eq!(last.origin, ORIGIN_MONITOR);
    assert!(last.message.contains(BACKEND_ID));

    // Still running: nothing new is recorded.
    let report = monitor.run_once().await;
    assert_eq!(report.transitions, 0);
    assert_eq!(harness.ledger.history(1).unwrap().len(), 2);
}

#[tokio::test]
async fn test_finished_job_is_collected_and_accounted() {
    let toml = agent_toml(&[EndpointSpec::hadoop_v1("CESGA", 2)], 1, 4, "");
    let harness = Harness::new(&toml);
    submitted_job(&harness).await;
    std::fs::write(harness.local_job_dir(1).join("std.out"), "done\n").unwrap();

    harness
        .executor
        .respond("hadoop job -list all", &v1_listing(&[(BACKEND_ID, 2)]));
    harness.executor.respond("hadoop job -status", COMPLETION);

    let monitor = harness.node.monitor();
    let report = monitor.run_once().await;
    assert_eq!(report.finished, 1);

    let entry = harness.ledger.get(1).unwrap().unwrap();
    assert_eq!(entry.status, LedgerStatus::Done);

    // Output: the DFS copy ran, std.out was uploaded, the job's own output
    // directory never showed up locally.
    assert_eq!(harness.executor.calls_matching("hadoop dfs -get"), 1);
    let uploads = harness.sandbox.uploads();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].0, 1);
    assert_eq!(uploads[0].1, SandboxKind::Output);
    assert!(uploads[0].2[0].ends_with("std.out"));
    assert_eq!(
        harness.tracker.attribute(1, MISSING_OUTPUT_ATTRIBUTE).as_deref(),
        Some("wordcount_1")
    );

    // Cleanup removed both staging directories.
    assert_eq!(harness.executor.calls_matching("rm -rf /tmp/1"), 1);
    assert!(!harness.local_job_dir(1).exists());

    let records = harness.accounting.records();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.job_id, 1);
    assert_eq!(record.user, "alice");
    assert_eq!(record.final_major_status, "Done");
    assert_eq!(record.cpu_time, 4.5);
    assert_eq!(record.input_data_size, 2048);
    assert_eq!(record.output_data_size, 512);
    assert_eq!(record.processed_events, 120);
    assert_eq!(record.output_sandbox_size, 5);
    assert_eq!(record.site, "BigData.CESGA.es");
    assert!(record.end_time >= record.start_time);
    assert_eq!(harness.accounting.commits(), 1);

    // Done entries are no longer polled.
    let report = monitor.run_once().await;
    assert_eq!(report.checked, 0);
    assert_eq!(harness.accounting.records().len(), 1);
}

#[tokio::test]
async fn test_missing_job_in_listing_becomes_unknown() {
    let toml = agent_toml(&[EndpointSpec::hadoop_v1("CESGA", 2)], 1, 4, "");
    let harness = Harness::new(&toml);
    submitted_job(&harness).await;
    harness
        .executor
        .respond("hadoop job -list all", &v1_listing(&[("job_other", 1)]));

    let report = harness.node.monitor().run_once().await;
    assert_eq!(report.transitions, 1);
    let entry = harness.ledger.get(1).unwrap().unwrap();
    assert_eq!(entry.status, LedgerStatus::Unknown);
}

#[tokio::test]
async fn test_entries_without_backend_id_are_not_polled() {
    let toml = agent_toml(&[EndpointSpec::hadoop_v1("CESGA", 2)], 1, 4, "");
    let harness = Harness::new(&toml);
    harness
        .ledger
        .insert(NewLedgerEntry {
            job_id: 5,
            endpoint_address: "nn.cesga.example.org".to_string(),
            ..NewLedgerEntry::default()
        })
        .unwrap();

    let report = harness.node.monitor().run_once().await;
    assert_eq!(report.checked, 1);
    assert_eq!(report.waiting, 1);
    assert_eq!(report.unacknowledged, 0);
    assert!(harness.executor.calls().is_empty());
    assert_eq!(
        harness.ledger.get(5).unwrap().unwrap().status,
        LedgerStatus::Submitted
    );
}

#[tokio::test]
async fn test_unacknowledged_submission_is_flagged_once() {
    let toml = agent_toml(
        &[EndpointSpec::hadoop_v1("CESGA", 2)],
        1,
        4,
        "unacknowledged_after_secs = 0",
    );
    let harness = Harness::new(&toml);
    harness
        .ledger
        .insert(NewLedgerEntry {
            job_id: 5,
            endpoint_address: "nn.cesga.example.org".to_string(),
            ..NewLedgerEntry::default()
        })
        .unwrap();

    let monitor = harness.node.monitor();
    let report = monitor.run_once().await;
    assert_eq!(report.unacknowledged, 1);

    let entry = harness.ledger.get(5).unwrap().unwrap();
    assert_eq!(entry.status, LedgerStatus::Submitted);
    assert!(entry.error_message.starts_with("Unacknowledged"));
    let tracked = harness.tracker.statuses(5);
    assert_eq!(tracked.len(), 1);
    assert_eq!(tracked[0].message, entry.error_message);

    let report = monitor.run_once().await;
    assert_eq!(report.unacknowledged, 0);
    assert_eq!(harness.tracker.statuses(5).len(), 1);
}

#[tokio::test]
async fn test_unchanged_entries_are_reported_stalled() {
    let toml = agent_toml(
        &[EndpointSpec::hadoop_v1("CESGA", 2)],
        1,
        4,
        "stalled_after_secs = 0",
    );
    let harness = Harness::new(&toml);
    submitted_job(&harness).await;
    harness.ledger.set_status(1, LedgerStatus::Running).unwrap();
    harness
        .executor
        .respond("hadoop job -list all", &v1_listing(&[(BACKEND_ID, 1)]));

    let report = harness.node.monitor().run_once().await;
    assert_eq!(report.transitions, 0);
    assert_eq!(report.stalled, 1);
    assert!(harness.tracker.attribute(1, STALLED_ATTRIBUTE).is_some());
}

#[tokio::test]
async fn test_jobs_on_unmonitored_endpoints_are_orphaned() {
    let toml = agent_toml(&[EndpointSpec::hadoop_v1("CESGA", 2)], 1, 4, "");
    let harness = Harness::new(&toml);
    harness
        .ledger
        .insert(NewLedgerEntry {
            job_id: 6,
            endpoint_address: "nn.gone.example.org".to_string(),
            ..NewLedgerEntry::default()
        })
        .unwrap();
    harness.ledger.set_backend_id(6, "job_x").unwrap();

    let report = harness.node.monitor().run_once().await;
    assert_eq!(report.orphaned, 1);
    assert!(harness.executor.calls().is_empty());
}

#[tokio::test]
async fn test_finished_job_keeps_staging_when_cleanup_disabled() {
    let toml = agent_toml(
        &[EndpointSpec::hadoop_v1("CESGA", 2)],
        1,
        4,
        "clean_after_finish = false",
    );
    let harness = Harness::new(&toml);
    submitted_job(&harness).await;
    harness
        .executor
        .respond("hadoop job -list all", &v1_listing(&[(BACKEND_ID, 2)]));
    harness.executor.respond("hadoop job -status", COMPLETION);

    let report = harness.node.monitor().run_once().await;
    assert_eq!(report.finished, 1);
    assert_eq!(
        harness.ledger.get(1).unwrap().unwrap().status,
        LedgerStatus::Done
    );
    assert_eq!(harness.executor.calls_matching("rm -rf"), 0);
    assert!(harness.local_job_dir(1).exists());
    assert_eq!(harness.accounting.records().len(), 1);
}

const PROBE_ID: &str = "job_1398930000000_0007";
const FINAL_ID: &str = "job_1398930000000_0008";

fn submitter_line(backend_id: &str) -> String {
    format!(
        "14/05/01 10:00:01 INFO mapreduce.JobSubmitter: Submitting tokens for job: {}\n",
        backend_id
    )
}

fn job_state(backend_id: &str, state: &str) -> String {
    format!("Job: {}\nJob File: hdfs://nn/job.xml\nJob state: {}\n", backend_id, state)
}

fn interactive_harness() -> Harness {
    let endpoint = EndpointSpec::hadoop_v1("CESGA", 2)
        .with_stack("hdv2", "none")
        .interactive();
    Harness::new(&agent_toml(&[endpoint], 1, 4, ""))
}

/// Launch the probe stage of interactive job 2.
async fn submitted_interactive_job(harness: &Harness) {
    harness.sandbox.add_input(2, "wc.jar", b"jar");
    harness.executor.respond("grep", &submitter_line(PROBE_ID));
    let attributes = JobAttributes {
        name: "wordcount".to_string(),
        owner: "alice".to_string(),
        owner_group: "cesga_user".to_string(),
        executable: Some("wc.jar".to_string()),
        ..JobAttributes::default()
    };
    harness.queue.describe(
        2,
        test_harness::JobDescription {
            arguments: None,
            dataset: Some("/cesga/data/words".to_string()),
            attributes: attributes.clone(),
        },
    );

    let (director, endpoint) = harness.director_for("CESGA");
    let request = SubmissionRequest::new(2, &endpoint, 1, "/cesga/data/words", attributes);
    assert_eq!(director.submit(&request).await.unwrap(), PROBE_ID);
}

#[tokio::test]
async fn test_finished_probe_resubmits_interactive_job() {
    let harness = interactive_harness();
    submitted_interactive_job(&harness).await;
    let monitor = harness.node.monitor();

    let probe_status = format!("hadoop job -status {}", PROBE_ID);
    harness
        .executor
        .respond(&probe_status, &job_state(PROBE_ID, "RUNNING"));
    assert_eq!(monitor.run_once().await.transitions, 1);

    harness
        .executor
        .respond(&probe_status, &job_state(PROBE_ID, "SUCCEEDED"));
    harness.executor.respond("grep", &submitter_line(FINAL_ID));
    let report = monitor.run_once().await;
    assert_eq!(report.resubmitted, 1);
    assert_eq!(report.finished, 0);

    let entry = harness.ledger.get(2).unwrap().unwrap();
    assert_eq!(entry.status, LedgerStatus::Submitted);
    assert_eq!(entry.backend_id, FINAL_ID);
    let history = harness.ledger.history(2).unwrap();
    let statuses: Vec<LedgerStatus> = history.iter().map(|h| h.entry.status).collect();
    assert_eq!(
        statuses,
        vec![LedgerStatus::Submitted, LedgerStatus::Running, LedgerStatus::Submitted]
    );
    assert_eq!(history[2].entry.backend_id, FINAL_ID);

    let last = harness.tracker.statuses(2).pop().unwrap();
    assert_eq!(last.status, "Submitted");
    assert_eq!(last.origin, ORIGIN_MONITOR);
    assert!(last.message.contains(FINAL_ID));

    // The probe is neither accounted nor cleaned up.
    assert!(harness.accounting.records().is_empty());
    assert_eq!(harness.executor.calls_matching("rm -rf"), 0);

    // The real job finishing completes the entry.
    harness.executor.respond(
        &format!("hadoop job -status {}", FINAL_ID),
        &job_state(FINAL_ID, "SUCCEEDED"),
    );
    let report = monitor.run_once().await;
    assert_eq!(report.finished, 1);
    assert_eq!(report.resubmitted, 0);
    assert_eq!(
        harness.ledger.get(2).unwrap().unwrap().status,
        LedgerStatus::Done
    );
    assert_eq!(harness.accounting.records().len(), 1);
    assert_eq!(harness.executor.calls_matching("rm -rf /tmp/2"), 1);
}

#[tokio::test]
async fn test_probe_finishing_before_running_adds_no_history_row() {
    let harness = interactive_harness();
    submitted_interactive_job(&harness).await;

    harness.executor.respond(
        &format!("hadoop job -status {}", PROBE_ID),
        &job_state(PROBE_ID, "SUCCEEDED"),
    );
    harness.executor.respond("grep", &submitter_line(FINAL_ID));
    let report = harness.node.monitor().run_once().await;
    assert_eq!(report.resubmitted, 1);

    let entry = harness.ledger.get(2).unwrap().unwrap();
    assert_eq!(entry.status, LedgerStatus::Submitted);
    assert_eq!(entry.backend_id, FINAL_ID);
    assert_eq!(harness.ledger.history(2).unwrap().len(), 1);

    let last = harness.tracker.statuses(2).pop().unwrap();
    assert_eq!(last.status, "Submitted");
    assert!(last.message.contains(FINAL_ID));
}
