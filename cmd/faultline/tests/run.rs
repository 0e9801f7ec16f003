#![allow(clippy::unwrap_used, clippy::expect_used)]

use chrono::{DateTime, Duration as ChronoDuration};
use faultline::{
    cli::analyze_all,
    io::{read_problems, write_diagnoses},
    selfcheck,
};
use faultline_engine::{FaultlineConfig, Investigator, Problem, StaticTelemetry};
use serde_json::json;
use std::{path::Path, sync::Arc, time::Duration};

const RANGE: &str = "2025-09-16 10:20:00 ~ 2025-09-16 10:25:00";

/// Pod CPU of `service` at 10% with a 60% burst during the alarm.
fn cpu_fixture(service: &str) -> serde_json::Value {
    let start = DateTime::parse_from_rfc3339("2025-09-16T10:20:00+08:00").unwrap();
    let points: Vec<serde_json::Value> = (-10..=15)
        .map(|m| {
            let value = if (1..=5).contains(&m) { 60.0 } else { 10.0 };
            json!([(start + ChronoDuration::minutes(m)).to_rfc3339(), value])
        })
        .collect();
    json!({ "series": [{ "entity": service, "signal": "pod_cpu", "points": points }] })
}

fn write(path: &Path, body: &str) {
    std::fs::write(path, body).unwrap();
}

fn problem_line(id: &str, rule: &str) -> String {
    json!({
        "problem_id": id,
        "time_range": RANGE,
        "candidate_root_causes": ["quote.cpu", "quote.memory", "ad.cpu"],
        "alarm_rules": [rule],
    })
    .to_string()
}

#[tokio::test]
async fn fixtures_drive_a_full_run() {
    let dir = tempfile::tempdir().unwrap();
    let fixtures = dir.path().join("fixtures.json");
    let input = dir.path().join("input.jsonl");
    let output = dir.path().join("output.jsonl");

    write(&fixtures, &cpu_fixture("quote").to_string());
    write(
        &input,
        &format!(
            "{}\n\n{}\nnot json\n",
            problem_line("001", "greyFailure"),
            problem_line("002", "disk_full"),
        ),
    );

    let telemetry = StaticTelemetry::from_path(&fixtures).unwrap();
    let investigator = Investigator::new(Arc::new(telemetry), FaultlineConfig::default());

    let problems = read_problems(&input).unwrap();
    assert_eq!(problems.len(), 2);

    let diagnoses = analyze_all(&investigator, &problems, Duration::from_secs(30)).await;
    assert_eq!(diagnoses.len(), 1);
    write_diagnoses(&output, &diagnoses, false).unwrap();

    let written = std::fs::read_to_string(&output).unwrap();
    assert_eq!(written, "{\"problem_id\":\"001\",\"root_causes\":[\"quote.cpu\"]}\n");

    // the same output checked against a matching answer file
    let answers = dir.path().join("answers.jsonl");
    write(&answers, &written);
    let report = selfcheck::run(&answers, &output, &input).unwrap();
    assert_eq!((report.total, report.matched), (1, 1));
}

#[tokio::test]
async fn slow_problem_times_out_with_no_root_causes() {
    let mut telemetry = StaticTelemetry::new();
    telemetry.delay_entity("quote", Duration::from_secs(5));
    let investigator = Investigator::new(Arc::new(telemetry), FaultlineConfig::default());

    let problem: Problem = serde_json::from_str(&problem_line("003", "service_avg_rt")).unwrap();

    let diagnoses = analyze_all(&investigator, &[problem], Duration::from_millis(50)).await;
    assert_eq!(diagnoses.len(), 1);
    let diagnosis = diagnoses.first().unwrap();
    assert_eq!(diagnosis.problem_id, "003");
    assert!(diagnosis.root_causes.is_empty());
}
