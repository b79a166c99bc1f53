use predicates::prelude::*;

mod common;

#[test]
fn test_status_table() {
    let mut ctx = common::drivecap();
    ctx.init();

    ctx.cmd
        .args(["status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Needs zero:"))
        .stdout(predicate::str::contains("Verify-invalidate:"))
        .stdout(predicate::str::contains("idle"))
        .stdout(predicate::str::contains("SNIFF_ENABLED"));
}

#[test]
fn test_status_json_reports_flags_and_report() {
    let ctx = common::drivecap();
    ctx.init();

    let status = ctx.status_json();
    assert_eq!(status["status"], "ready");
    assert_eq!(status["capacity_blocks"], 4 * 64);
    assert_eq!(status["chunk_size"], 64);
    assert_eq!(status["flags"], serde_json::json!(["SNIFF_ENABLED"]));
    assert_eq!(status["state"]["report"]["pass_count"], 0);
}

#[test]
fn test_status_without_drive_fails() {
    let mut ctx = common::drivecap();

    ctx.cmd
        .args(["status"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("drivecap init"));
}
