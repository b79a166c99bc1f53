use predicates::prelude::*;

mod common;

#[test]
fn test_scrub_requires_confirmation() {
    let mut ctx = common::drivecap();
    ctx.init();
    ctx.new_cmd().args(["run", "--engine", "zero"]).assert().success();

    ctx.cmd
        .args(["scrub"])
        .write_stdin("n\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("Aborted"));

    assert_eq!(ctx.status_json()["chunks"]["needs_zero"], 0);
}

#[test]
fn test_scrub_marks_every_chunk() {
    let mut ctx = common::drivecap();
    ctx.init();
    ctx.new_cmd().args(["run", "--engine", "zero"]).assert().success();

    ctx.cmd
        .args(["scrub", "--yes"])
        .assert()
        .success()
        .stdout(predicate::str::contains("marked for zeroing"));

    let status = ctx.status_json();
    assert_eq!(status["chunks"]["needs_zero"], 4);
    assert_eq!(status["state"]["zero_checkpoint"], 0);
}
