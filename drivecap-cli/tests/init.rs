use predicates::prelude::*;

mod common;

#[test]
fn test_init_creates_drive() {
    let mut ctx = common::drivecap();

    ctx.cmd
        .args(["init", "--chunks", "4", "--chunk-size", "64", "--name", "scratch"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Created drive 'scratch'"));

    for file in ["drive.json", "disk.img", "chunkmap.bin", "nonpaged.json"] {
        assert!(ctx.path(file).exists(), "missing {}", file);
    }
    assert_eq!(
        std::fs::metadata(ctx.path("disk.img")).unwrap().len(),
        4 * 64 * 512
    );

    let status = ctx.status_json();
    assert_eq!(status["name"], "scratch");
    assert_eq!(status["chunks"]["total"], 4);
    assert_eq!(status["chunks"]["needs_zero"], 4);
    assert_eq!(status["state"]["zero_checkpoint"], 0);
}

#[test]
fn test_init_refuses_existing_drive() {
    let mut ctx = common::drivecap();
    ctx.init();

    ctx.cmd
        .args(["init", "--chunks", "8", "--chunk-size", "64"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));

    assert_eq!(ctx.status_json()["chunks"]["total"], 4);
}

#[test]
fn test_init_force_replaces_drive() {
    let mut ctx = common::drivecap();
    ctx.init();

    ctx.cmd
        .args(["init", "--chunks", "8", "--chunk-size", "64", "--force"])
        .assert()
        .success();

    assert_eq!(ctx.status_json()["chunks"]["total"], 8);
}

#[test]
fn test_init_rejects_bad_geometry() {
    let mut ctx = common::drivecap();

    ctx.cmd
        .args(["init", "--chunks", "4", "--chunk-size", "100"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("optimum block size"));

    assert!(!ctx.path("drive.json").exists());

    ctx.new_cmd()
        .args(["init", "--chunks", "0"])
        .assert()
        .failure();
}
