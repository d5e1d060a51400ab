#![cfg(feature = "storage-rocksdb")]

use assert_cmd::cargo_bin;
use std::process::Command;
use tempfile::tempdir;

mod common;

#[test]
fn test_rocksdb_persistence_recovery() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("test_db");

    // 1. First run: mirror the user and charge a task.
    let csv1 = common::events_csv(&[
        "User.Created, u-1, kesha, user",
        "Task.Created, , , , t-1, feed, u-1",
    ]);
    let output1 = Command::new(cargo_bin!("ates-ledger"))
        .arg("replay")
        .arg(csv1.path())
        .args(["--cost", "12", "--reward", "30"])
        .arg("--db-path")
        .arg(&db_path)
        .output()
        .expect("Failed to execute command");
    assert!(output1.status.success());
    assert!(String::from_utf8_lossy(&output1.stdout).contains("u-1,kesha,-12"));

    // 2. Second run: the task and its price survived, so completion and a
    // redelivered creation are applied against the recovered state.
    let csv2 = common::events_csv(&[
        "Task.Created, , , , t-1, feed, u-1",
        "Task.Completed, , , , t-1, feed, u-1",
    ]);
    let output2 = Command::new(cargo_bin!("ates-ledger"))
        .arg("replay")
        .arg(csv2.path())
        .args(["--cost", "99", "--reward", "30"])
        .arg("--db-path")
        .arg(&db_path)
        .output()
        .expect("Failed to execute command");
    assert!(output2.status.success());
    assert!(String::from_utf8_lossy(&output2.stdout).contains("u-1,kesha,18"));

    // 3. Third run: closing pays the recovered balance out.
    let csv3 = common::events_csv(&[]);
    let output3 = Command::new(cargo_bin!("ates-ledger"))
        .arg("replay")
        .arg(csv3.path())
        .arg("--close-cycle")
        .arg("--db-path")
        .arg(&db_path)
        .output()
        .expect("Failed to execute command");
    assert!(output3.status.success());
    assert!(String::from_utf8_lossy(&output3.stdout).contains("u-1,kesha,0"));
}
