mod common;

use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::process::Command;
use tempfile::tempdir;

#[test]
fn test_cli_index_blocks_cat() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let data = common::sample_data(200_000, 31);
    let path = common::write(dir.path(), "data.xz", &common::xz_streams(&data, 50_000));

    let mut cmd = Command::cargo_bin("zseek")?;
    cmd.arg("index").arg(&path);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("xz, 4 blocks").and(predicate::str::contains("200000 bytes uncompressed")));
    assert!(dir.path().join("data.xz.blockIdx").exists());

    let mut cmd = Command::cargo_bin("zseek")?;
    cmd.arg("blocks").arg(&path);
    cmd.assert().success().stdout(predicate::str::contains("check=").count(4));

    let mut cmd = Command::cargo_bin("zseek")?;
    cmd.args(["cat", "--offset", "49990", "--length", "20"]).arg(&path);
    let out = cmd.output()?;
    assert!(out.status.success());
    assert_eq!(out.stdout, &data[49_990..50_010]);

    Ok(())
}

#[test]
fn test_cli_cat_whole_file_with_stats() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let data = common::sample_data(150_000, 32);
    let path = common::write(dir.path(), "data.gz", &common::gzip(&data));

    let mut cmd = Command::cargo_bin("zseek")?;
    cmd.args(["--no-write-index", "--stats", "cat"]).arg(&path);
    let out = cmd.output()?;
    assert!(out.status.success());
    assert_eq!(out.stdout, data);
    assert!(String::from_utf8_lossy(&out.stderr).contains("cache:"));
    assert!(!dir.path().join("data.gz.blockIdx").exists());
    Ok(())
}

#[test]
fn test_cli_name_and_errors() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let tgz = common::write(dir.path(), "bundle.tgz", &common::gzip(b"tar bytes"));
    let plain = common::write(dir.path(), "notes.txt", b"not compressed at all");

    let mut cmd = Command::cargo_bin("zseek")?;
    cmd.arg("name").arg(&tgz);
    cmd.assert().success().stdout(predicate::str::diff("bundle.tar\n"));

    let mut cmd = Command::cargo_bin("zseek")?;
    cmd.arg("index").arg(&plain);
    cmd.assert().failure().stderr(predicate::str::contains("unrecognised compressed file"));
    Ok(())
}
