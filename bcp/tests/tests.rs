use predicates::prelude::PredicateBooleanExt;

fn bcp() -> assert_cmd::Command {
    assert_cmd::Command::cargo_bin("bcp").unwrap()
}

fn patterned(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

fn setup_source(content: &[u8]) -> (tempfile::TempDir, std::path::PathBuf, std::path::PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src.bin");
    let dst = dir.path().join("dst.bin");
    std::fs::write(&src, content).unwrap();
    (dir, src, dst)
}

#[test]
fn check_bcp_help() {
    bcp().arg("--help").assert().success();
}

#[test]
fn check_bcp_version() {
    bcp().arg("--version").assert().success();
}

#[test]
fn test_block_copy_with_partial_last_block() {
    let content = patterned(100_000);
    let (_dir, src, dst) = setup_source(&content);
    bcp()
        .args([
            "--mode",
            "blocks",
            "--block-size",
            "4KiB",
            "--workers",
            "3",
            src.to_str().unwrap(),
            dst.to_str().unwrap(),
        ])
        .assert()
        .success();
    assert_eq!(std::fs::read(&dst).unwrap(), content);
}

#[test]
fn test_auto_mode_copies_regular_file() {
    let content = patterned(10_000);
    let (_dir, src, dst) = setup_source(&content);
    bcp()
        .args([
            "--block-size",
            "1KiB",
            src.to_str().unwrap(),
            dst.to_str().unwrap(),
        ])
        .assert()
        .success();
    assert_eq!(std::fs::read(&dst).unwrap(), content);
}

#[test]
fn test_sequential_copy() {
    let content = patterned(70_000);
    let (_dir, src, dst) = setup_source(&content);
    bcp()
        .args([
            "--mode",
            "sequential",
            "--buffer-size",
            "1000",
            src.to_str().unwrap(),
            dst.to_str().unwrap(),
        ])
        .assert()
        .success();
    assert_eq!(std::fs::read(&dst).unwrap(), content);
}

#[test]
fn test_empty_file() {
    let (_dir, src, dst) = setup_source(b"");
    bcp()
        .args([src.to_str().unwrap(), dst.to_str().unwrap()])
        .assert()
        .success();
    assert_eq!(std::fs::read(&dst).unwrap().len(), 0);
    // an explicit block copy of an empty file only creates the destination
    std::fs::remove_file(&dst).unwrap();
    bcp()
        .args([
            "--mode",
            "blocks",
            src.to_str().unwrap(),
            dst.to_str().unwrap(),
        ])
        .assert()
        .success();
    assert_eq!(std::fs::read(&dst).unwrap().len(), 0);
}

#[test]
fn test_stdin_to_file() {
    let content = patterned(5_000);
    let dir = tempfile::tempdir().unwrap();
    let dst = dir.path().join("out.bin");
    bcp()
        .args(["-", dst.to_str().unwrap()])
        .write_stdin(content.clone())
        .assert()
        .success();
    assert_eq!(std::fs::read(&dst).unwrap(), content);
}

#[test]
fn test_file_to_stdout() {
    let content = patterned(5_000);
    let (_dir, src, _dst) = setup_source(&content);
    bcp()
        .args(["--summary", src.to_str().unwrap(), "-"])
        .assert()
        .success()
        .stdout(content)
        .stderr(predicates::str::contains("bytes written"));
}

#[test]
fn test_block_mode_rejects_streams() {
    let dir = tempfile::tempdir().unwrap();
    let dst = dir.path().join("out.bin");
    bcp()
        .args(["--mode", "blocks", "-", dst.to_str().unwrap()])
        .write_stdin("data")
        .assert()
        .failure()
        .code(1)
        .stderr(predicates::str::contains("sequentially"));
    assert!(!dst.exists());
}

#[test]
fn test_existing_destination_needs_overwrite() {
    let content = patterned(3_000);
    let (_dir, src, dst) = setup_source(&content);
    std::fs::write(&dst, vec![0xffu8; 9_000]).unwrap();
    bcp()
        .args([src.to_str().unwrap(), dst.to_str().unwrap()])
        .assert()
        .failure()
        .code(1)
        .stderr(predicates::str::contains("already exists"));
    assert_eq!(std::fs::read(&dst).unwrap().len(), 9_000);
    // a longer destination is truncated to the source length
    bcp()
        .args([
            "--overwrite",
            "--block-size",
            "1KiB",
            src.to_str().unwrap(),
            dst.to_str().unwrap(),
        ])
        .assert()
        .success();
    assert_eq!(std::fs::read(&dst).unwrap(), content);
}

#[test]
fn test_copy_onto_itself_is_rejected() {
    let content = patterned(4_000);
    let (dir, src, _dst) = setup_source(&content);
    let alias = dir.path().join(".").join("src.bin");
    for mode in ["sequential", "blocks"] {
        bcp()
            .args([
                "--overwrite",
                "--mode",
                mode,
                src.to_str().unwrap(),
                alias.to_str().unwrap(),
            ])
            .assert()
            .failure()
            .code(1)
            .stderr(predicates::str::contains("same file"));
        assert_eq!(std::fs::read(&src).unwrap(), content);
    }
}

#[test]
fn test_missing_source_fails() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("missing.bin");
    let dst = dir.path().join("dst.bin");
    bcp()
        .args([src.to_str().unwrap(), dst.to_str().unwrap()])
        .assert()
        .failure()
        .code(1)
        .stderr(predicates::str::contains("missing.bin"));
    assert!(!dst.exists());
}

#[test]
fn test_quiet_suppresses_errors() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("missing.bin");
    let dst = dir.path().join("dst.bin");
    bcp()
        .args(["--quiet", src.to_str().unwrap(), dst.to_str().unwrap()])
        .assert()
        .failure()
        .code(1)
        .stderr(predicates::str::is_empty());
}

#[test]
fn test_config_file() {
    let content = patterned(20_000);
    let (dir, src, dst) = setup_source(&content);
    let config = dir.path().join("bcp.json");
    std::fs::write(
        &config,
        serde_json::json!({
            "mode": "blocks",
            "block_size": 512,
            "workers": 2,
            "progress_delay": "50ms",
        })
        .to_string(),
    )
    .unwrap();
    bcp()
        .args([
            "--config",
            config.to_str().unwrap(),
            "--summary",
            src.to_str().unwrap(),
            dst.to_str().unwrap(),
        ])
        .assert()
        .success()
        // 20000 bytes in 512 byte blocks
        .stderr(predicates::str::contains("chunks written: 40"));
    assert_eq!(std::fs::read(&dst).unwrap(), content);
}

#[test]
fn test_invalid_config_is_rejected() {
    let (dir, src, dst) = setup_source(b"abc");
    let config = dir.path().join("bcp.json");
    std::fs::write(&config, r#"{"block_sise": 512}"#).unwrap();
    bcp()
        .args([
            "--config",
            config.to_str().unwrap(),
            src.to_str().unwrap(),
            dst.to_str().unwrap(),
        ])
        .assert()
        .failure()
        .stderr(predicates::str::contains("block_sise").and(predicates::str::contains("bcp.json")));
    assert!(!dst.exists());
}

#[test]
fn test_zero_block_size_is_rejected() {
    let (_dir, src, dst) = setup_source(b"abc");
    bcp()
        .args([
            "--block-size",
            "0",
            src.to_str().unwrap(),
            dst.to_str().unwrap(),
        ])
        .assert()
        .failure()
        .stderr(predicates::str::contains("block_size"));
    assert!(!dst.exists());
}

#[test]
fn test_progress_output() {
    let content = patterned(50_000);
    let (_dir, src, dst) = setup_source(&content);
    bcp()
        .args([
            "--progress-delay",
            "1ms",
            "--workers",
            "2",
            "--block-size",
            "1KiB",
            src.to_str().unwrap(),
            dst.to_str().unwrap(),
        ])
        .assert()
        .success();
    assert_eq!(std::fs::read(&dst).unwrap(), content);
}
