//! CLI integration tests
//!
//! Tests the command-line interface end-to-end.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use tempfile::TempDir;

/// Run saltybatch with passphrase from stdin and a cheap KDF
fn run_saltybatch_with_passphrase(args: &[&str], passphrase: &str) -> Output {
    let mut child = Command::new(env!("CARGO_BIN_EXE_saltybatch"))
        .args(["--passphrase-stdin", "--kdf-iterations", "1024"])
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();

    {
        let stdin = child.stdin.as_mut().expect("failed to open stdin");
        // The command may exit before reading stdin (e.g. on a usage error).
        let _ = stdin.write_all(passphrase.as_bytes());
    }

    child.wait_with_output().unwrap()
}

fn arg(path: &Path) -> &str {
    path.to_str().unwrap()
}

fn write(dir: &TempDir, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, content).unwrap();
    path
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn test_encrypt_decrypt_roundtrip() {
    let temp_dir = TempDir::new().unwrap();
    let first = write(&temp_dir, "first.txt", b"Hello, World!");
    let second = write(&temp_dir, "second.txt", b"Another file");

    let result = run_saltybatch_with_passphrase(&["-e", arg(&first), arg(&second)], "test\n");
    assert!(result.status.success(), "encrypt failed: {}", stderr(&result));

    let first_sealed = temp_dir.path().join("first.txt.salty");
    let second_sealed = temp_dir.path().join("second.txt.salty");
    assert!(first_sealed.exists());
    assert!(second_sealed.exists());
    assert_ne!(fs::read(&first_sealed).unwrap(), b"Hello, World!");

    fs::remove_file(&first).unwrap();
    fs::remove_file(&second).unwrap();

    let result =
        run_saltybatch_with_passphrase(&["-d", arg(&first_sealed), arg(&second_sealed)], "test\n");
    assert!(result.status.success(), "decrypt failed: {}", stderr(&result));

    assert_eq!(fs::read(&first).unwrap(), b"Hello, World!");
    assert_eq!(fs::read(&second).unwrap(), b"Another file");
}

#[test]
fn test_direction_is_inferred_from_suffix() {
    let temp_dir = TempDir::new().unwrap();
    let plain = write(&temp_dir, "notes.txt", b"inferred");

    let result = run_saltybatch_with_passphrase(&[arg(&plain)], "test");
    assert!(result.status.success(), "{}", stderr(&result));
    let sealed = temp_dir.path().join("notes.txt.salty");
    assert!(sealed.exists());

    fs::remove_file(&plain).unwrap();
    let result = run_saltybatch_with_passphrase(&[arg(&sealed)], "test");
    assert!(result.status.success(), "{}", stderr(&result));
    assert_eq!(fs::read(&plain).unwrap(), b"inferred");
}

#[test]
fn test_decrypt_with_wrong_passphrase_fails() {
    let temp_dir = TempDir::new().unwrap();
    let plain = write(&temp_dir, "secret.txt", b"Secret content");

    let result = run_saltybatch_with_passphrase(&["-e", arg(&plain)], "correct");
    assert!(result.status.success(), "{}", stderr(&result));
    fs::remove_file(&plain).unwrap();

    let sealed = temp_dir.path().join("secret.txt.salty");
    let result = run_saltybatch_with_passphrase(&["-d", arg(&sealed)], "wrong");
    assert!(!result.status.success());
    assert!(
        stderr(&result).contains("saltybatch Error: Failed to decrypt"),
        "unexpected stderr: {}",
        stderr(&result)
    );
    assert!(!plain.exists());
}

#[test]
fn test_existing_output_is_not_overwritten() {
    let temp_dir = TempDir::new().unwrap();
    let plain = write(&temp_dir, "a.txt", b"new");
    let existing = write(&temp_dir, "a.txt.salty", b"keep me");

    let result = run_saltybatch_with_passphrase(&["-e", arg(&plain)], "test");
    assert!(!result.status.success());
    assert!(stderr(&result).contains("Output file already exists"));
    assert_eq!(fs::read(&existing).unwrap(), b"keep me");
}

#[test]
fn test_decrypt_requires_suffix() {
    let temp_dir = TempDir::new().unwrap();
    let plain = write(&temp_dir, "plain.txt", b"not encrypted");

    let result = run_saltybatch_with_passphrase(&["-d", arg(&plain)], "test");
    assert!(!result.status.success());
    assert!(stderr(&result).contains(".salty"));
    assert_eq!(fs::read_dir(temp_dir.path()).unwrap().count(), 1);
}

#[test]
fn test_nonexistent_file_fails() {
    let temp_dir = TempDir::new().unwrap();
    let missing = temp_dir.path().join("nonexistent.txt");

    let result = run_saltybatch_with_passphrase(&["-e", arg(&missing)], "test");
    assert!(!result.status.success());
    assert!(!temp_dir.path().join("nonexistent.txt.salty").exists());
}

#[test]
fn test_empty_passphrase_does_nothing() {
    let temp_dir = TempDir::new().unwrap();
    let plain = write(&temp_dir, "a.txt", b"content");

    let result = run_saltybatch_with_passphrase(&["-e", arg(&plain)], "");
    assert!(result.status.success(), "{}", stderr(&result));
    assert!(!temp_dir.path().join("a.txt.salty").exists());
}

#[test]
fn test_usage_errors() {
    let result = run_saltybatch_with_passphrase(&[], "test");
    assert!(!result.status.success());

    let temp_dir = TempDir::new().unwrap();
    let plain = write(&temp_dir, "a.txt", b"content");
    let result = run_saltybatch_with_passphrase(&["-e", "-d", arg(&plain)], "test");
    assert!(!result.status.success());
    assert!(!temp_dir.path().join("a.txt.salty").exists());
}

#[test]
fn test_empty_file_roundtrip() {
    let temp_dir = TempDir::new().unwrap();
    let plain = write(&temp_dir, "empty.txt", b"");

    let result = run_saltybatch_with_passphrase(&["-e", arg(&plain)], "test");
    assert!(result.status.success(), "{}", stderr(&result));
    fs::remove_file(&plain).unwrap();

    let sealed = temp_dir.path().join("empty.txt.salty");
    let result = run_saltybatch_with_passphrase(&["-d", arg(&sealed)], "test");
    assert!(result.status.success(), "{}", stderr(&result));
    assert_eq!(fs::read(&plain).unwrap(), b"");
}

#[test]
fn test_large_file_roundtrip() {
    let temp_dir = TempDir::new().unwrap();
    let large_content: Vec<u8> = (0..1_000_000u32).map(|i| (i % 251) as u8).collect();
    let plain = write(&temp_dir, "large.bin", &large_content);

    let result = run_saltybatch_with_passphrase(&["-e", arg(&plain)], "test");
    assert!(result.status.success(), "{}", stderr(&result));
    fs::remove_file(&plain).unwrap();

    let sealed = temp_dir.path().join("large.bin.salty");
    let result = run_saltybatch_with_passphrase(&["-d", arg(&sealed)], "test");
    assert!(result.status.success(), "{}", stderr(&result));
    assert_eq!(fs::read(&plain).unwrap(), large_content);
}

/// Reads from a FIFO so the transfer is guaranteed to still be running when
/// the signal arrives.
#[cfg(unix)]
#[test]
fn test_sigterm_mid_transfer_removes_partial_output() {
    use std::fs::OpenOptions;
    use std::thread;
    use std::time::{Duration, Instant};

    let temp_dir = TempDir::new().unwrap();
    let fifo = temp_dir.path().join("stream.bin");
    let status = Command::new("mkfifo").arg(&fifo).status().unwrap();
    assert!(status.success());
    let sealed = temp_dir.path().join("stream.bin.salty");

    let mut child = Command::new(env!("CARGO_BIN_EXE_saltybatch"))
        .args(["--passphrase-stdin", "--kdf-iterations", "1024", "-e", arg(&fifo)])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    {
        let mut stdin = child.stdin.take().unwrap();
        stdin.write_all(b"test").unwrap();
    }

    // Blocks until the child opens the FIFO for reading.
    let mut writer = OpenOptions::new().write(true).open(&fifo).unwrap();
    writer.write_all(&[7u8; 1000]).unwrap();

    let started = Instant::now();
    while !sealed.exists() {
        assert!(started.elapsed() < Duration::from_secs(30), "output never appeared");
        thread::sleep(Duration::from_millis(10));
    }

    let status = Command::new("kill")
        .args(["-TERM", &child.id().to_string()])
        .status()
        .unwrap();
    assert!(status.success());

    // Give the cancel request time to land, then feed a full chunk so the
    // engine reaches its next cancellation check.
    thread::sleep(Duration::from_millis(500));
    let _ = writer.write_all(&[7u8; 70_000]);
    drop(writer);

    let output = child.wait_with_output().unwrap();
    assert_eq!(output.status.code(), Some(130), "{}", stderr(&output));
    assert!(!sealed.exists());
}
