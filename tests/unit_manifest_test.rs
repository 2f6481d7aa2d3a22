// Unit tests for pattern manifest loading and validation.

use citrine::core::launcher::IsolationLevel;
use citrine::core::launcher::manifest::{ManifestSet, PatternManifest};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

fn write_executable(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, "#!/bin/sh\nsleep 60\n").unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }
    path
}

fn write_manifest(dir: &Path, file: &str, body: &str) -> PathBuf {
    let path = dir.join(file);
    fs::write(&path, body).unwrap();
    path
}

#[test]
fn valid_manifest_parses_with_defaults() {
    let dir = TempDir::new().unwrap();
    write_executable(dir.path(), "pattern.sh");
    let path = write_manifest(
        dir.path(),
        "pattern.yaml",
        "name: test-pattern\nversion: \"1.0.0\"\nexecutable: pattern.sh\nisolation_level: namespace\nhealthcheck:\n  port: 18080\n  path: /healthz\n",
    );

    let manifest = PatternManifest::from_file(&path).unwrap();
    assert_eq!(manifest.name, "test-pattern");
    assert_eq!(manifest.isolation_level, IsolationLevel::Namespace);
    assert_eq!(manifest.healthcheck.interval, Duration::from_secs(30));
    assert_eq!(manifest.healthcheck.timeout, Duration::from_secs(5));
    assert_eq!(manifest.healthcheck.failure_threshold, 3);
    assert_eq!(
        manifest.resolved_executable(),
        dir.path().join("pattern.sh")
    );
}

#[test]
fn optional_fields_are_honored() {
    let dir = TempDir::new().unwrap();
    write_executable(dir.path(), "pattern.sh");
    let path = write_manifest(
        dir.path(),
        "pattern.yaml",
        "name: test-pattern\nversion: \"2.1.0\"\nexecutable: pattern.sh\nisolation_level: session\nhealthcheck:\n  port: 18080\n  path: /ready\n  interval: 10s\n  timeout: 2s\n  failure_threshold: 5\nresources:\n  cpu_limit: \"2\"\n  memory_limit: 512Mi\nenvironment:\n  LOG_LEVEL: debug\nbackend_slots: 4\n",
    );

    let manifest = PatternManifest::from_file(&path).unwrap();
    assert_eq!(manifest.healthcheck.interval, Duration::from_secs(10));
    assert_eq!(manifest.healthcheck.failure_threshold, 5);
    assert_eq!(
        manifest.environment.get("LOG_LEVEL").map(String::as_str),
        Some("debug")
    );
    assert_eq!(manifest.backend_slots, Some(4));
}

#[test]
fn missing_required_fields_are_rejected() {
    let dir = TempDir::new().unwrap();
    write_executable(dir.path(), "pattern.sh");
    let path = write_manifest(
        dir.path(),
        "bad.yaml",
        "name: test-pattern\nexecutable: pattern.sh\nisolation_level: none\nhealthcheck:\n  port: 18080\n  path: /healthz\n",
    );
    assert!(PatternManifest::from_file(&path).is_err());
}

#[test]
fn invalid_isolation_level_is_rejected() {
    let dir = TempDir::new().unwrap();
    write_executable(dir.path(), "pattern.sh");
    let path = write_manifest(
        dir.path(),
        "bad.yaml",
        "name: test-pattern\nversion: \"1.0.0\"\nexecutable: pattern.sh\nisolation_level: per-thread\nhealthcheck:\n  port: 18080\n  path: /healthz\n",
    );
    assert!(PatternManifest::from_file(&path).is_err());
}

#[test]
fn missing_executable_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = write_manifest(
        dir.path(),
        "bad.yaml",
        "name: test-pattern\nversion: \"1.0.0\"\nexecutable: nonexistent.sh\nisolation_level: none\nhealthcheck:\n  port: 18080\n  path: /healthz\n",
    );
    assert!(PatternManifest::from_file(&path).is_err());
}

#[cfg(unix)]
#[test]
fn non_executable_file_is_rejected() {
    use std::os::unix::fs::PermissionsExt;
    let dir = TempDir::new().unwrap();
    let exe = dir.path().join("pattern.sh");
    fs::write(&exe, "#!/bin/sh\n").unwrap();
    fs::set_permissions(&exe, fs::Permissions::from_mode(0o644)).unwrap();
    let path = write_manifest(
        dir.path(),
        "bad.yaml",
        "name: test-pattern\nversion: \"1.0.0\"\nexecutable: pattern.sh\nisolation_level: none\nhealthcheck:\n  port: 18080\n  path: /healthz\n",
    );
    assert!(PatternManifest::from_file(&path).is_err());
}

#[test]
fn out_of_range_health_port_is_rejected() {
    let dir = TempDir::new().unwrap();
    write_executable(dir.path(), "pattern.sh");
    for port in ["0", "70000"] {
        let path = write_manifest(
            dir.path(),
            "bad.yaml",
            &format!(
                "name: test-pattern\nversion: \"1.0.0\"\nexecutable: pattern.sh\nisolation_level: none\nhealthcheck:\n  port: {port}\n  path: /healthz\n"
            ),
        );
        assert!(PatternManifest::from_file(&path).is_err(), "port {port} accepted");
    }
}

#[test]
fn health_path_must_be_absolute() {
    let dir = TempDir::new().unwrap();
    write_executable(dir.path(), "pattern.sh");
    let path = write_manifest(
        dir.path(),
        "bad.yaml",
        "name: test-pattern\nversion: \"1.0.0\"\nexecutable: pattern.sh\nisolation_level: none\nhealthcheck:\n  port: 18080\n  path: healthz\n",
    );
    assert!(PatternManifest::from_file(&path).is_err());
}

#[test]
fn load_dir_collects_every_manifest() {
    let dir = TempDir::new().unwrap();
    write_executable(dir.path(), "a.sh");
    write_executable(dir.path(), "b.sh");
    write_manifest(
        dir.path(),
        "a.yaml",
        "name: pattern-a\nversion: \"1.0.0\"\nexecutable: a.sh\nisolation_level: none\nhealthcheck:\n  port: 18080\n  path: /healthz\n",
    );
    write_manifest(
        dir.path(),
        "b.yml",
        "name: pattern-b\nversion: \"1.0.0\"\nexecutable: b.sh\nisolation_level: namespace\nhealthcheck:\n  port: 18090\n  path: /healthz\n",
    );
    write_manifest(dir.path(), "notes.txt", "not a manifest");

    let set = ManifestSet::load_dir(dir.path()).unwrap();
    assert_eq!(set.len(), 2);
    assert!(set.get("pattern-a").is_some());
    assert!(set.get("pattern-b").is_some());
}
