//! Integration test for the daemon's configuration-fault policy
//! (spec.md §7: "missing setting ... safe defaults used").
//!
//! Exercises `Settings::load` end to end against real files on disk
//! rather than constructing a `Settings` value directly, since the
//! behavior under test is specifically what happens when the YAML file
//! is missing, empty, or only partially specified.

use std::io::Write;

use sentryd::config::Settings;

#[test]
fn missing_file_surfaces_as_an_error_for_the_caller_to_default_from() {
    let result = Settings::load("/nonexistent/sentryd-settings.yaml");
    assert!(result.is_err());
}

#[test]
fn empty_file_yields_every_documented_default() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings.yaml");
    std::fs::write(&path, "").unwrap();

    let settings = Settings::load(&path).unwrap();
    assert_eq!(settings.queue.base, 2000);
    assert_eq!(settings.queue.count, 4);
    assert_eq!(settings.dict.path, std::path::PathBuf::from("/proc/net/dict"));
    assert_eq!(settings.certificate.ttl_secs, 24 * 60 * 60);
    assert_eq!(settings.classify.port, 443);
    assert_eq!(settings.reputation.host, "localhost");
    assert_eq!(settings.reputation.port, 8484);
    assert_eq!(settings.threat.sensitivity, 80);
    assert_eq!(settings.warehouse.replay_speed, 100);
    assert_eq!(settings.metrics.bind, "0.0.0.0:9090");
    assert_eq!(settings.logging.level, "info");
}

#[test]
fn partial_file_keeps_unspecified_sections_at_their_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings.yaml");
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(
        file,
        "queue:\n  base: 3000\n  count: 8\nthreat:\n  sensitivity: 50\n"
    )
    .unwrap();
    drop(file);

    let settings = Settings::load(&path).unwrap();
    assert_eq!(settings.queue.base, 3000);
    assert_eq!(settings.queue.count, 8);
    assert_eq!(settings.threat.sensitivity, 50);
    // Untouched sections still default.
    assert_eq!(settings.classify.port, 443);
    assert_eq!(settings.reputation.port, 8484);
}

#[test]
fn malformed_yaml_is_an_error_not_a_panic() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings.yaml");
    std::fs::write(&path, "queue:\n  base: [not, a, number]\n").unwrap();

    assert!(Settings::load(&path).is_err());
}
