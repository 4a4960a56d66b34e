//! ---
//! shdr_section: "15-testing-qa-runbook"
//! shdr_subsection: "integration-tests"
//! shdr_type: "source"
//! shdr_scope: "code"
//! shdr_description: "Validation of the shipped configuration and device model wiring."
//! shdr_version: "v0.0.0-prealpha"
//! shdr_owner: "tbd"
//! ---
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use shdr_agent::{observation_kind, DeviceModel, StaticDevice};
use shdr_codec::ObservationKind;
use shdr_common::config::ShdrConfig;

fn workspace_path(path: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("..").join(path)
}

fn read(path: &str) -> String {
    let full = workspace_path(path);
    fs::read_to_string(&full)
        .unwrap_or_else(|err| panic!("failed to read {}: {}", full.display(), err))
}

#[test]
fn example_config_parses_and_validates() {
    let config: ShdrConfig = read("configs/shdr.example.toml")
        .parse()
        .expect("example config is valid");
    assert_eq!(config.adapter.listen.port(), 7878);
    assert_eq!(config.adapter.interval, Duration::from_millis(100));
    assert_eq!(config.agent.endpoint(), "127.0.0.1:7878");
    assert_eq!(
        config.adapter.commands.get("manufacturer").map(String::as_str),
        Some("Acme")
    );
}

#[test]
fn example_device_covers_every_observation_kind() {
    let config: ShdrConfig = read("configs/shdr.example.toml")
        .parse()
        .expect("example config is valid");
    let device = StaticDevice::from_config(&config.agent.device);
    assert_eq!(device.name(), "mill-1");

    let kinds: Vec<_> = device.data_items().iter().map(observation_kind).collect();
    for kind in ObservationKind::ALL {
        assert!(kinds.contains(&kind), "example device lacks a {kind:?} item");
    }

    let execution = device.lookup("execution").expect("lookup by name");
    assert_eq!(execution.id, "exec");
    assert_eq!(device.lookup("exec").map(|d| d.id.as_str()), Some("exec"));
    assert!(device.lookup("spindle").is_none());
}

#[test]
fn invalid_device_is_rejected_on_load() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    write!(
        file,
        "[agent.device]\nname = \"mill\"\n\n\
         [[agent.device.data_items]]\nid = \"avail\"\ncategory = \"EVENT\"\n\n\
         [[agent.device.data_items]]\nid = \"avail\"\ncategory = \"SAMPLE\"\n"
    )
    .expect("write config");

    let err = ShdrConfig::load(&[file.path()]).expect_err("duplicate ids are rejected");
    assert!(
        format!("{err:#}").contains("avail"),
        "error should name the duplicate id: {err:#}"
    );
}

#[test]
fn zero_agent_heartbeat_is_rejected_on_load() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    write!(file, "[agent]\nhost = \"10.0.0.5\"\nheartbeat_ms = 0\n").expect("write config");

    let err = ShdrConfig::load(&[file.path()]).expect_err("zero heartbeat is rejected");
    assert!(
        format!("{err:#}").contains("heartbeat_ms"),
        "error should name the field: {err:#}"
    );
}
