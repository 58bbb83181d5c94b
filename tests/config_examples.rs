//! ---
//! ems_section: "15-testing-qa-runbook"
//! ems_subsection: "integration-tests"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Validation of the shipped example configuration and command script."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use msim_common::config::AppConfig;
use msim_fleet::parse_commands;

fn repo_path(path: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("..").join(path)
}

fn read(path: &str) -> String {
    let full = repo_path(path);
    fs::read_to_string(&full)
        .unwrap_or_else(|err| panic!("failed to read {}: {}", full.display(), err))
}

#[test]
fn example_fleet_config_loads_and_validates() {
    let config = AppConfig::from_path(&repo_path("configs/fleet.example.toml"))
        .expect("example config must validate");
    assert_eq!(config.simulation.random_seed, Some(42));
    assert_eq!(config.devices.len(), 3);
    let ids: Vec<_> = config.devices.keys().map(String::as_str).collect();
    assert_eq!(ids, ["meter-001", "meter-002", "meter-003"]);

    let meter_two = config.device("meter-002").expect("meter-002");
    assert_eq!(meter_two.send_interval_or(&config.simulation), Duration::from_secs(2));
    assert!(config.device("meter-003").unwrap().credential.is_none());
}

#[test]
fn example_config_files_carry_frontmatter() {
    let content = read("configs/fleet.example.toml");
    assert!(
        content.starts_with("# ---"),
        "fleet.example.toml must include frontmatter header"
    );
}

#[test]
fn example_command_script_targets_configured_devices() {
    let config = AppConfig::from_path(&repo_path("configs/fleet.example.toml")).unwrap();
    let records = parse_commands(&read("configs/commands.example.ndjson"))
        .expect("example command script must parse");
    assert!(!records.is_empty());
    for record in records {
        assert!(
            config.device(&record.device).is_some(),
            "command targets unknown device {}",
            record.device
        );
    }
}
