//! `slimprobe config` and configuration loading with real TOML files.

use std::fs;

use serial_test::serial;
use tempfile::TempDir;

use slimprobe_cli::cli::{ConfigAction, ConfigArgs, OutputFormat, ProfileArgs};
use slimprobe_cli::commands::{config, load_config};
use slimprobe_cli::output::OutputWriter;

fn write_config(dir: &TempDir, content: &str) -> std::path::PathBuf {
    let path = dir.path().join("slimprobe.toml");
    fs::write(&path, content).expect("should write config");
    path
}

#[tokio::test]
#[serial]
async fn test_validate_accepts_a_complete_file() {
    let dir = TempDir::new().expect("should create temp dir");
    let path = write_config(
        &dir,
        r#"
[general]
log_level = "debug"
log_format = "json"

[container]
image = "nginx:latest"
expose = ["8080"]

[sensor]
ipc_mode = "direct"

[http_probe]
retry_count = 3
crawl_max_depth = 2

[[http_probe.commands]]
method = "POST"
resource = "/api"
crawl = true

[continue_after]
mode = "probe&timeout"
timeout_secs = 30
"#,
    );

    let args = ConfigArgs {
        action: ConfigAction::Validate,
    };
    config::execute(args, Some(&path), &OutputWriter::new(OutputFormat::Json))
        .await
        .expect("valid config");
}

#[tokio::test]
#[serial]
async fn test_validate_rejects_unknown_mode() {
    let dir = TempDir::new().expect("should create temp dir");
    let path = write_config(&dir, "[continue_after]\nmode = \"whenever\"\n");

    let args = ConfigArgs {
        action: ConfigAction::Validate,
    };
    let err = config::execute(args, Some(&path), &OutputWriter::new(OutputFormat::Json))
        .await
        .expect_err("invalid mode");
    assert_eq!(err.exit_code(), 2);
}

#[tokio::test]
#[serial]
async fn test_show_rejects_unknown_section() {
    let args = ConfigArgs {
        action: ConfigAction::Show {
            section: Some("tracing".to_owned()),
        },
    };
    let err = config::execute(args, None, &OutputWriter::new(OutputFormat::Json))
        .await
        .expect_err("unknown section");
    assert!(err.to_string().contains("unknown section"));
}

#[tokio::test]
#[serial]
async fn test_env_overrides_sit_between_file_and_flags() {
    let dir = TempDir::new().expect("should create temp dir");
    let path = write_config(
        &dir,
        "[http_probe]\nretry_count = 2\n\n[continue_after]\nmode = \"enter\"\n",
    );

    // SAFETY: serialized with every other env-touching test
    unsafe {
        std::env::set_var("SLIMPROBE_HTTP_PROBE_RETRY_COUNT", "7");
        std::env::set_var("SLIMPROBE_CONTINUE_AFTER_MODE", "signal");
    }

    let from_env = load_config(Some(&path), None, None).await;

    let args = ProfileArgs {
        image: "app".to_owned(),
        continue_after: Some("timeout".to_owned()),
        ..ProfileArgs::default()
    };
    let from_flags = load_config(Some(&path), None, Some(&args)).await;

    unsafe {
        std::env::remove_var("SLIMPROBE_HTTP_PROBE_RETRY_COUNT");
        std::env::remove_var("SLIMPROBE_CONTINUE_AFTER_MODE");
    }

    let from_env = from_env.expect("env config loads");
    assert_eq!(from_env.http_probe.retry_count, 7);
    assert_eq!(from_env.continue_after.mode, "signal");

    let from_flags = from_flags.expect("flag config loads");
    assert_eq!(from_flags.http_probe.retry_count, 7);
    assert_eq!(from_flags.continue_after.mode, "timeout");
}

#[tokio::test]
#[serial]
async fn test_host_exec_flag_satisfies_host_exec_mode() {
    let args = ProfileArgs {
        image: "app".to_owned(),
        continue_after: Some("host-exec".to_owned()),
        ..ProfileArgs::default()
    };
    assert!(load_config(None, None, Some(&args)).await.is_err());

    let args = ProfileArgs {
        host_exec: vec!["curl -s localhost:8080".to_owned()],
        ..args
    };
    let config = load_config(None, None, Some(&args)).await.expect("valid");
    assert_eq!(config.http_probe.host_exec_probes.len(), 1);
}
