//! `slimprobe config` command handler

use std::io::Write;
use std::path::Path;

use serde::Serialize;
use tracing::info;

use slimprobe_core::config::SlimprobeConfig;

use crate::cli::{ConfigAction, ConfigArgs};
use crate::commands::{load_config, source_name};
use crate::error::CliError;
use crate::output::{OutputWriter, Render};

const SECTIONS: &[&str] = &["general", "container", "sensor", "http_probe", "continue_after"];

/// Execute the `config` command.
pub async fn execute(
    args: ConfigArgs,
    config_path: Option<&Path>,
    writer: &OutputWriter,
) -> Result<(), CliError> {
    match args.action {
        ConfigAction::Validate => execute_validate(config_path, writer).await,
        ConfigAction::Show { section } => execute_show(config_path, section, writer).await,
    }
}

/// Loads and validates the configuration, reporting any error.
///
/// # Errors
///
/// Returns `CliError::Config` if validation fails.
async fn execute_validate(config_path: Option<&Path>, writer: &OutputWriter) -> Result<(), CliError> {
    let source = source_name(config_path);
    info!(source = %source, "validating configuration");

    let report = match load_config(config_path, None, None).await {
        Ok(_) => ConfigValidationReport {
            source,
            valid: true,
            errors: Vec::new(),
        },
        Err(e) => ConfigValidationReport {
            source,
            valid: false,
            errors: vec![e.to_string()],
        },
    };

    writer.render(&report)?;

    if !report.valid {
        return Err(CliError::Config("configuration is invalid".to_owned()));
    }
    Ok(())
}

/// Displays the effective configuration (file + env overrides + defaults).
///
/// Probe passwords are redacted.
async fn execute_show(
    config_path: Option<&Path>,
    section: Option<String>,
    writer: &OutputWriter,
) -> Result<(), CliError> {
    let mut config = load_config(config_path, None, None).await?;
    redact_credentials(&mut config);

    let report = build_report(&config, source_name(config_path), section)?;
    writer.render(&report)
}

pub fn build_report(
    config: &SlimprobeConfig,
    source: String,
    section: Option<String>,
) -> Result<ConfigReport, CliError> {
    let config_toml = match section.as_deref() {
        None => to_toml(config),
        Some("general") => to_toml(&config.general),
        Some("container") => to_toml(&config.container),
        Some("sensor") => to_toml(&config.sensor),
        Some("http_probe") => to_toml(&config.http_probe),
        Some("continue_after") => to_toml(&config.continue_after),
        Some(other) => {
            return Err(CliError::Command(format!(
                "unknown section: {other} (expected: {})",
                SECTIONS.join(", ")
            )));
        }
    };
    Ok(ConfigReport {
        source,
        section,
        config_toml,
    })
}

fn to_toml<T: Serialize>(value: &T) -> String {
    toml::to_string_pretty(value).unwrap_or_else(|e| format!("(serialization error: {e})"))
}

/// Replaces every probe command password.
pub fn redact_credentials(config: &mut SlimprobeConfig) {
    for cmd in &mut config.http_probe.commands {
        if cmd.password.is_some() {
            cmd.password = Some("***REDACTED***".to_owned());
        }
    }
}

/// Configuration display report.
///
/// `config_toml` is only used for text rendering.
#[derive(Serialize)]
pub struct ConfigReport {
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    #[serde(skip)]
    pub config_toml: String,
}

impl Render for ConfigReport {
    fn render_text(&self, w: &mut dyn Write) -> std::io::Result<()> {
        use colored::Colorize;

        if let Some(ref section) = self.section {
            let section_label = format!("[{section}]");
            writeln!(
                w,
                "Configuration {} (source: {})",
                section_label.bold(),
                self.source
            )?;
        } else {
            writeln!(w, "Configuration (source: {})", self.source.bold())?;
        }

        writeln!(w)?;
        write!(w, "{}", self.config_toml)
    }
}

/// Configuration validation report.
#[derive(Serialize)]
pub struct ConfigValidationReport {
    pub source: String,
    pub valid: bool,
    /// Empty when valid
    pub errors: Vec<String>,
}

impl Render for ConfigValidationReport {
    fn render_text(&self, w: &mut dyn Write) -> std::io::Result<()> {
        use colored::Colorize;

        writeln!(w, "Config Validation: {}", self.source.bold())?;
        if self.valid {
            writeln!(w, "  Result: {}", "VALID".green().bold())?;
        } else {
            writeln!(w, "  Result: {}", "INVALID".red().bold())?;
            for err in &self.errors {
                writeln!(w, "  Error: {}", err.red())?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slimprobe_core::types::ProbeCommand;

    fn render(report: &impl Render) -> String {
        let mut buffer = Vec::new();
        report
            .render_text(&mut buffer)
            .expect("text rendering should succeed");
        String::from_utf8(buffer).expect("valid UTF-8")
    }

    #[test]
    fn test_config_report_full_config() {
        let report = build_report(&SlimprobeConfig::default(), "test.toml".to_owned(), None)
            .expect("report builds");
        let output = render(&report);
        assert!(output.contains("test.toml"));
        assert!(output.contains("[continue_after]"));
        assert!(output.contains("[http_probe]"));
    }

    #[test]
    fn test_config_report_specific_section() {
        let report = build_report(
            &SlimprobeConfig::default(),
            "test.toml".to_owned(),
            Some("sensor".to_owned()),
        )
        .expect("report builds");
        let output = render(&report);
        assert!(output.contains("[sensor]"));
        assert!(output.contains("cmd_port = 65501"));
        assert!(!output.contains("[container]"));
    }

    #[test]
    fn test_unknown_section_is_rejected() {
        let err = build_report(
            &SlimprobeConfig::default(),
            "test.toml".to_owned(),
            Some("dashboard".to_owned()),
        )
        .err()
        .expect("unknown section");
        assert!(err.to_string().contains("continue_after"));
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_config_report_json_skips_toml() {
        let report = ConfigReport {
            source: "test.toml".to_owned(),
            section: Some("general".to_owned()),
            config_toml: "log_level = \"info\"".to_owned(),
        };
        let parsed = serde_json::to_value(&report).expect("JSON serialization should succeed");
        assert_eq!(parsed["section"].as_str(), Some("general"));
        assert!(parsed.get("config_toml").is_none());
    }

    #[test]
    fn test_redact_probe_passwords() {
        let mut config = SlimprobeConfig::default();
        config.http_probe.commands = vec![
            ProbeCommand {
                username: Some("admin".to_owned()),
                password: Some("hunter2".to_owned()),
                ..ProbeCommand::default()
            },
            ProbeCommand::default(),
        ];
        redact_credentials(&mut config);
        assert_eq!(
            config.http_probe.commands[0].password.as_deref(),
            Some("***REDACTED***")
        );
        assert_eq!(config.http_probe.commands[0].username.as_deref(), Some("admin"));
        assert!(config.http_probe.commands[1].password.is_none());

        let report = build_report(&config, "x".to_owned(), Some("http_probe".to_owned()))
            .expect("report builds");
        assert!(!report.config_toml.contains("hunter2"));
    }

    #[test]
    fn test_validation_report_render() {
        let valid = ConfigValidationReport {
            source: "slimprobe.toml".to_owned(),
            valid: true,
            errors: Vec::new(),
        };
        let output = render(&valid);
        assert!(output.contains("VALID"));
        assert!(!output.contains("Error:"));

        let invalid = ConfigValidationReport {
            source: "bad.toml".to_owned(),
            valid: false,
            errors: vec!["continue_after.mode: unknown mode".to_owned()],
        };
        let output = render(&invalid);
        assert!(output.contains("INVALID"));
        assert!(output.contains("unknown mode"));
    }
}
