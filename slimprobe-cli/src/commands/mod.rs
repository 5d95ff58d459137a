//! Command handlers -- one module per subcommand

pub mod config;
pub mod profile;

use std::path::Path;

use tracing::debug;

use slimprobe_core::config::SlimprobeConfig;

use crate::cli::ProfileArgs;
use crate::error::CliError;

/// Builds the effective configuration.
///
/// File (or defaults when no path is given), then environment overrides,
/// then `--log-level` and profile flags, then validation.
pub async fn load_config(
    path: Option<&Path>,
    log_level: Option<&str>,
    profile: Option<&ProfileArgs>,
) -> Result<SlimprobeConfig, CliError> {
    let mut config = match path {
        Some(path) => {
            debug!(path = %path.display(), "loading configuration");
            SlimprobeConfig::from_file(path).await?
        }
        None => SlimprobeConfig::default(),
    };
    config.apply_env_overrides();
    if let Some(level) = log_level {
        config.general.log_level = level.to_owned();
    }
    if let Some(args) = profile {
        args.apply(&mut config).map_err(CliError::Config)?;
    }
    config.validate()?;
    Ok(config)
}

/// Display name of the configuration source.
pub fn source_name(path: Option<&Path>) -> String {
    path.map(|p| p.display().to_string())
        .unwrap_or_else(|| "(defaults)".to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn defaults_without_a_path() {
        let config = load_config(None, Some("debug"), None).await.unwrap();
        assert_eq!(config.general.log_level, "debug");
        assert_eq!(config.continue_after.mode, "probe");
    }

    #[tokio::test]
    async fn invalid_log_level_fails_validation() {
        let err = load_config(None, Some("loud"), None).await.unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[tokio::test]
    async fn missing_file_is_a_config_error() {
        let err = load_config(Some(Path::new("/nonexistent/slimprobe.toml")), None, None)
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[tokio::test]
    async fn profile_flags_override_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slimprobe.toml");
        std::fs::write(
            &path,
            "[continue_after]\nmode = \"timeout\"\ntimeout_secs = 5\n",
        )
        .unwrap();

        let args = ProfileArgs {
            image: "app".to_owned(),
            continue_after: Some("enter".to_owned()),
            ..ProfileArgs::default()
        };
        let config = load_config(Some(&path), None, Some(&args)).await.unwrap();
        assert_eq!(config.continue_after.mode, "enter");
        assert_eq!(config.continue_after.timeout_secs, 5);
        assert_eq!(config.container.image, "app");
    }

    #[tokio::test]
    async fn bad_flag_value_maps_to_config_exit_code() {
        let args = ProfileArgs {
            image: "app".to_owned(),
            continue_after: Some("exec".to_owned()),
            ..ProfileArgs::default()
        };
        // exec mode without a command
        let err = load_config(None, None, Some(&args)).await.unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn source_name_falls_back_to_defaults() {
        assert_eq!(source_name(None), "(defaults)");
        assert_eq!(source_name(Some(Path::new("a.toml"))), "a.toml");
    }
}
