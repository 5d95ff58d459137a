//! Artifact directory checks and post-processing.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::InspectorError;

/// Report the sensor writes when monitoring finishes.
pub const REPORT_FILE_NAME: &str = "creport.json";

/// Post-processor over collected artifacts (AppArmor, seccomp, ...).
pub trait ProfileGenerator: Send + Sync {
    fn name(&self) -> &str;

    /// Generates profiles under `artifacts_dir`, returning their file names.
    fn generate(&self, artifacts_dir: &Path) -> Result<Vec<String>, InspectorError>;
}

pub async fn has_collected_data(artifacts_dir: &Path) -> bool {
    tokio::fs::metadata(artifacts_dir.join(REPORT_FILE_NAME))
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

/// Runs every generator, returning the generated file names.
///
/// A failing generator is logged and skipped.
pub fn process_collected_data(
    artifacts_dir: &Path,
    generators: &[Box<dyn ProfileGenerator>],
) -> Vec<String> {
    let mut generated = Vec::new();
    for generator in generators {
        match generator.generate(artifacts_dir) {
            Ok(files) => {
                debug!(generator = generator.name(), files = ?files, "profiles generated");
                generated.extend(files);
            }
            Err(e) => warn!(generator = generator.name(), error = %e, "profile generation failed"),
        }
    }
    generated
}

/// Copies the report and generated profiles to `dest`.
///
/// Missing source files are logged, not fatal. Returns the copied paths.
pub async fn copy_meta_artifacts(
    artifacts_dir: &Path,
    extra_files: &[String],
    dest: &Path,
) -> Result<Vec<PathBuf>, InspectorError> {
    tokio::fs::create_dir_all(dest).await.map_err(|e| {
        InspectorError::Artifacts(format!("cannot create {}: {e}", dest.display()))
    })?;

    let mut copied = Vec::new();
    let names = std::iter::once(REPORT_FILE_NAME).chain(extra_files.iter().map(String::as_str));
    for name in names {
        let src = artifacts_dir.join(name);
        let dst = dest.join(name);
        match tokio::fs::copy(&src, &dst).await {
            Ok(_) => copied.push(dst),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(file = %src.display(), "meta artifact missing, not copied");
            }
            Err(e) => {
                return Err(InspectorError::Artifacts(format!(
                    "copy {} -> {}: {e}",
                    src.display(),
                    dst.display()
                )));
            }
        }
    }
    info!(dest = %dest.display(), count = copied.len(), "meta artifacts copied");
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeSeccomp;

    impl ProfileGenerator for FakeSeccomp {
        fn name(&self) -> &str {
            "seccomp"
        }

        fn generate(&self, artifacts_dir: &Path) -> Result<Vec<String>, InspectorError> {
            std::fs::write(artifacts_dir.join("app-seccomp.json"), "{}")?;
            Ok(vec!["app-seccomp.json".to_owned()])
        }
    }

    struct Broken;

    impl ProfileGenerator for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn generate(&self, _: &Path) -> Result<Vec<String>, InspectorError> {
            Err(InspectorError::Artifacts("no report".to_owned()))
        }
    }

    #[tokio::test]
    async fn collected_data_needs_report_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!has_collected_data(dir.path()).await);
        std::fs::write(dir.path().join(REPORT_FILE_NAME), "{}").unwrap();
        assert!(has_collected_data(dir.path()).await);
    }

    #[test]
    fn failing_generator_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let generators: Vec<Box<dyn ProfileGenerator>> = vec![Box::new(Broken), Box::new(FakeSeccomp)];
        let files = process_collected_data(dir.path(), &generators);
        assert_eq!(files, vec!["app-seccomp.json"]);
    }

    #[tokio::test]
    async fn copy_skips_missing_files() {
        let src = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join(REPORT_FILE_NAME), "{\"ok\":true}").unwrap();

        let out = dest.path().join("meta");
        let copied = copy_meta_artifacts(src.path(), &["gone.json".to_owned()], &out)
            .await
            .unwrap();
        assert_eq!(copied, vec![out.join(REPORT_FILE_NAME)]);
        assert_eq!(
            std::fs::read_to_string(out.join(REPORT_FILE_NAME)).unwrap(),
            "{\"ok\":true}"
        );
    }
}
