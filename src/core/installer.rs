use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::core::fsops;
use crate::core::model::{ArtifactKind, HostOs, InstallOutcome};

pub const DEFAULT_APPLICATIONS_DIR: &str = "/Applications";

/// Closed set of install strategies; selection is a pure function of host OS
/// and artifact kind so the decision table is testable on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallStrategy {
    /// Hand the disk image to the OS `open` handler; the user finishes the
    /// install from the mounted image.
    OpenDiskImage,
    /// Replace the installed bundle with the artifact via a staged swap.
    ReplaceBundle,
    /// No automated install on this host; the artifact stays where it was
    /// downloaded.
    ManualFallback,
}

pub fn select_strategy(os: HostOs, kind: ArtifactKind) -> InstallStrategy {
    match (os, kind) {
        (HostOs::MacOs, ArtifactKind::DiskImage) => InstallStrategy::OpenDiskImage,
        (HostOs::MacOs, ArtifactKind::AppBundle) => InstallStrategy::ReplaceBundle,
        _ => InstallStrategy::ManualFallback,
    }
}

#[derive(Debug, Clone)]
pub struct PlatformInstaller {
    host_os: HostOs,
    applications_dir: PathBuf,
    bundle_name: String,
}

impl PlatformInstaller {
    pub fn new(host_os: HostOs, applications_dir: PathBuf, bundle_name: String) -> Self {
        Self {
            host_os,
            applications_dir,
            bundle_name,
        }
    }

    pub fn target_bundle_path(&self) -> PathBuf {
        self.applications_dir.join(&self.bundle_name)
    }

    /// Install runs after the user has already agreed to exit, so nothing may
    /// propagate: every failure is folded into the outcome.
    pub async fn install(&self, artifact: &Path, target_version: &str) -> InstallOutcome {
        match self.try_install(artifact, target_version).await {
            Ok(detail) => InstallOutcome {
                succeeded: true,
                detail: Some(detail),
            },
            Err(e) => InstallOutcome {
                succeeded: false,
                detail: Some(format!("{:#}", e)),
            },
        }
    }

    async fn try_install(&self, artifact: &Path, target_version: &str) -> Result<String> {
        let kind = ArtifactKind::from_path(artifact);
        match select_strategy(self.host_os, kind) {
            InstallStrategy::OpenDiskImage => {
                self.open_disk_image(artifact).await?;
                Ok(format!(
                    "disk image for {target_version} opened; finish the install from the mounted image"
                ))
            }
            InstallStrategy::ReplaceBundle => {
                let target = self.target_bundle_path();
                let source = artifact.to_path_buf();
                let swap_target = target.clone();
                tokio::task::spawn_blocking(move || fsops::replace_tree(&source, &swap_target))
                    .await
                    .context("install task panicked")??;
                Ok(format!("{target_version} installed to {}", target.display()))
            }
            InstallStrategy::ManualFallback => Ok(format!(
                "no automated install on this platform; update saved at {}",
                artifact.display()
            )),
        }
    }

    async fn open_disk_image(&self, artifact: &Path) -> Result<()> {
        // Detached: the child outlives us; the user drives the mounted image.
        let child = tokio::process::Command::new("open")
            .arg(artifact)
            .spawn()
            .with_context(|| format!("launch open handler for {}", artifact.display()))?;
        drop(child);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::APP_BUNDLE_NAME;
    use std::fs;

    fn write(path: &Path, content: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    #[test]
    fn strategy_table() {
        use ArtifactKind::*;
        use HostOs::*;

        assert_eq!(select_strategy(MacOs, DiskImage), InstallStrategy::OpenDiskImage);
        assert_eq!(select_strategy(MacOs, AppBundle), InstallStrategy::ReplaceBundle);
        assert_eq!(select_strategy(MacOs, Package), InstallStrategy::ManualFallback);
        assert_eq!(select_strategy(Linux, DiskImage), InstallStrategy::ManualFallback);
        assert_eq!(select_strategy(Linux, AppBundle), InstallStrategy::ManualFallback);
        assert_eq!(select_strategy(Windows, Package), InstallStrategy::ManualFallback);
        assert_eq!(select_strategy(Other, AppBundle), InstallStrategy::ManualFallback);
    }

    #[tokio::test]
    async fn manual_fallback_succeeds_without_touching_the_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("Orange-2.0.bin");
        write(&artifact, "payload");

        let apps = dir.path().join("Applications");
        fs::create_dir_all(&apps).unwrap();
        let installer =
            PlatformInstaller::new(HostOs::Linux, apps.clone(), APP_BUNDLE_NAME.to_string());

        let outcome = installer.install(&artifact, "2.0").await;

        assert!(outcome.succeeded);
        let detail = outcome.detail.unwrap();
        assert!(detail.contains("Orange-2.0.bin"));
        // Nothing was installed; the applications dir is untouched.
        assert_eq!(fs::read_dir(&apps).unwrap().count(), 0);
        assert_eq!(fs::read_to_string(&artifact).unwrap(), "payload");
    }

    #[tokio::test]
    async fn bundle_replace_overwrites_existing_install() {
        let dir = tempfile::tempdir().unwrap();

        let artifact = dir.path().join("staging/Orange-2.0.app");
        write(&artifact.join("Contents/Info.plist"), "plist-v2");
        write(&artifact.join("Contents/MacOS/orange"), "binary-v2");

        let apps = dir.path().join("Applications");
        let target = apps.join(APP_BUNDLE_NAME);
        write(&target.join("Contents/Info.plist"), "plist-v1");
        write(&target.join("Contents/Resources/stale.txt"), "stale");

        let installer =
            PlatformInstaller::new(HostOs::MacOs, apps.clone(), APP_BUNDLE_NAME.to_string());
        let outcome = installer.install(&artifact, "2.0").await;

        assert!(outcome.succeeded, "detail: {:?}", outcome.detail);
        assert_eq!(
            fs::read_to_string(target.join("Contents/Info.plist")).unwrap(),
            "plist-v2"
        );
        assert_eq!(
            fs::read_to_string(target.join("Contents/MacOS/orange")).unwrap(),
            "binary-v2"
        );
        assert!(!target.join("Contents/Resources/stale.txt").exists());
    }

    #[tokio::test]
    async fn bundle_replace_installs_when_no_previous_bundle() {
        let dir = tempfile::tempdir().unwrap();

        let artifact = dir.path().join("staging/Orange-2.0.app");
        write(&artifact.join("Contents/Info.plist"), "plist-v2");

        let apps = dir.path().join("Applications");
        fs::create_dir_all(&apps).unwrap();
        let installer =
            PlatformInstaller::new(HostOs::MacOs, apps.clone(), APP_BUNDLE_NAME.to_string());

        let outcome = installer.install(&artifact, "2.0").await;

        assert!(outcome.succeeded);
        assert_eq!(
            fs::read_to_string(apps.join(APP_BUNDLE_NAME).join("Contents/Info.plist")).unwrap(),
            "plist-v2"
        );
    }

    #[tokio::test]
    async fn install_error_becomes_failed_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let apps = dir.path().join("Applications");
        fs::create_dir_all(&apps).unwrap();

        let installer =
            PlatformInstaller::new(HostOs::MacOs, apps, APP_BUNDLE_NAME.to_string());
        let missing = dir.path().join("no-such/Orange-2.0.app");

        let outcome = installer.install(&missing, "2.0").await;

        assert!(!outcome.succeeded);
        assert!(outcome.detail.is_some());
    }
}
