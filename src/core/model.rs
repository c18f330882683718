use sanitize_filename::sanitize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use url::Url;
use uuid::Uuid;

pub type AttemptId = Uuid;

/// Fixed bundle name the installer writes into the applications directory.
pub const APP_BUNDLE_NAME: &str = "Orange.app";

/// Update availability metadata, produced by the version-discovery side and
/// consumed read-only here. Release notes and download URL are optional; their
/// absence degrades gracefully (no notes shown, download reported unavailable).
#[derive(Debug, Clone)]
pub struct UpdateMetadata {
    pub version: String,
    pub release_notes: Option<String>,
    pub download_url: Option<String>,
}

impl UpdateMetadata {
    /// Deterministic artifact filename: bundle stem + version + the source
    /// URL's extension (`dmg`/`app`/`zip`), falling back to `bin`.
    pub fn artifact_filename(&self) -> String {
        let ext = self
            .download_url
            .as_deref()
            .and_then(|raw| Url::parse(raw).ok())
            .and_then(|u| {
                u.path_segments()
                    .and_then(|s| s.last().map(|p| p.to_string()))
            })
            .and_then(|seg| {
                Path::new(&seg)
                    .extension()
                    .map(|e| e.to_string_lossy().to_ascii_lowercase())
            })
            .filter(|e| matches!(e.as_str(), "dmg" | "app" | "zip"))
            .unwrap_or_else(|| "bin".to_string());

        sanitize(format!("Orange-{}.{}", self.version, ext))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePhase {
    Idle,
    Downloading,
    DownloadFailed,
    DownloadComplete,
    Deferred,
    Installing,
    InstallFailed,
    Terminating,
}

/// In-flight download state. Owned exclusively by the downloader's execution
/// context for the duration of one attempt; dropped when the attempt ends.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub source_url: String,
    pub destination: PathBuf,
    pub bytes_expected: Option<u64>,
    pub bytes_transferred: u64,
}

/// Terminal result of an install attempt, consumed once by the orchestrator.
#[derive(Debug, Clone)]
pub struct InstallOutcome {
    pub succeeded: bool,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostOs {
    MacOs,
    Windows,
    Linux,
    Other,
}

impl HostOs {
    pub fn current() -> Self {
        match std::env::consts::OS {
            "macos" => Self::MacOs,
            "windows" => Self::Windows,
            "linux" => Self::Linux,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    DiskImage,
    AppBundle,
    Package,
}

impl ArtifactKind {
    pub fn from_path(path: &Path) -> Self {
        match path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .as_deref()
        {
            Some("dmg") => Self::DiskImage,
            Some("app") => Self::AppBundle,
            _ => Self::Package,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DownloadContext {
    pub user_agent: String,
    pub timeout_secs: u64,
    pub retries: u32,
    pub retry_backoff_ms: u64,
    pub headers: HashMap<String, String>,
}

impl Default for DownloadContext {
    fn default() -> Self {
        Self {
            user_agent: "OrangeUpdater/0.1".to_string(),
            timeout_secs: 300,
            retries: 2,
            retry_backoff_ms: 400,
            headers: HashMap::new(),
        }
    }
}
