use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, Notify};
use uuid::Uuid;

use crate::core::downloader::ArtifactDownloader;
use crate::core::events::UpdateEvent;
use crate::core::installer::PlatformInstaller;
use crate::core::model::{AttemptId, DownloadContext, UpdateMetadata, UpdatePhase};

/// Exact detail string for the missing-URL configuration failure.
pub const URL_NOT_AVAILABLE: &str = "Download URL not available";

/// What the harness should do once `install_and_exit` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitAction {
    /// Install succeeded; the process must terminate now.
    Terminate,
    /// Install failed or was deferred; the application keeps running.
    KeepRunning,
}

/// Presentation boundary for the one decision the orchestrator cannot make
/// itself: whether to install the downloaded update and exit.
#[async_trait::async_trait]
pub trait InstallPrompt: Send + Sync {
    async fn confirm_install(&self, version: &str) -> bool;
}

/// Sequences download → confirm → install for one update. All observable
/// transitions are delivered as ordered events on a broadcast channel; the
/// blocking work runs on a background task, never on the subscriber side.
#[derive(Clone)]
pub struct UpdateOrchestrator {
    metadata: UpdateMetadata,
    ctx: DownloadContext,
    data_dir: PathBuf,
    downloader: Arc<ArtifactDownloader>,
    installer: Arc<PlatformInstaller>,
    prompt: Arc<dyn InstallPrompt>,
    event_tx: broadcast::Sender<UpdateEvent>,
    phase: Arc<Mutex<UpdatePhase>>,
    download_done: Arc<Notify>,
}

impl UpdateOrchestrator {
    pub fn new(
        metadata: UpdateMetadata,
        ctx: DownloadContext,
        data_dir: PathBuf,
        installer: PlatformInstaller,
        prompt: Arc<dyn InstallPrompt>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            metadata,
            ctx,
            data_dir,
            downloader: Arc::new(ArtifactDownloader::new()),
            installer: Arc::new(installer),
            prompt,
            event_tx,
            phase: Arc::new(Mutex::new(UpdatePhase::Idle)),
            download_done: Arc::new(Notify::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UpdateEvent> {
        self.event_tx.subscribe()
    }

    pub fn metadata(&self) -> &UpdateMetadata {
        &self.metadata
    }

    pub async fn phase(&self) -> UpdatePhase {
        *self.phase.lock().await
    }

    /// Where the artifact lands in the data directory.
    pub fn artifact_path(&self) -> PathBuf {
        self.data_dir.join(self.metadata.artifact_filename())
    }

    fn send(&self, evt: UpdateEvent) {
        let _ = self.event_tx.send(evt);
    }

    async fn set_phase(&self, phase: UpdatePhase) {
        *self.phase.lock().await = phase;
        self.send(UpdateEvent::PhaseChanged { phase });
    }

    /// Start the background download. A second request while one is in flight
    /// is rejected and leaves the in-flight attempt untouched.
    pub async fn start_download(&self) -> Result<()> {
        {
            let mut phase = self.phase.lock().await;
            match *phase {
                UpdatePhase::Downloading => {
                    anyhow::bail!("a download is already in progress")
                }
                UpdatePhase::Installing | UpdatePhase::Terminating => {
                    anyhow::bail!("an install is in progress")
                }
                _ => {}
            }
            *phase = UpdatePhase::Downloading;
        }
        self.send(UpdateEvent::PhaseChanged {
            phase: UpdatePhase::Downloading,
        });

        // Configuration failures surface before any network or disk I/O.
        let url = match self
            .metadata
            .download_url
            .as_deref()
            .filter(|u| !u.is_empty())
        {
            Some(u) => u.to_string(),
            None => {
                self.fail_download(URL_NOT_AVAILABLE.to_string()).await;
                return Ok(());
            }
        };
        if let Err(e) = url::Url::parse(&url) {
            self.fail_download(format!("invalid download URL: {e}")).await;
            return Ok(());
        }

        let this = self.clone();
        let attempt_id = Uuid::new_v4();
        tokio::spawn(async move {
            this.run_download(attempt_id, url).await;
        });
        Ok(())
    }

    async fn run_download(&self, attempt_id: AttemptId, url: String) {
        self.send(UpdateEvent::Status {
            message: format!("downloading update {}", self.metadata.version),
        });

        let dest = self.artifact_path();
        let tx = self.event_tx.clone();
        let result = self
            .downloader
            .download(&url, &dest, &self.ctx, |p| {
                let _ = tx.send(UpdateEvent::Progress {
                    attempt_id,
                    downloaded: p.downloaded,
                    total: p.total,
                    percent: p.percent,
                });
            })
            .await;

        match result {
            Ok(bytes) => {
                self.set_phase(UpdatePhase::DownloadComplete).await;
                self.send(UpdateEvent::Status {
                    message: format!("download complete ({bytes} bytes)"),
                });
                self.download_done.notify_waiters();
            }
            Err(e) => self.fail_download(format!("{:#}", e)).await,
        }
    }

    async fn fail_download(&self, detail: String) {
        self.set_phase(UpdatePhase::DownloadFailed).await;
        self.send(UpdateEvent::Outcome {
            succeeded: false,
            detail,
        });
        self.download_done.notify_waiters();
    }

    /// Wait for the in-flight download to reach a terminal phase. Returns
    /// immediately if no download is running.
    pub async fn wait_download(&self) {
        let notified = self.download_done.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if *self.phase.lock().await != UpdatePhase::Downloading {
            return;
        }
        notified.await;
    }

    /// Confirm with the user, install, and report whether the process should
    /// terminate. Declining keeps the artifact on disk (`Deferred`) so a later
    /// call can install without re-downloading.
    pub async fn install_and_exit(&self) -> Result<ExitAction> {
        {
            let phase = self.phase.lock().await;
            match *phase {
                UpdatePhase::DownloadComplete
                | UpdatePhase::Deferred
                | UpdatePhase::InstallFailed => {}
                p => anyhow::bail!("no downloaded update ready to install (phase {:?})", p),
            }
        }

        if !self.prompt.confirm_install(&self.metadata.version).await {
            self.set_phase(UpdatePhase::Deferred).await;
            self.send(UpdateEvent::Status {
                message: format!(
                    "install deferred; downloaded update kept at {}",
                    self.artifact_path().display()
                ),
            });
            return Ok(ExitAction::KeepRunning);
        }

        self.set_phase(UpdatePhase::Installing).await;
        self.send(UpdateEvent::Status {
            message: format!("installing update {}", self.metadata.version),
        });

        let outcome = self
            .installer
            .install(&self.artifact_path(), &self.metadata.version)
            .await;
        let detail = outcome.detail.unwrap_or_default();

        if outcome.succeeded {
            self.set_phase(UpdatePhase::Terminating).await;
            self.send(UpdateEvent::Outcome {
                succeeded: true,
                detail,
            });
            Ok(ExitAction::Terminate)
        } else {
            self.set_phase(UpdatePhase::InstallFailed).await;
            self.send(UpdateEvent::Outcome {
                succeeded: false,
                detail,
            });
            Ok(ExitAction::KeepRunning)
        }
    }
}
