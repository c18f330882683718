mod core;
mod i18n;

use clap::{Arg, ArgAction, Command};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::core::events::UpdateEvent;
use crate::core::installer::{PlatformInstaller, DEFAULT_APPLICATIONS_DIR};
use crate::core::model::{
    AttemptId, DownloadContext, HostOs, UpdateMetadata, UpdatePhase, APP_BUNDLE_NAME,
};
use crate::core::orchestrator::{ExitAction, InstallPrompt, UpdateOrchestrator};
use crate::i18n::{get_messages, Locale, Messages};

fn build_cli() -> Command {
    let update = Command::new("update")
        .about("Download an available update and install it")
        .arg(
            Arg::new("version")
                .help("Version string of the available update")
                .required(true)
                .num_args(1),
        )
        .arg(
            Arg::new("url")
                .long("url")
                .help("Artifact download URL")
                .num_args(1),
        )
        .arg(
            Arg::new("notes")
                .long("notes")
                .help("Release notes text")
                .num_args(1),
        )
        .arg(
            Arg::new("notes_file")
                .long("notes-file")
                .help("Read release notes from a file")
                .num_args(1),
        )
        .arg(
            Arg::new("data_dir")
                .long("data-dir")
                .help("Directory the artifact is downloaded into")
                .default_value("./updates")
                .num_args(1),
        )
        .arg(
            Arg::new("applications_dir")
                .long("applications-dir")
                .help("Applications directory for bundle installs")
                .default_value(DEFAULT_APPLICATIONS_DIR)
                .num_args(1),
        )
        .arg(
            Arg::new("bundle_name")
                .long("bundle-name")
                .help("Installed bundle name")
                .default_value(APP_BUNDLE_NAME)
                .num_args(1),
        )
        .arg(
            Arg::new("locale")
                .long("locale")
                .help("UI locale (en/zh)")
                .default_value("en")
                .num_args(1),
        )
        .arg(
            Arg::new("yes")
                .long("yes")
                .short('y')
                .help("Install without asking")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("http_header")
                .long("header")
                .help_heading("HTTP")
                .help("Extra HTTP header (repeatable), e.g. --header 'Authorization: Bearer xxx'")
                .action(ArgAction::Append)
                .num_args(1),
        )
        .arg(
            Arg::new("http_user_agent")
                .long("user-agent")
                .help_heading("HTTP")
                .help("HTTP User-Agent")
                .default_value("OrangeUpdater/0.1")
                .num_args(1),
        )
        .arg(
            Arg::new("http_timeout_secs")
                .long("timeout-secs")
                .help_heading("HTTP")
                .help("HTTP timeout in seconds")
                .default_value("300")
                .num_args(1),
        )
        .arg(
            Arg::new("http_retries")
                .long("retries")
                .help_heading("HTTP")
                .help("HTTP retries for transient errors")
                .default_value("2")
                .num_args(1),
        )
        .arg(
            Arg::new("http_retry_backoff_ms")
                .long("retry-backoff-ms")
                .help_heading("HTTP")
                .help("Retry backoff base in milliseconds")
                .default_value("400")
                .num_args(1),
        );

    Command::new("updater")
        .about("Self-update for the Orange desktop app")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(update)
}

struct ConsolePrompt {
    assume_yes: bool,
    msgs: &'static Messages,
}

#[async_trait::async_trait]
impl InstallPrompt for ConsolePrompt {
    async fn confirm_install(&self, version: &str) -> bool {
        if self.assume_yes {
            return true;
        }
        let question = format!(
            "{} {} {} [y/N] ",
            self.msgs.confirm_install, version, self.msgs.confirm_suffix
        );
        tokio::task::spawn_blocking(move || {
            use std::io::Write;
            print!("{question}");
            let _ = std::io::stdout().flush();
            let mut line = String::new();
            if std::io::stdin().read_line(&mut line).is_err() {
                return false;
            }
            matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes")
        })
        .await
        .unwrap_or(false)
    }
}

fn drain_last_outcome(
    rx: &mut tokio::sync::broadcast::Receiver<UpdateEvent>,
) -> Option<(bool, String)> {
    let mut last = None;
    loop {
        match rx.try_recv() {
            Ok(UpdateEvent::Outcome { succeeded, detail }) => last = Some((succeeded, detail)),
            Ok(_) => {}
            Err(tokio::sync::broadcast::error::TryRecvError::Lagged(_)) => {}
            Err(_) => break,
        }
    }
    last
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = build_cli().get_matches();

    let m = match matches.subcommand() {
        Some(("update", m)) => m,
        _ => return Ok(()),
    };

    let locale = Locale::from_str(m.get_one::<String>("locale").unwrap());
    let msgs = get_messages(locale);

    let release_notes = match (
        m.get_one::<String>("notes"),
        m.get_one::<String>("notes_file"),
    ) {
        (Some(text), _) => Some(text.clone()),
        (None, Some(path)) => Some(tokio::fs::read_to_string(path).await?),
        (None, None) => None,
    };

    let metadata = UpdateMetadata {
        version: m.get_one::<String>("version").unwrap().clone(),
        release_notes,
        download_url: m.get_one::<String>("url").cloned(),
    };

    let mut ctx = DownloadContext {
        user_agent: m.get_one::<String>("http_user_agent").unwrap().clone(),
        timeout_secs: m.get_one::<String>("http_timeout_secs").unwrap().parse()?,
        retries: m.get_one::<String>("http_retries").unwrap().parse()?,
        retry_backoff_ms: m
            .get_one::<String>("http_retry_backoff_ms")
            .unwrap()
            .parse()?,
        ..DownloadContext::default()
    };
    if let Some(values) = m.get_many::<String>("http_header") {
        for h in values {
            let (k, v) = h
                .split_once(':')
                .ok_or_else(|| anyhow::anyhow!("invalid header format: {}", h))?;
            ctx.headers
                .insert(k.trim().to_string(), v.trim().to_string());
        }
    }

    let data_dir: PathBuf = m.get_one::<String>("data_dir").unwrap().into();
    let installer = PlatformInstaller::new(
        HostOs::current(),
        m.get_one::<String>("applications_dir").unwrap().into(),
        m.get_one::<String>("bundle_name").unwrap().clone(),
    );
    let prompt = Arc::new(ConsolePrompt {
        assume_yes: m.get_flag("yes"),
        msgs,
    });

    let orchestrator = UpdateOrchestrator::new(metadata, ctx, data_dir, installer, prompt);

    println!(
        "[{}] {}: {}",
        msgs.status_prefix,
        msgs.update_available,
        orchestrator.metadata().version
    );
    if let Some(notes) = &orchestrator.metadata().release_notes {
        println!("{}:", msgs.release_notes_header);
        println!("{notes}");
    }

    let mut rx = orchestrator.subscribe();
    let ui_msgs = msgs;
    let ui_task = tokio::spawn(async move {
        let sty_spin = ProgressStyle::with_template("{spinner:.green} {wide_msg}")
            .unwrap()
            .tick_chars("|/-\\ ");
        let sty_bar = ProgressStyle::with_template(
            "{bar:40.cyan/blue} {bytes}/{total_bytes} ({bytes_per_sec}, eta {eta}) {wide_msg}",
        )
        .unwrap();

        let pb = ProgressBar::new_spinner();
        pb.set_style(sty_spin.clone());
        pb.enable_steady_tick(Duration::from_millis(120));

        let mut failure: Option<(bool, String)> = None;
        let mut current_attempt: Option<AttemptId> = None;
        loop {
            let evt = match rx.recv().await {
                Ok(e) => e,
                Err(_) => break,
            };

            match evt {
                UpdateEvent::Progress {
                    attempt_id,
                    downloaded,
                    total,
                    ..
                } => {
                    // A retried download is a fresh attempt; reset the bar.
                    if current_attempt != Some(attempt_id) {
                        current_attempt = Some(attempt_id);
                        pb.set_position(0);
                    }
                    if let Some(t) = total {
                        if pb.length().unwrap_or(0) != t {
                            pb.set_style(sty_bar.clone());
                            pb.set_length(t);
                        }
                        pb.set_position(downloaded.min(t));
                    } else {
                        pb.set_message(format!(
                            "{downloaded} bytes (eta {})",
                            ui_msgs.eta_unknown
                        ));
                    }
                }
                UpdateEvent::Status { message } => {
                    pb.set_message(message);
                }
                UpdateEvent::Outcome { succeeded, detail } => {
                    failure = Some((succeeded, detail));
                    pb.finish_and_clear();
                    break;
                }
                UpdateEvent::PhaseChanged { phase } => {
                    if phase == UpdatePhase::DownloadComplete {
                        pb.finish_and_clear();
                        break;
                    }
                }
            }
        }
        failure
    });

    orchestrator.start_download().await?;
    orchestrator.wait_download().await;
    let download_outcome = ui_task.await.unwrap_or(None);

    if orchestrator.phase().await == UpdatePhase::DownloadFailed {
        let detail = download_outcome.map(|(_, d)| d).unwrap_or_default();
        eprintln!("[{}] {}: {}", msgs.error_prefix, msgs.download_failed, detail);
        std::process::exit(1);
    }

    let mut install_rx = orchestrator.subscribe();
    match orchestrator.install_and_exit().await? {
        ExitAction::Terminate => {
            println!("[{}] {}", msgs.status_prefix, msgs.exiting_after_install);
            std::process::exit(0);
        }
        ExitAction::KeepRunning => match orchestrator.phase().await {
            UpdatePhase::Deferred => {
                println!("[{}] {}", msgs.status_prefix, msgs.install_deferred);
                Ok(())
            }
            _ => {
                let detail = drain_last_outcome(&mut install_rx)
                    .map(|(_, d)| d)
                    .unwrap_or_default();
                eprintln!("[{}] {}: {}", msgs.error_prefix, msgs.install_failed, detail);
                std::process::exit(2);
            }
        },
    }
}
