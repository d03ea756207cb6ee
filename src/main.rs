//! swarmcore - Main entry point
//!
//! Runs a session over a state directory until interrupted, or edits the
//! stored downloads offline.

use std::collections::HashSet;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Result;
use swarmcore::cli::{exit_code, list_downloads, stop_download, CliArgs, DownloadStats, ProgressDisplay};
use swarmcore::{DownloadConfig, DownloadMode, DownloadStatus, ErrorKind, Session, SessionConfig, VodConfig};
use tracing::{debug, error, info, warn};

/// Set up panic handler for unexpected errors
fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();
        match panic_info.location() {
            Some(location) => error!(
                "PANIC occurred at {}:{}:{}",
                location.file(),
                location.line(),
                location.column()
            ),
            None => error!("PANIC occurred at an unknown location"),
        }
        let payload = panic_info.payload();
        if let Some(s) = payload.downcast_ref::<&str>() {
            error!("Panic message: {}", s);
        } else if let Some(s) = payload.downcast_ref::<String>() {
            error!("Panic message: {}", s);
        } else {
            error!("Panic message: unknown");
        }
        error!("Backtrace:\n{:?}", backtrace);
    }));
}

#[tokio::main]
async fn main() -> ExitCode {
    setup_panic_handler();

    let args = CliArgs::parse_args();
    init_logging(&args);
    debug!("CLI arguments: {:?}", args);

    match run(&args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            let progress = ProgressDisplay::new(args.quiet);
            let _ = progress.print_error(&format!("{:#}", e));
            ExitCode::from(exit_code(&e))
        }
    }
}

/// Initialize logging based on verbosity settings
fn init_logging(args: &CliArgs) {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(args.log_level())
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if args.verbose {
        subscriber.pretty().init();
    } else {
        subscriber.compact().init();
    }
}

async fn run(args: &CliArgs) -> Result<()> {
    let state_dir = args.state_dir();
    let mut progress = ProgressDisplay::new(args.quiet);

    if args.is_offline() {
        for id in &args.stop {
            let state = stop_download(&state_dir, id)?;
            progress.print_status(&format!("Stopped {} ({})", state.info_hash, state.name))?;
        }
        if args.list {
            progress.print_list(&list_downloads(&state_dir)?)?;
        }
        return Ok(());
    }

    let mut config = SessionConfig::load(&state_dir)?.unwrap_or_else(|| SessionConfig::new(state_dir.clone()));
    if let Some(port) = args.listen_port {
        config.listen_port = port;
    }
    if args.dht {
        config.dht_enabled = true;
    }

    let session = Session::start(config).await?;
    progress.print_status(&format!(
        "Session on port {} with state in {}",
        session.listen_port(),
        state_dir.display()
    ))?;

    let gracetime = Duration::from_secs(args.gracetime);
    if let Err(e) = add_sources(&session, args).await {
        session.shutdown(gracetime).await;
        return Err(e);
    }

    let result = watch(&session, args, &mut progress).await;
    session.shutdown(gracetime).await;
    result
}

async fn add_sources(session: &Session, args: &CliArgs) -> Result<()> {
    for source in &args.add {
        let mut config = DownloadConfig::new(args.dest_dir());
        if let Some(file_index) = args.vod {
            config.mode = DownloadMode::Vod(VodConfig {
                file_index,
                ..VodConfig::default()
            });
        }
        match session.add_source(source, config).await {
            Ok(handle) => info!("Added {} as {}", source, handle.info_hash_hex()),
            Err(e) if ErrorKind::of(&e) == ErrorKind::DuplicateDownload => {
                warn!("{} is already in the session", source)
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Print progress until Ctrl-C, or until every download finished under `--shutdown`
async fn watch(session: &Session, args: &CliArgs, progress: &mut ProgressDisplay) -> Result<()> {
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut completed = HashSet::new();

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupted");
                return Ok(());
            }
            _ = tick.tick() => {}
        }

        let stats: Vec<DownloadStats> = session
            .downloads()
            .iter()
            .map(|h| DownloadStats::from_snapshot(&h.state(), h.info().total_size()))
            .collect();
        progress.update(&stats)?;
        for s in &stats {
            if s.status == DownloadStatus::Seeding && completed.insert(s.info_hash.clone()) {
                progress.print_complete(s)?;
            }
        }

        let finished = stats.iter().all(|s| {
            matches!(
                s.status,
                DownloadStatus::Seeding | DownloadStatus::Stopped | DownloadStatus::StoppedOnError
            )
        });
        if args.shutdown && finished {
            info!("All downloads finished");
            return Ok(());
        }
    }
}
