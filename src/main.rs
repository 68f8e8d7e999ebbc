use std::{fs::OpenOptions, path::PathBuf, sync::Arc};

use clap::Parser;
use eyre::{eyre, Result};
use fs2::FileExt;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use cipherbox_republisher::{
    admin::{self, AdminState},
    config::Config,
    metrics,
    publisher::RoutingPublisher,
    scheduler,
    signer::SignerClient,
    store::ScheduleStore,
};

#[derive(Parser, Debug)]
#[command(
    name = "cipherbox-republisher",
    version,
    about = "CipherBox IPNS republishing coordinator"
)]
struct Args {
    /// Base URL of the sealed signer.
    #[arg(long, env = "SIGNER_URL", default_value = "http://localhost:3001")]
    signer_url: String,

    /// Optional bearer secret for the sealed signer.
    #[arg(long, env = "SIGNER_SECRET", hide_env_values = true)]
    signer_secret: Option<String>,

    /// Base URL of the delegated-routing endpoint.
    #[arg(long, env = "ROUTING_URL", default_value = "https://delegated-ipfs.dev")]
    routing_url: String,

    /// How far out a successful publish schedules the next one.
    #[arg(long, env = "PUBLISH_INTERVAL_SECONDS", default_value_t = 21_600)]
    publish_interval_seconds: u64,

    /// Entries per sign-batch request.
    #[arg(long, env = "BATCH_SIZE", default_value_t = 50)]
    batch_size: usize,

    /// Consecutive failures before an enrollment is parked as stale.
    #[arg(long, env = "MAX_FAILURES", default_value_t = 10)]
    max_failures: u32,

    /// Base retry backoff after a failed republish.
    #[arg(long, env = "BASE_BACKOFF_SECONDS", default_value_t = 30)]
    base_backoff_seconds: u64,

    /// Retry backoff cap.
    #[arg(long, env = "MAX_BACKOFF_SECONDS", default_value_t = 3_600)]
    max_backoff_seconds: u64,

    /// Hard timeout for each signer request.
    #[arg(long, env = "SIGNER_TIMEOUT_SECONDS", default_value_t = 30)]
    signer_timeout_seconds: u64,

    /// PUT attempts per record before surfacing a publish failure.
    #[arg(long, env = "PUBLISH_MAX_ATTEMPTS", default_value_t = 3)]
    publish_max_attempts: usize,

    /// How long a deposed signer epoch keeps being honored for re-sealing.
    #[arg(long, env = "GRACE_PERIOD_SECONDS", default_value_t = 2_419_200)]
    grace_period_seconds: u64,

    /// Where to store the schedule document.
    #[arg(long, env = "STATE_FILE", default_value = "state/republisher.json")]
    state_file: PathBuf,

    /// Listen address for the admin/metrics HTTP surface.
    #[arg(long, env = "ADMIN_LISTEN", default_value = "127.0.0.1:3002")]
    admin_listen: std::net::SocketAddr,

    /// Scheduler cadence.
    #[arg(long, env = "TICK_SECONDS", default_value_t = 60)]
    tick_seconds: u64,

    /// Run a single scheduler tick and exit.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let cfg = Config::from_cli(
        args.signer_url,
        args.signer_secret,
        args.routing_url,
        args.publish_interval_seconds,
        args.batch_size,
        args.max_failures,
        args.base_backoff_seconds,
        args.max_backoff_seconds,
        args.signer_timeout_seconds,
        args.publish_max_attempts,
        args.grace_period_seconds,
        args.state_file,
        args.admin_listen,
        args.tick_seconds,
        args.once,
    )?;

    // Ensure the state directory exists before we create/lock the lockfile.
    if let Some(parent) = cfg.state_file.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| eyre!("failed to create state directory {}: {e}", parent.display()))?;
        }
    }

    // Single-instance guard: the scheduler job must never run twice against
    // the same schedule, so the whole coordinator takes an exclusive lock
    // next to its state file.
    let lock_path = cfg.state_file.with_extension("lock");
    let lock_file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|e| eyre!("failed to open lock file {}: {e}", lock_path.display()))?;
    lock_file.try_lock_exclusive().map_err(|e| {
        eyre!(
            "coordinator already running or lock unavailable ({}): {e}",
            lock_path.display()
        )
    })?;
    // Keep file handle alive.
    let _lock_guard = lock_file;

    let store = ScheduleStore::load_or_init(&cfg.state_file, cfg.policy())
        .map_err(|e| eyre!("failed to open schedule store: {e}"))?
        .into_shared();

    let prometheus = metrics::install_recorder()?;
    let signer = SignerClient::new(&cfg.signer_url, cfg.signer_secret.clone(), cfg.signer_timeout)
        .map_err(|e| eyre!("failed to build signer client: {e}"))?;
    let publisher = RoutingPublisher::new(
        &cfg.routing_url,
        cfg.publish_max_attempts,
        cfg.signer_timeout,
    )
    .map_err(|e| eyre!("failed to build routing publisher: {e}"))?;

    let cancel = CancellationToken::new();
    let force_run = Arc::new(Notify::new());

    tracing::info!(
        signer_url = %cfg.signer_url,
        routing_url = %cfg.routing_url,
        state_file = %cfg.state_file.display(),
        admin_listen = %cfg.admin_listen,
        tick_s = cfg.tick_interval.as_secs(),
        once = cfg.once,
        "coordinator starting"
    );

    let listener = tokio::net::TcpListener::bind(cfg.admin_listen)
        .await
        .map_err(|e| eyre!("failed to bind admin listener on {}: {e}", cfg.admin_listen))?;
    let admin_app = admin::router(AdminState {
        store: store.clone(),
        signer: signer.clone(),
        force_run: force_run.clone(),
        prometheus: Some(prometheus),
    });
    let admin_task = tokio::spawn(admin::serve(listener, admin_app, cancel.clone()));

    // Ctrl-C flips the token; the scheduler stops between chunks and the
    // admin server drains.
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            cancel.cancel();
        });
    }

    loop {
        if let Err(err) = scheduler::sync_epoch(&store, &signer).await {
            tracing::warn!(error = %err, "epoch sync failed; continuing with stored state");
        }

        match scheduler::run_once(
            &store,
            &signer,
            &publisher,
            cfg.batch_size,
            None,
            &cancel,
        )
        .await
        {
            Ok(outcome) => {
                tracing::debug!(?outcome, "tick finished");
            }
            Err(err) => {
                // Run failures never take the process down.
                metrics::record_run_error();
                tracing::error!(error = %err, "scheduler run failed");
            }
        }

        if cfg.once || cancel.is_cancelled() {
            break;
        }

        tokio::select! {
            _ = tokio::time::sleep(cfg.tick_interval) => {}
            _ = force_run.notified() => {
                tracing::info!("running ahead of schedule on force-run");
            }
            _ = cancel.cancelled() => break,
        }
    }

    cancel.cancel();
    let _ = admin_task.await;
    tracing::info!("coordinator stopped");
    Ok(())
}
