use std::error::Error;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use cli::{Command, MonitorArgs};
use config::GuardConfig;
use health::MonitorOutcome;

mod ack;
mod audit;
mod cli;
mod config;
mod health;
mod metrics;
mod runtime;
mod self_update;
mod server;
mod signals;
mod store;

type BoxError = Box<dyn Error + Send + Sync>;

fn main() -> ExitCode {
    // Initialize the logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = cli::get_cli_args();

    // The controller is strictly sequential; one thread is all it needs.
    let runtime = match &args.command {
        Command::SelfUpdate => tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build(),
        Command::Monitor(_) | Command::Serve => tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build(),
    };
    let runtime = match runtime {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("Unable to start the async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match &args.command {
        Command::SelfUpdate => runtime.block_on(self_update::run()),
        Command::Monitor(monitor_args) => match runtime.block_on(monitor(monitor_args)) {
            Ok(outcome) => {
                log::info!("Health monitor for {} finished: {outcome:?}", monitor_args.container);
                ExitCode::SUCCESS
            }
            Err(e) => {
                log::error!("Health monitor for {} failed: {e}", monitor_args.container);
                ExitCode::FAILURE
            }
        },
        Command::Serve => match runtime.block_on(serve()) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                log::error!("{e}");
                ExitCode::FAILURE
            }
        },
    }
}

async fn load_config() -> Result<GuardConfig, BoxError> {
    Ok(GuardConfig::try_init(&cli::get_cli_args().config).await?)
}

async fn monitor(args: &MonitorArgs) -> Result<MonitorOutcome, BoxError> {
    use crate::runtime::ContainerRuntime;

    let config = load_config().await?;
    let window_ms = args.window_ms.unwrap_or(config.monitor.window_ms);
    let interval_ms = args.interval_ms.unwrap_or(config.monitor.interval_ms);
    if window_ms == 0 || interval_ms == 0 {
        return Err("window and interval must be greater than zero".into());
    }

    let docker = runtime::docker::DockerRuntime;
    let state = docker.inspect(&args.container).await?;

    let mut handle = health::start_health_monitor(health::HealthMonitorOptions {
        runtime: Arc::new(docker),
        container: runtime::ContainerRef::new(state.id, state.name),
        current_tag: args.current_tag.clone(),
        window: Duration::from_millis(window_ms),
        interval: Duration::from_millis(interval_ms),
        lifecycle: Arc::new(health::lifecycle::DockerLifecycle::default()),
        backups: Arc::new(store::FileBackupStore::new(config.store.backups.clone())),
        audit: Arc::new(audit::JsonlAuditLog::new(config.store.audit_log.clone())),
        metrics: Arc::new(metrics::GuardMetrics::new()?),
    });

    let mut shutdown = signals::handle_shutdown()?;
    let outcome = tokio::select! {
        outcome = handle.outcome() => outcome,
        Ok(()) = &mut shutdown => {
            handle.cancel();
            handle.outcome().await
        }
    };
    outcome.ok_or_else(|| "health monitor task panicked".into())
}

async fn serve() -> Result<(), BoxError> {
    let config = load_config().await?;
    let shutdown = signals::handle_shutdown()?;

    let launch_settings = self_update::LaunchSettings::new(
        &config.self_container_name,
        &config.self_update,
        Some(config.store.audit_log.display().to_string()),
    );
    let state = Arc::new(server::AppState {
        hub: Arc::new(ack::AckHub::new(Duration::from_millis(config.ack_timeout_ms))),
        monitors: health::MonitorRegistry::new(),
        metrics: Arc::new(metrics::GuardMetrics::new()?),
        runtime: Arc::new(runtime::docker::DockerRuntime),
        lifecycle: Arc::new(health::lifecycle::DockerLifecycle::default()),
        backups: Arc::new(store::FileBackupStore::new(config.store.backups.clone())),
        audit: Arc::new(audit::JsonlAuditLog::new(config.store.audit_log.clone())),
        launcher: Arc::new(self_update::SelfUpdateLauncher::new(launch_settings)),
        monitor_defaults: config.monitor.clone(),
    });

    server::serve(state, config.listen, async {
        let _ = shutdown.await;
    })
    .await?;
    Ok(())
}
