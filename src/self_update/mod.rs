pub mod controller;
pub mod env;
pub mod launcher;

use std::process::ExitCode;

pub use controller::SelfUpdateController;
pub use env::UpdateOperation;
pub use launcher::{LaunchSettings, SelfUpdateLaunch, SelfUpdateLauncher};

use crate::audit::JsonlAuditLog;
use crate::runtime::docker::DockerRuntime;

/// Exit code when the environment contract is unusable. Nothing was touched.
const EXIT_INVALID_CONTRACT: u8 = 2;

/// Entry point of the controller process: one operation, then exit.
pub async fn run() -> ExitCode {
    let op = match UpdateOperation::from_env() {
        Ok(op) => op,
        Err(e) => {
            log::error!("[self-update] invalid environment: {e}");
            return ExitCode::from(EXIT_INVALID_CONTRACT);
        }
    };

    log::info!(
        "[self-update:{}] replacing {} ({}) with {}",
        op.op_id,
        op.old.id,
        op.old.name,
        op.candidate_id
    );

    let runtime = DockerRuntime;
    let audit = std::env::var(env::AUDIT_LOG_PATH)
        .ok()
        .filter(|p| !p.trim().is_empty())
        .map(JsonlAuditLog::new);

    let mut controller = SelfUpdateController::new(&op, &runtime);
    if let Some(audit) = &audit {
        controller = controller.with_audit(audit);
    }

    match controller.execute().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("[self-update:{}] failed in {}: {e}", op.op_id, e.phase());
            ExitCode::FAILURE
        }
    }
}
