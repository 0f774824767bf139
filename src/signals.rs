use signal_hook::{
    consts::{SIGINT, SIGTERM},
    iterator::Signals,
};
use tokio::sync::oneshot;

/// What should we do when the user stops this program?
///
/// The first SIGINT or SIGTERM reports `STOPPING` to systemd and resolves the
/// returned receiver. Later signals are ignored; shutdown is already underway.
pub fn handle_shutdown() -> std::io::Result<oneshot::Receiver<()>> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    let (tx, rx) = oneshot::channel();

    std::thread::spawn(move || {
        if let Some(signal) = signals.forever().next() {
            log::info!("Received signal {signal}, shutting down");
            let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Stopping]);
            let _ = tx.send(());
        }
    });

    Ok(rx)
}
