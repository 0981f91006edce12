use crate::error::FatalError;
use crate::run::RunReport;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use std::time::Duration;
use tracing::{error, info, warn};

/// Cancellation token observed only while the daemon sleeps between runs.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: Receiver<()>,
}

/// Requests shutdown. Requests made during a run are kept until the next
/// suspension point.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Sender<()>,
}

impl Shutdown {
    pub fn channel() -> (ShutdownHandle, Shutdown) {
        let (tx, rx) = bounded(1);
        (ShutdownHandle { tx }, Shutdown { rx })
    }

    /// Sleeps for `interval`. Returns `true` if shutdown was requested before
    /// or during the sleep, or every handle is gone.
    pub fn wait(&self, interval: Duration) -> bool {
        match self.rx.recv_timeout(interval) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => false,
        }
    }
}

impl ShutdownHandle {
    pub fn request(&self) {
        // Full means a request is already pending.
        let _ = self.tx.try_send(());
    }
}

/// Routes SIGINT/SIGTERM into `handle`.
pub fn install_signal_handler(handle: ShutdownHandle) -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(move || {
        warn!("Termination signal received, stopping after the current run.");
        handle.request();
    })
}

/// Counters kept over the daemon's lifetime.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DaemonStats {
    pub runs: u64,
    pub failed_runs: u64,
    pub exported: u64,
}

/// Batch mode: one run.
pub fn run_cron<F>(mut run: F) -> Result<RunReport, FatalError>
where
    F: FnMut() -> Result<RunReport, FatalError>,
{
    info!("Starting with the \"cron\" parameter, we will run once and then exit.");
    let report = run()?;
    info!("Nothing more to be done, we will exit.");
    Ok(report)
}

/// Daemon mode: run, sleep `interval`, repeat until `shutdown` fires.
///
/// Failed runs are logged and retried on the next tick. Fatal errors end the
/// loop. A run in progress is never interrupted.
pub fn run_daemon<F>(
    mut run: F,
    interval: Duration,
    shutdown: &Shutdown,
) -> Result<DaemonStats, FatalError>
where
    F: FnMut() -> Result<RunReport, FatalError>,
{
    info!(interval_secs = interval.as_secs(), "Starting in daemon mode.");
    let mut stats = DaemonStats::default();
    loop {
        info!("Starting a new iteration.");
        let report = run()?;
        stats.runs += 1;
        stats.exported += report.exported as u64;
        if !report.succeeded() {
            stats.failed_runs += 1;
            error!(
                watermark = report.started_from,
                "Iteration failed; retrying on the next tick."
            );
        }
        info!("Iteration finished.");

        if shutdown.wait(interval) {
            warn!("Shutdown requested, stopping daemon.");
            break;
        }
    }
    info!(
        runs = stats.runs,
        failed_runs = stats.failed_runs,
        exported = stats.exported,
        "Nothing more to be done, we will exit."
    );
    Ok(stats)
}
