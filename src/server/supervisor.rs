use std::future::Future;
use std::panic::AssertUnwindSafe;

use anyhow::{anyhow, Result};
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::shared::logging::log_fatal;

/// Spawns background tasks and reports the ones that fail.
#[derive(Clone)]
pub struct Supervisor {
    failures: mpsc::UnboundedSender<anyhow::Error>,
}

/// Receiving end of a [`Supervisor`]'s failure reports.
pub struct FailureWatch {
    failures: mpsc::UnboundedReceiver<anyhow::Error>,
}

impl Supervisor {
    pub fn new() -> (Self, FailureWatch) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { failures: tx }, FailureWatch { failures: rx })
    }

    /// Run `task` on the runtime. An `Err` or a panic is reported as a
    /// failure.
    pub fn spawn<F>(&self, name: &'static str, task: F) -> JoinHandle<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let failures = self.failures.clone();
        tokio::spawn(async move {
            let failure = match AssertUnwindSafe(task).catch_unwind().await {
                Ok(Ok(())) => return,
                Ok(Err(e)) => e.context(format!("task '{name}' failed")),
                Err(panic) => anyhow!("task '{}' panicked: {}", name, panic_message(&*panic)),
            };
            error!("Supervised task '{}' failed: {:#}", name, failure);
            let _ = failures.send(failure);
        })
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Drive `root` until it finishes or the first failure is reported.
///
/// Only the first failure is returned; the watch is dropped afterwards so
/// later reports go nowhere.
pub async fn run_supervised<F>(mut watch: FailureWatch, root: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    tokio::select! {
        biased;
        Some(failure) = watch.failures.recv() => Err(failure),
        result = root => result,
    }
}

/// Exit the process: one fatal log entry and status 1 on failure, status 0
/// otherwise.
pub fn terminate(result: Result<()>) -> ! {
    match result {
        Ok(()) => {
            info!("Shutdown complete");
            std::process::exit(0)
        }
        Err(e) => {
            log_fatal(&e);
            std::process::exit(1)
        }
    }
}
