//! Interrupt/terminate/hangup handling for the `broker` and `worker`
//! long-running subcommands: any of the three signals sets one shutdown
//! sentinel, never more than once, and lets the caller drain in-flight
//! work instead of dying mid-run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct ShutdownSignal {
    flag: Arc<AtomicBool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Installs handlers for SIGINT/SIGTERM (and SIGHUP on unix) that set
    /// the sentinel on first delivery and log and ignore any after.
    pub fn install(&self) {
        let flag = self.flag.clone();
        tokio::spawn(async move {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                let mut interrupt = signal(SignalKind::interrupt()).expect("install SIGINT handler");
                let mut terminate = signal(SignalKind::terminate()).expect("install SIGTERM handler");
                let mut hangup = signal(SignalKind::hangup()).expect("install SIGHUP handler");
                tokio::select! {
                    _ = interrupt.recv() => {}
                    _ = terminate.recv() => {}
                    _ = hangup.recv() => {}
                }
            }
            #[cfg(not(unix))]
            {
                let _ = tokio::signal::ctrl_c().await;
            }

            if flag.swap(true, Ordering::SeqCst) {
                tracing::warn!("shutdown signal received again, already draining");
            } else {
                tracing::info!("shutdown signal received, draining");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_unset() {
        assert!(!ShutdownSignal::new().is_set());
    }
}
