// Shutdown signals

//! Termination signals during a confirmation wait
//!
//! Once installed, SIGTERM, SIGHUP and SIGINT no longer kill the process.
//! They are delivered through [`ShutdownSignals::recv`] so the caller can
//! revert a pending transaction before exiting.

use anyhow::Context;
use tokio::signal::unix::{signal, Signal, SignalKind};

pub struct ShutdownSignals {
    terminate: Signal,
    hangup: Signal,
    interrupt: Signal,
}

impl ShutdownSignals {
    /// Install the handlers
    pub fn install() -> anyhow::Result<Self> {
        Ok(Self {
            terminate: signal(SignalKind::terminate()).context("Failed to set up SIGTERM handler")?,
            hangup: signal(SignalKind::hangup()).context("Failed to set up SIGHUP handler")?,
            interrupt: signal(SignalKind::interrupt()).context("Failed to set up SIGINT handler")?,
        })
    }

    /// Wait for the next signal and return its name
    pub async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.terminate.recv() => "SIGTERM",
            _ = self.hangup.recv() => "SIGHUP",
            _ = self.interrupt.recv() => "SIGINT",
        }
    }
}
