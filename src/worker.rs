//! Named background threads that run a task on a fixed interval.

use anyhow::Context;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// A background thread calling its task every `interval` until stopped.
///
/// The thread waits on a stop channel with `recv_timeout`, so a stop request wakes it
/// immediately instead of after the current interval.
pub struct Worker {
    name: String,
    stop: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn spawn(
        name: &str,
        interval: Duration,
        mut task: impl FnMut() + Send + 'static,
    ) -> anyhow::Result<Self> {
        let (tx, rx) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || loop {
                match rx.recv_timeout(interval) {
                    Err(mpsc::RecvTimeoutError::Timeout) => task(),
                    Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                }
            })
            .with_context(|| format!("spawn {} thread", name))?;
        log::debug!("started worker {} every {:?}", name, interval);

        Ok(Self {
            name: name.to_string(),
            stop: Some(tx),
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Asks the thread to exit and waits for it. Idempotent.
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("worker {} panicked", self.name);
            } else {
                log::debug!("stopped worker {}", self.name);
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}
