//! Wiring of a coordinator node.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::CoordinatorConfig;
use crate::recovery::{Backoff, RecoveryEngine, RecoveryStats};
use crate::remote::ParticipantEndpoint;
use crate::resource::ResourceRegistry;
use crate::transaction::{Repository, TransactionManager, TransactionServices, XidFactory};
use crate::txlog::{Compaction, LogError, TransactionLog};
use crate::worker::Worker;

/// A coordinator node: the transaction log, the transaction manager, the recovery
/// engine and the background workers driving timeouts, recovery and compaction.
pub struct Coordinator {
    config: CoordinatorConfig,
    txlog: Arc<TransactionLog>,
    services: TransactionServices,
    manager: Arc<TransactionManager>,
    recovery: Arc<RecoveryEngine>,
    workers: Mutex<Vec<Worker>>,
    shut_down: AtomicBool,
}

impl Coordinator {
    /// Opens the log and loads every unfinished transaction for recovery.
    /// Workers are not started; see [`Coordinator::start_workers`].
    pub fn open(config: CoordinatorConfig, registry: Arc<ResourceRegistry>) -> Result<Self> {
        config.validate()?;
        let txlog = Arc::new(
            TransactionLog::open(&config.log_path, config.sync_on_write).with_context(|| {
                format!("Failed to open transaction log {}", config.log_path.display())
            })?,
        );

        let services = TransactionServices::new(
            txlog.clone(),
            registry,
            Arc::new(XidFactory::new(config.node_id)),
        );
        let repository = Arc::new(Repository::new());
        let pending = repository.load_from_store(&services);

        let manager = Arc::new(TransactionManager::new(
            services.clone(),
            Arc::clone(&repository),
            config.default_timeout,
        ));
        let recovery = Arc::new(RecoveryEngine::new(
            services.clone(),
            repository,
            Backoff::new(config.recovery_base_delay),
        ));

        log::info!(
            "coordinator node {} opened {} with {} transactions to recover",
            config.node_id,
            config.log_path.display(),
            pending
        );
        Ok(Self {
            config,
            txlog,
            services,
            manager,
            recovery,
            workers: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn log(&self) -> &Arc<TransactionLog> {
        &self.txlog
    }

    pub fn services(&self) -> &TransactionServices {
        &self.services
    }

    pub fn manager(&self) -> &Arc<TransactionManager> {
        &self.manager
    }

    pub fn repository(&self) -> &Arc<Repository> {
        self.manager.repository()
    }

    pub fn recovery(&self) -> &Arc<RecoveryEngine> {
        &self.recovery
    }

    /// Participant endpoint peers reach this node through, named `address`.
    pub fn endpoint(&self, address: impl Into<String>) -> ParticipantEndpoint {
        ParticipantEndpoint::new(Arc::clone(&self.manager), address)
    }

    /// Runs one recovery pass on the calling thread.
    pub fn recover_now(&self) -> RecoveryStats {
        self.recovery.run_once()
    }

    /// Runs one compaction pass on the calling thread.
    pub fn compact_now(&self) -> Result<Compaction> {
        self.txlog.compact().context("Failed to compact transaction log")
    }

    /// Starts the timeout, recovery and compaction workers. Calling it again while
    /// they run does nothing.
    pub fn start_workers(&self) -> Result<()> {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return Ok(());
        }

        let manager = Arc::clone(&self.manager);
        workers.push(Worker::spawn(
            "xa-timeout",
            self.config.timeout_scan_interval,
            move || {
                manager.timeout_scan();
            },
        )?);

        let recovery = Arc::clone(&self.recovery);
        log::debug!(
            "recovery backoff starts at {:?}",
            recovery.backoff().base()
        );
        workers.push(Worker::spawn(
            "xa-recovery",
            self.config.recovery_interval,
            move || {
                recovery.run_once();
            },
        )?);

        let txlog = Arc::clone(&self.txlog);
        workers.push(Worker::spawn(
            "xa-compaction",
            self.config.compaction_interval,
            move || match txlog.compact() {
                Ok(Compaction::Compacted { dropped, reclaimed }) => {
                    log::info!(
                        "compacted transaction log: {} records dropped, {} bytes reclaimed",
                        dropped,
                        reclaimed
                    );
                }
                Ok(Compaction::Busy) => log::debug!("compaction skipped, writers active"),
                Ok(Compaction::Clean) | Err(LogError::Closed) => {}
                Err(e) => log::warn!("compaction failed: {}", e),
            },
        )?);

        log::info!("started {} background workers", workers.len());
        Ok(())
    }

    /// Stops the workers and closes the log. Later calls do nothing.
    pub fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let workers = std::mem::take(&mut *self.workers.lock());
        for mut worker in workers {
            worker.stop();
        }
        self.txlog
            .close()
            .context("Failed to close transaction log")?;
        log::info!("coordinator node {} shut down", self.config.node_id);
        Ok(())
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!("shutdown failed: {:#}", e);
        }
    }
}
