//! Accounting-manager liens.
//!
//! Before any preemption executes, the job-start intent is registered with
//! the accounting manager as a lien. The lien is deleted if the start
//! attempt fails; on success the job-start path consumes it.

use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};

use hpcsched_state::{Job, JobId};
use tokio::sync::Mutex;
use tracing::debug;

/// Boxed future returned by accounting calls.
pub type AccountingFuture<'a> = Pin<Box<dyn Future<Output = Result<(), String>> + Send + 'a>>;

/// External accounting manager.
pub trait AccountingManager: Send + Sync {
    /// Register a lien for `job` starting now.
    fn register_job_start<'a>(&'a self, job: &'a Job) -> AccountingFuture<'a>;

    /// Remove the lien held for `job`.
    fn delete_lien<'a>(&'a self, job: &'a Job) -> AccountingFuture<'a>;
}

/// Lien table kept in memory.
#[derive(Debug, Default)]
pub struct InMemoryAccounting {
    liens: Mutex<BTreeSet<JobId>>,
    reject_registrations: AtomicBool,
}

impl InMemoryAccounting {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent registration fail.
    pub fn reject_registrations(&self, reject: bool) {
        self.reject_registrations.store(reject, Ordering::SeqCst);
    }

    pub async fn has_lien(&self, job_id: &str) -> bool {
        self.liens.lock().await.contains(job_id)
    }

    pub async fn lien_count(&self) -> usize {
        self.liens.lock().await.len()
    }
}

impl AccountingManager for InMemoryAccounting {
    fn register_job_start<'a>(&'a self, job: &'a Job) -> AccountingFuture<'a> {
        Box::pin(async move {
            if self.reject_registrations.load(Ordering::SeqCst) {
                return Err(format!("lien for job {} rejected", job.id));
            }
            self.liens.lock().await.insert(job.id.clone());
            debug!(job = %job.id, "lien registered");
            Ok(())
        })
    }

    fn delete_lien<'a>(&'a self, job: &'a Job) -> AccountingFuture<'a> {
        Box::pin(async move {
            self.liens.lock().await.remove(&job.id);
            debug!(job = %job.id, "lien deleted");
            Ok(())
        })
    }
}
