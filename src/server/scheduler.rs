//! Deals with the periodically scheduled background jobs.
//!
//! Every job kind runs as its own loop: one bounded sweep per tick,
//! nothing held between runs. A sweep that takes longer than its
//! interval simply delays the next tick; two sweeps of the same kind
//! never overlap within one instance. Across instances they do overlap,
//! which is fine — cross instance correctness comes from the lock
//! protocol, not from scheduling.

use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::api::JobReport;
use crate::config::Config;
use crate::server::manager::GatewayManager;

//------------ Scheduler -----------------------------------------------------

pub struct Scheduler {
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Starts the background jobs.
    pub fn build(manager: Arc<GatewayManager>, config: &Config) -> Self {
        let mut handles = Vec::new();

        {
            let manager = manager.clone();
            handles.push(spawn_job(
                "block list synchronization",
                config.blocklist_sync_seconds,
                move || {
                    let manager = manager.clone();
                    async move { manager.blocklist_synchronizer().sync_all().await }
                },
            ));
        }

        {
            let manager = manager.clone();
            handles.push(spawn_job(
                "HSM key rotation",
                config.key_rotation_seconds,
                move || {
                    let manager = manager.clone();
                    async move { manager.rotation().rotate_keys() }
                },
            ));
        }

        {
            let manager = manager.clone();
            handles.push(spawn_job(
                "key lock check",
                config.lock_check_seconds,
                move || {
                    let manager = manager.clone();
                    async move { manager.lock_checker().check_locks() }
                },
            ));
        }

        {
            let manager = manager.clone();
            handles.push(spawn_job(
                "TLS client certificate renewal",
                config.tls_check_seconds,
                move || {
                    let manager = manager.clone();
                    async move { manager.tls_engine().check_all().await }
                },
            ));
        }

        {
            let manager = manager.clone();
            handles.push(spawn_job(
                "CVC renewal",
                config.cvc_check_seconds,
                move || {
                    let manager = manager.clone();
                    async move { manager.cvc().renew_due_all().await }
                },
            ));
        }

        Scheduler { handles }
    }

    /// Stops all job loops.
    pub fn abort(&self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.abort();
    }
}

fn spawn_job<F, Fut>(name: &'static str, seconds: u32, job: F) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = JobReport> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(seconds.max(1) as u64));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            let report = job().await;
            if report.success() {
                if !report.is_empty() {
                    info!("{report}");
                }
            } else {
                warn!("Background job '{name}' had failures: {report}");
            }
        }
    })
}
