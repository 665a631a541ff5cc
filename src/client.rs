use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time::sleep;

use crate::config::Config;
use crate::filters::SyncFilters;
use crate::http::ApiClient;
use crate::shutdown::Shutdown;
use crate::sync::{bulk_bootstrap, sync_once, LocalScanner, SyncJournal};

const SYNC_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct ClientStartOptions {
    pub healthz_max_attempts: Option<usize>,
}

pub struct Client {
    cfg: Config,
    api: ApiClient,
}

impl Client {
    pub fn new(cfg: Config, api: ApiClient) -> Self {
        Self { cfg, api }
    }

    /// Bootstrap (initial bulk download if the workspace is empty) then run
    /// the sync loop until `shutdown` fires. A [`crate::sync::SyncEnvironmentError`]
    /// terminates the loop permanently; a per-file error is logged and the
    /// next tick retries.
    pub async fn start_with_shutdown(
        &mut self,
        shutdown: Shutdown,
        opts: ClientStartOptions,
    ) -> Result<()> {
        if !self
            .wait_until_reachable(opts.healthz_max_attempts.unwrap_or(60), &shutdown)
            .await?
        {
            crate::logging::info("client shutdown requested before server became reachable");
            return Ok(());
        }

        let filters = SyncFilters::load(&self.cfg.data_dir.join("datasites"))?;
        let mut scanner = LocalScanner::default();
        let mut journal = SyncJournal::load(&self.cfg.data_dir)?;

        if let Err(err) = bulk_bootstrap(&self.api, &self.cfg.data_dir, &filters).await {
            crate::logging::error(format!("bulk bootstrap failed: {err:?}"));
        }

        loop {
            tokio::select! {
                _ = shutdown.wait() => {
                    crate::logging::info("client shutdown requested");
                    return Ok(());
                }
                result = sync_once(&self.api, &self.cfg.data_dir, &filters, &mut scanner, &mut journal) => {
                    if let Err(err) = result {
                        if err.downcast_ref::<crate::sync::SyncEnvironmentError>().is_some() {
                            crate::logging::error(format!("fatal sync error, stopping: {err:?}"));
                            return Err(err);
                        }
                        crate::logging::error(format!("sync iteration error: {err:?}"));
                    }
                }
            }
            sleep(SYNC_POLL_INTERVAL).await;
        }
    }

    /// Polls `whoami` until it succeeds, `max_attempts` is exhausted, or
    /// `shutdown` fires. Returns `Ok(false)` on shutdown so the caller can
    /// exit without treating it as an error.
    async fn wait_until_reachable(&self, max_attempts: usize, shutdown: &Shutdown) -> Result<bool> {
        let mut last_err = None;
        for attempt in 1..=max_attempts.max(1) {
            tokio::select! {
                _ = shutdown.wait() => return Ok(false),
                result = self.api.whoami() => {
                    match result {
                        Ok(_) => return Ok(true),
                        Err(err) => {
                            last_err = Some(err);
                            if attempt < max_attempts {
                                tokio::select! {
                                    _ = shutdown.wait() => return Ok(false),
                                    _ = sleep(Duration::from_millis(500)) => {}
                                }
                            }
                        }
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("server unreachable")))
            .context("waiting for server to become reachable")
    }
}
