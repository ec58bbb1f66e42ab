use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::Jobs;
use crate::error::{PipelineError, Result};
use crate::orchestrator::Orchestrator;

#[derive(Debug, Clone)]
pub struct JanitorConfig {
    /// A `processing` job without a checkpoint for this long is abandoned.
    pub staleness_window: Duration,
    pub interval: Duration,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            staleness_window: Duration::from_secs(30 * 60),
            interval: Duration::from_secs(60),
        }
    }
}

impl From<&Jobs> for JanitorConfig {
    fn from(jobs: &Jobs) -> Self {
        Self {
            staleness_window: jobs.staleness_window(),
            interval: jobs.janitor_interval(),
        }
    }
}

/// Fails jobs whose worker stopped checkpointing, which otherwise stay
/// `processing` forever after a crash.
pub struct Janitor {
    orchestrator: Orchestrator,
    config: JanitorConfig,
}

impl Janitor {
    pub fn new(orchestrator: Orchestrator, config: JanitorConfig) -> Self {
        Self {
            orchestrator,
            config,
        }
    }

    pub async fn sweep(&self) -> Result<usize> {
        self.sweep_at(Utc::now()).await
    }

    /// Sweep as if the clock read `now`.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let window = chrono::Duration::from_std(self.config.staleness_window)
            .map_err(|e| PipelineError::Store(e.into()))?;
        let settled = self.orchestrator.fail_stale(now - window).await?;
        if settled.is_empty() {
            debug!("janitor: no stale jobs");
        } else {
            info!(count = settled.len(), "janitor settled stale jobs");
        }
        Ok(settled.len())
    }

    pub fn start(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("janitor: shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        if let Err(e) = self.sweep().await {
                            error!("janitor sweep error: {}", e);
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_window_is_thirty_minutes() {
        let config = JanitorConfig::default();
        assert_eq!(config.staleness_window, Duration::from_secs(1800));
        assert_eq!(config.interval, Duration::from_secs(60));
    }
}
