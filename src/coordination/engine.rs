//! Periodic scheduler driving the workflow state machines

use crate::chain::TokenCreatedListener;
use crate::config::SchedulerConfig;
use crate::error::RelayerResult;
use crate::settlement::SettlementAggregator;
use crate::state::{WorkflowLocks, WorkflowStore};
use crate::workflow::{AdvanceOutcome, ContractInvoker, TokenSyncer};

use chrono::{Duration as ChronoDuration, Utc};
use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Semaphore};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Outcome of advancing every id of one tick
#[derive(Debug)]
pub struct TickReport<S> {
    pub advanced: Vec<(String, AdvanceOutcome<S>)>,
    pub failed: usize,
}

impl<S: PartialEq + Copy> TickReport<S> {
    /// Ids whose status changed this tick
    pub fn moved(&self) -> usize {
        self.advanced.iter().filter(|(_, o)| o.changed()).count()
    }
}

impl<S> Default for TickReport<S> {
    fn default() -> Self {
        Self {
            advanced: Vec::new(),
            failed: 0,
        }
    }
}

/// Token sync discovery and execution
pub struct TokenSyncJob {
    pub syncer: Arc<TokenSyncer>,
    pub listener: Arc<TokenCreatedListener>,
}

/// Daily settlement
pub struct SettlementJob {
    pub aggregator: Arc<SettlementAggregator>,
    pub interval: Duration,
    /// Number of past days settled each tick, yesterday included
    pub lookback_days: u32,
}

pub struct CoordinationEngine {
    /// Workflow persistence
    store: Arc<dyn WorkflowStore>,
    /// Per-id locks shared with the workflows
    locks: Arc<WorkflowLocks>,
    invoker: Arc<ContractInvoker>,
    token_sync: Option<TokenSyncJob>,
    settlement: Option<SettlementJob>,
    /// Configuration
    config: SchedulerConfig,
    /// Shutdown flag
    shutdown: watch::Sender<bool>,
}

impl CoordinationEngine {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        locks: Arc<WorkflowLocks>,
        invoker: Arc<ContractInvoker>,
        config: SchedulerConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            store,
            locks,
            invoker,
            token_sync: None,
            settlement: None,
            config,
            shutdown,
        }
    }

    pub fn with_token_sync(mut self, job: TokenSyncJob) -> Self {
        self.token_sync = Some(job);
        self
    }

    pub fn with_settlement(mut self, job: SettlementJob) -> Self {
        self.settlement = Some(job);
        self
    }

    /// Run every configured loop until `stop` is called. Loops are
    /// independent; ticks of one loop never overlap.
    pub async fn run(&self) -> RelayerResult<()> {
        info!("Coordination engine started");

        let invoke_loop = self.run_loop(
            "contract_invoke",
            Duration::from_secs(self.config.contract_invoke_interval_secs),
            || self.tick_contract_invoke(),
        );

        let sync_loop = async {
            if self.token_sync.is_some() {
                self.run_loop(
                    "token_sync",
                    Duration::from_secs(self.config.token_sync_interval_secs),
                    || self.tick_token_sync(),
                )
                .await;
            }
        };

        let settlement_loop = async {
            if let Some(job) = &self.settlement {
                self.run_loop("settlement", job.interval, || self.tick_settlement())
                    .await;
            }
        };

        tokio::join!(invoke_loop, sync_loop, settlement_loop);

        info!("Coordination engine stopped");
        Ok(())
    }

    async fn run_loop<'a, F, Fut>(&'a self, name: &'static str, period: Duration, mut tick: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RelayerResult<()>> + 'a,
    {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return;
        }

        let mut ticker = interval(period.max(Duration::from_millis(1)));
        // A slow tick delays the next one instead of bursting
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!("Scheduler loop {} every {:?}", name, period);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let started = Instant::now();
                    if let Err(e) = tick().await {
                        error!("Scheduler loop {} tick failed: {}", name, e);
                    }
                    debug!("Scheduler loop {} tick took {:?}", name, started.elapsed());
                }
                _ = shutdown.changed() => break,
            }
        }

        debug!("Scheduler loop {} stopped", name);
    }

    /// Advance every unfinished contract-invoke workflow once
    pub async fn tick_contract_invoke(&self) -> RelayerResult<()> {
        let started = Instant::now();
        let ids = self
            .store
            .unfinished_invoke_ids(self.config.max_retry_count)
            .await?;

        let report = self
            .advance_all(ids, |id| {
                let invoker = self.invoker.clone();
                async move { invoker.advance(&id).await }
            })
            .await;

        self.finish_tick("contract_invoke", started, &report);
        Ok(())
    }

    /// Discover new token creations, then advance every pending sync once and
    /// drop the ones that reached a terminal state
    pub async fn tick_token_sync(&self) -> RelayerResult<()> {
        let Some(job) = &self.token_sync else {
            return Ok(());
        };
        let started = Instant::now();

        match job.listener.scan_once().await {
            Ok(0) => {}
            Ok(found) => info!("Discovered {} token creations", found),
            Err(e) => warn!("Token creation search failed: {}", e),
        }

        let ids = self.store.pending_sync_ids().await?;
        let report = self
            .advance_all(ids, |id| {
                let syncer = job.syncer.clone();
                async move { syncer.advance(&id).await }
            })
            .await;

        let finished: Vec<String> = report
            .advanced
            .iter()
            .filter(|(_, outcome)| outcome.to.is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        if !finished.is_empty() {
            // Left in place on failure; terminal ids are dropped again next tick
            match self.store.remove_pending_syncs(&finished).await {
                Ok(()) => debug!(
                    "Removed {} finished token syncs from the pending set",
                    finished.len()
                ),
                Err(e) => warn!("Failed to remove finished token syncs: {}", e),
            }
        }

        self.finish_tick("token_sync", started, &report);
        Ok(())
    }

    /// Settle the last `lookback_days` UTC days, oldest first. Completed
    /// dates are skipped by their lease; one failing date does not block
    /// the others.
    pub async fn tick_settlement(&self) -> RelayerResult<()> {
        let Some(job) = &self.settlement else {
            return Ok(());
        };

        let today = Utc::now().date_naive();
        let mut first_error = None;
        for days_back in (1..=i64::from(job.lookback_days.max(1))).rev() {
            let biz_date = today - ChronoDuration::days(days_back);
            match job.aggregator.settle(biz_date).await {
                Ok(Some(ids)) => {
                    info!("Settlement of {} created {} workflows", biz_date, ids.len())
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("Settlement of {} failed: {}", biz_date, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Run `advance` for every id on its own task, bounded by
    /// `max_concurrent_per_tick`, and wait for all of them. A failing id
    /// never affects its siblings.
    async fn advance_all<S, F, Fut>(&self, ids: Vec<String>, advance: F) -> TickReport<S>
    where
        S: Send + 'static,
        F: Fn(String) -> Fut,
        Fut: Future<Output = RelayerResult<AdvanceOutcome<S>>> + Send + 'static,
    {
        let mut report = TickReport::default();
        if ids.is_empty() {
            return report;
        }

        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_per_tick.max(1)));
        let mut handles = Vec::with_capacity(ids.len());

        for id in ids {
            let permits = permits.clone();
            let work = advance(id.clone());
            handles.push(tokio::spawn(async move {
                let _permit = permits.acquire_owned().await;
                (id, work.await)
            }));
        }

        for joined in join_all(handles).await {
            match joined {
                Ok((id, Ok(outcome))) => report.advanced.push((id, outcome)),
                Ok((id, Err(e))) => {
                    if e.should_alert() {
                        error!("Advancing {} failed: {}", id, e);
                    } else {
                        warn!("Advancing {} failed: {}", id, e);
                    }
                    report.failed += 1;
                }
                Err(e) => {
                    error!("Advance task panicked: {}", e);
                    report.failed += 1;
                }
            }
        }

        report
    }

    fn finish_tick<S: PartialEq + Copy>(&self, name: &str, started: Instant, report: &TickReport<S>) {
        self.locks.release_idle();
        let succeeded = report.advanced.len();
        crate::metrics::record_tick(name, succeeded, report.failed, started.elapsed().as_secs_f64());
        if succeeded + report.failed > 0 {
            debug!(
                "Scheduler loop {}: {} advanced ({} moved), {} failed, {} ids locked",
                name,
                succeeded,
                report.moved(),
                report.failed,
                self.locks.len()
            );
        }
    }

    /// Stop all loops at their next tick boundary
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
        info!("Coordination engine shutdown initiated");
    }
}
