//! Settlement aggregation
//!
//! Turns the per-address daily point deltas of one business date into
//! bounded batches and hands each batch to a contract-invoke workflow.
//! A date is settled under a persisted lease, so it runs at most once even
//! across restarts. Batch ids derive from the lease's run token, so a run
//! resumed after a crash reuses the workflows it already created.

use crate::chain::ChainManager;
use crate::config::SettlementConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::state::WorkflowStore;
use crate::workflow::{ContractInvokeRequest, ContractInvoker};

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};
use uuid::Uuid;

/// One address's point delta for a business date
#[derive(Debug, Clone, PartialEq)]
pub struct PointDelta {
    pub address: String,
    pub point_name: String,
    pub amount: Decimal,
}

/// Paginated supply of raw point deltas
#[async_trait]
pub trait SettlementSource: Send + Sync {
    async fn fetch_page(
        &self,
        chain_id: &str,
        biz_date: NaiveDate,
        skip: usize,
        limit: usize,
    ) -> RelayerResult<Vec<PointDelta>>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UserPoints<'a> {
    user_address: &'a str,
    points_name: &'a str,
    user_points: Decimal,
}

/// Argument of the settlement contract method
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SettlementParam<'a> {
    action_name: &'a str,
    user_points_list: Vec<UserPoints<'a>>,
}

pub struct SettlementAggregator {
    source: Arc<dyn SettlementSource>,
    invoker: Arc<ContractInvoker>,
    chain_manager: Arc<ChainManager>,
    store: Arc<dyn WorkflowStore>,
    config: SettlementConfig,
    instance_id: String,
}

impl SettlementAggregator {
    pub fn new(
        source: Arc<dyn SettlementSource>,
        invoker: Arc<ContractInvoker>,
        chain_manager: Arc<ChainManager>,
        store: Arc<dyn WorkflowStore>,
        config: SettlementConfig,
        instance_id: String,
    ) -> Self {
        Self {
            source,
            invoker,
            chain_manager,
            store,
            config,
            instance_id,
        }
    }

    fn lease_name(&self, biz_date: NaiveDate) -> String {
        format!("settlement:{}:{}", self.config.chain_id, biz_date)
    }

    /// Settle `biz_date`, returning the created workflow ids, or `None` when
    /// the date is already settled or being settled by another instance
    pub async fn settle(&self, biz_date: NaiveDate) -> RelayerResult<Option<Vec<String>>> {
        let lease = self.lease_name(biz_date);
        let ttl = Duration::from_secs(self.config.lease_ttl_secs);

        let candidate = Uuid::new_v4().simple().to_string();
        let run_token = match self
            .store
            .try_acquire_lease(&lease, &self.instance_id, ttl, &candidate)
            .await?
        {
            Some(token) => token,
            None => {
                debug!("Settlement lease {} not available", lease);
                return Ok(None);
            }
        };

        match self.run(biz_date, &run_token).await {
            Ok(ids) => {
                self.store
                    .release_lease(&lease, &self.instance_id, true)
                    .await?;
                info!(
                    "Settled {} on chain {}: {} batches",
                    biz_date,
                    self.config.chain_id,
                    ids.len()
                );
                Ok(Some(ids))
            }
            Err(e) => {
                error!("Settlement of {} failed: {}", biz_date, e);
                self.store
                    .release_lease(&lease, &self.instance_id, false)
                    .await?;
                Err(e)
            }
        }
    }

    async fn run(&self, biz_date: NaiveDate, run_token: &str) -> RelayerResult<Vec<String>> {
        let chain_id = &self.config.chain_id;
        let contract_address = self
            .chain_manager
            .contract_address(chain_id, &self.config.contract)?;

        let deltas = self.load(biz_date).await?;
        let mut ids = Vec::new();

        for (point_name, entries) in group_by_point_name(deltas) {
            for (index, chunk) in entries.chunks(self.config.batch_size.max(1)).enumerate() {
                let request = ContractInvokeRequest {
                    biz_id: business_id(chain_id, biz_date, &point_name, run_token, index),
                    chain_id: chain_id.clone(),
                    contract_address: contract_address.clone(),
                    contract_method: self.config.method.clone(),
                    biz_type: self.config.biz_type.clone(),
                    param: self.encode_param(chunk)?,
                };

                let record = self.invoker.create(request).await?;
                debug!(
                    "Settlement batch {} for {}: {} entries",
                    record.id,
                    point_name,
                    chunk.len()
                );
                crate::metrics::record_settlement_batch(chain_id, &point_name);
                ids.push(record.id);
            }
        }

        Ok(ids)
    }

    /// Page through the source until an empty page, keeping positive amounts
    async fn load(&self, biz_date: NaiveDate) -> RelayerResult<Vec<PointDelta>> {
        if self.config.page_size == 0 {
            return Err(RelayerError::Config(
                "settlement.page_size must be positive".to_string(),
            ));
        }

        let mut deltas = Vec::new();
        let mut skip = 0;
        loop {
            let page = self
                .source
                .fetch_page(&self.config.chain_id, biz_date, skip, self.config.page_size)
                .await?;
            if page.is_empty() {
                break;
            }
            skip += page.len();
            deltas.extend(page.into_iter().filter(|d| d.amount > Decimal::ZERO));
        }

        Ok(deltas)
    }

    fn encode_param(&self, chunk: &[PointDelta]) -> RelayerResult<String> {
        let param = SettlementParam {
            action_name: &self.config.action_name,
            user_points_list: chunk
                .iter()
                .map(|d| UserPoints {
                    user_address: &d.address,
                    points_name: &d.point_name,
                    user_points: d.amount,
                })
                .collect(),
        };
        Ok(hex::encode(serde_json::to_vec(&param)?))
    }
}

/// Group by point name, keeping first-seen group order and entry order
fn group_by_point_name(deltas: Vec<PointDelta>) -> Vec<(String, Vec<PointDelta>)> {
    let mut groups: Vec<(String, Vec<PointDelta>)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for delta in deltas {
        match index.get(&delta.point_name) {
            Some(&i) => groups[i].1.push(delta),
            None => {
                index.insert(delta.point_name.clone(), groups.len());
                groups.push((delta.point_name.clone(), vec![delta]));
            }
        }
    }

    groups
}

fn business_id(
    chain_id: &str,
    biz_date: NaiveDate,
    point_name: &str,
    run_token: &str,
    index: usize,
) -> String {
    format!(
        "{}-{}-{}-{}-{}",
        chain_id,
        biz_date.format("%Y%m%d"),
        point_name,
        run_token,
        index
    )
}
