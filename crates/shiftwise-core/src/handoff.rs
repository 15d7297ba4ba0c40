// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Context handoff store.
//!
//! Steps of one run never share memory. Whatever a later step needs from an
//! earlier one is written here as a typed JSON record keyed by
//! `prefix + trim(service_id)` and scoped to the workflow execution id.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use shiftwise_protocol::{InstanceInfo, LoadBalancerWiring, ResizeStrategy, ScalingGroupConfig};
use tracing::debug;

use crate::error::{CoreError, Result};
use crate::persistence::Persistence;
use crate::run::WorkflowRunContext;

/// Prefix of the setup record.
pub const SETUP_CONTEXT_PREFIX: &str = "setupContext-";
/// Prefix of the instance-list record.
pub const INSTANCE_LIST_PREFIX: &str = "instanceList-";
/// Prefix of the traffic-weight record.
pub const TRAFFIC_WEIGHT_PREFIX: &str = "trafficWeight-";
/// Prefix of the all-phase rollback marker.
pub const ROLLBACK_DONE_PREFIX: &str = "allPhaseRollbackDone-";

/// Build a record key.
pub fn handoff_key(prefix: &str, service_id: &str) -> String {
    format!("{}{}", prefix, service_id.trim())
}

/// Frozen pre-deployment state written by the setup step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupContextRecord {
    /// New group with its full-scale capacity.
    pub new_group: ScalingGroupConfig,
    /// Group live before the deployment.
    pub old_group: Option<ScalingGroupConfig>,
    /// Requested resize order.
    pub resize_strategy: ResizeStrategy,
    /// Blue/green deployment.
    pub blue_green: bool,
    /// Listener wiring.
    pub load_balancers: Vec<LoadBalancerWiring>,
    /// New group name prefix.
    pub name_prefix: String,
    /// Cloud region.
    pub region: String,
    /// Remote timeout for later steps.
    pub timeout_minutes: u32,
}

impl SetupContextRecord {
    /// Resize order later steps must follow.
    pub fn effective_strategy(&self) -> ResizeStrategy {
        if self.blue_green {
            ResizeStrategy::ResizeNewFirst
        } else {
            self.resize_strategy
        }
    }
}

/// One instance in the instance-list record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceElement {
    /// Instance details.
    pub instance: InstanceInfo,
    /// Launched by the step that wrote the record.
    pub new_instance: bool,
}

/// Instances produced by a deploy phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceListRecord {
    /// Tagged instances.
    pub instances: Vec<InstanceElement>,
}

impl InstanceListRecord {
    /// Tag new and existing instances.
    pub fn from_resize(new_instances: Vec<InstanceInfo>, existing: Vec<InstanceInfo>) -> Self {
        let instances = new_instances
            .into_iter()
            .map(|instance| InstanceElement {
                instance,
                new_instance: true,
            })
            .chain(existing.into_iter().map(|instance| InstanceElement {
                instance,
                new_instance: false,
            }))
            .collect();
        Self { instances }
    }

    /// Instances launched by this phase.
    pub fn new_instances(&self) -> impl Iterator<Item = &InstanceInfo> {
        self.instances
            .iter()
            .filter(|e| e.new_instance)
            .map(|e| &e.instance)
    }
}

/// Traffic weight applied by a listener step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficWeightRecord {
    /// Percentage of traffic on the new group.
    pub new_group_weight: u8,
}

/// Written once a deploy rollback has restored the old group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackMarker {
    /// Activity that performed the rollback.
    pub activity_id: String,
}

/// Typed view over the handoff tables.
#[derive(Clone)]
pub struct HandoffStore {
    persistence: Arc<dyn Persistence>,
}

impl HandoffStore {
    /// Wrap a persistence backend.
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self { persistence }
    }

    /// Write or overwrite a record.
    pub async fn put<T: Serialize + Sync>(
        &self,
        run: &WorkflowRunContext,
        key: &str,
        value: &T,
    ) -> Result<()> {
        let payload = serde_json::to_string(value)?;
        self.persistence
            .put_handoff(&run.workflow_execution_id, key, &payload)
            .await?;
        debug!(
            workflow_execution_id = %run.workflow_execution_id,
            key = %key,
            "Handoff record written"
        );
        Ok(())
    }

    /// Write a record that may exist only once per run.
    ///
    /// Writing the identical payload again succeeds.
    pub async fn put_once<T: Serialize + Sync>(
        &self,
        run: &WorkflowRunContext,
        key: &str,
        value: &T,
    ) -> Result<()> {
        let payload = serde_json::to_string(value)?;
        let written = self
            .persistence
            .insert_handoff_once(&run.workflow_execution_id, key, &payload)
            .await?;
        if !written {
            let existing = self
                .persistence
                .get_handoff(&run.workflow_execution_id, key)
                .await?;
            if existing.is_some_and(|record| record.payload == payload) {
                debug!(
                    workflow_execution_id = %run.workflow_execution_id,
                    key = %key,
                    "Write-once handoff record already present"
                );
                return Ok(());
            }
            return Err(CoreError::HandoffAlreadyExists {
                workflow_execution_id: run.workflow_execution_id.clone(),
                key: key.to_string(),
            });
        }
        debug!(
            workflow_execution_id = %run.workflow_execution_id,
            key = %key,
            "Write-once handoff record written"
        );
        Ok(())
    }

    /// Read a record; `None` if it was never written.
    pub async fn get<T: DeserializeOwned>(
        &self,
        run: &WorkflowRunContext,
        key: &str,
    ) -> Result<Option<T>> {
        match self
            .persistence
            .get_handoff(&run.workflow_execution_id, key)
            .await?
        {
            Some(record) => Ok(Some(serde_json::from_str(&record.payload)?)),
            None => Ok(None),
        }
    }

    /// Setup record of the run's service.
    pub async fn setup_record(&self, run: &WorkflowRunContext) -> Result<Option<SetupContextRecord>> {
        self.get(run, &handoff_key(SETUP_CONTEXT_PREFIX, &run.service_id))
            .await
    }

    /// Drop every record of the run.
    pub async fn purge_run(&self, run: &WorkflowRunContext) -> Result<u64> {
        self.persistence
            .purge_run_handoffs(&run.workflow_execution_id)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::SqlitePersistence;
    use shiftwise_protocol::Capacity;

    async fn store() -> HandoffStore {
        let persistence = SqlitePersistence::in_memory().await.unwrap();
        HandoffStore::new(Arc::new(persistence))
    }

    fn run() -> WorkflowRunContext {
        WorkflowRunContext::new("run-1", "app", "env", " svc-1 ", "acc")
    }

    fn setup_record(blue_green: bool) -> SetupContextRecord {
        SetupContextRecord {
            new_group: ScalingGroupConfig::new("sg-new", "app__2", Capacity::new(1, 10, 4)),
            old_group: None,
            resize_strategy: ResizeStrategy::DownsizeOldFirst,
            blue_green,
            load_balancers: vec![],
            name_prefix: "app".to_string(),
            region: "us-east-1".to_string(),
            timeout_minutes: 10,
        }
    }

    #[test]
    fn test_handoff_key_trims_service_id() {
        assert_eq!(
            handoff_key(SETUP_CONTEXT_PREFIX, "  svc-1\n"),
            "setupContext-svc-1"
        );
        assert_eq!(handoff_key(INSTANCE_LIST_PREFIX, "svc"), "instanceList-svc");
    }

    #[test]
    fn test_blue_green_forces_resize_new_first() {
        assert_eq!(
            setup_record(true).effective_strategy(),
            ResizeStrategy::ResizeNewFirst
        );
        assert_eq!(
            setup_record(false).effective_strategy(),
            ResizeStrategy::DownsizeOldFirst
        );
    }

    #[test]
    fn test_instance_list_tags_new_instances() {
        let info = |id: &str| InstanceInfo {
            instance_id: id.to_string(),
            private_ip: None,
            group_id: "sg".to_string(),
        };
        let record = InstanceListRecord::from_resize(vec![info("i-1")], vec![info("i-2")]);
        assert_eq!(record.instances.len(), 2);
        let new: Vec<_> = record.new_instances().map(|i| i.instance_id.as_str()).collect();
        assert_eq!(new, vec!["i-1"]);
    }

    #[tokio::test]
    async fn test_setup_record_written_once() {
        let store = store().await;
        let run = run();
        let key = handoff_key(SETUP_CONTEXT_PREFIX, &run.service_id);

        store.put_once(&run, &key, &setup_record(false)).await.unwrap();
        // same payload again is accepted
        store.put_once(&run, &key, &setup_record(false)).await.unwrap();
        let err = store
            .put_once(&run, &key, &setup_record(true))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "HANDOFF_ALREADY_EXISTS");

        let stored = store.setup_record(&run).await.unwrap().unwrap();
        assert!(!stored.blue_green);
    }

    #[tokio::test]
    async fn test_missing_record_is_none() {
        let store = store().await;
        assert!(store.setup_record(&run()).await.unwrap().is_none());
        let weight: Option<TrafficWeightRecord> = store
            .get(&run(), &handoff_key(TRAFFIC_WEIGHT_PREFIX, "svc-1"))
            .await
            .unwrap();
        assert!(weight.is_none());
    }

    #[tokio::test]
    async fn test_put_overwrites_and_purge_clears() {
        let store = store().await;
        let run = run();
        let key = handoff_key(TRAFFIC_WEIGHT_PREFIX, &run.service_id);

        store
            .put(&run, &key, &TrafficWeightRecord { new_group_weight: 20 })
            .await
            .unwrap();
        store
            .put(&run, &key, &TrafficWeightRecord { new_group_weight: 60 })
            .await
            .unwrap();

        let weight: TrafficWeightRecord = store.get(&run, &key).await.unwrap().unwrap();
        assert_eq!(weight.new_group_weight, 60);

        assert_eq!(store.purge_run(&run).await.unwrap(), 1);
        let weight: Option<TrafficWeightRecord> = store.get(&run, &key).await.unwrap();
        assert!(weight.is_none());
    }
}
