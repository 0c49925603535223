use std::{fmt, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use harvest_model::{DbTrigger, JobInstance, NewJobInstance, TriggerId, TriggerMetadata};
use serde_json::json;
use tracing::debug;

use super::{TriggerActionService, TriggerStore};
use crate::{
    clock::Clock,
    config::JobsConfig,
    cursor::ScanWindow,
    error::Result,
    jobs::JobInstanceStore,
};

pub const TRIGGER_ID_TAG: &str = "trigger_id";

/// Action service backed directly by the job and trigger stores.
#[derive(Clone)]
pub struct StoreTriggerActionService {
    jobs: Arc<dyn JobInstanceStore>,
    triggers: Arc<dyn TriggerStore>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for StoreTriggerActionService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreTriggerActionService")
            .field("jobs", &self.jobs)
            .field("triggers", &self.triggers)
            .finish()
    }
}

impl StoreTriggerActionService {
    pub fn new(
        jobs: Arc<dyn JobInstanceStore>,
        triggers: Arc<dyn TriggerStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            jobs,
            triggers,
            clock,
        }
    }
}

/// Job request for one scan window of `trigger`, using the configured
/// defaults for priority, attempts and timeout.
pub(crate) fn build_request(
    trigger: &DbTrigger,
    window: &ScanWindow,
    config: &JobsConfig,
    now: DateTime<Utc>,
) -> NewJobInstance {
    let mut tags = window.tags.to_tags();
    tags.insert(TRIGGER_ID_TAG.to_string(), trigger.id.to_string());

    NewJobInstance {
        job_definition_id: trigger.job_definition_id,
        controller_name: trigger.controller_name.clone(),
        definition_version: 1,
        priority: config.default_priority,
        attempt_max: config.default_attempt_max,
        timeout_in_minutes: config.default_timeout_minutes,
        scheduled_start_time: now,
        payload: json!({
            "trigger_id": trigger.id,
            "integration_key": trigger.integration_key,
            "tenant_id": trigger.tenant_id,
            "from": window.from,
            "to": window.to,
        }),
        tags,
    }
}

#[async_trait]
impl TriggerActionService for StoreTriggerActionService {
    async fn create_triggered_job(
        &self,
        trigger: &DbTrigger,
        partial: bool,
        mut request: NewJobInstance,
    ) -> Result<JobInstance> {
        request
            .tags
            .insert(harvest_model::scan::PARTIAL_TAG.to_string(), partial.to_string());
        request
            .tags
            .entry(TRIGGER_ID_TAG.to_string())
            .or_insert_with(|| trigger.id.to_string());

        let job = self.jobs.insert(request, self.clock.now()).await?;
        debug!(
            target: "harvest::trigger",
            trigger = %trigger.id,
            instance = %job.instance_id,
            partial,
            "triggered job created"
        );
        Ok(job)
    }

    async fn update_trigger_metadata(
        &self,
        id: TriggerId,
        expected: &TriggerMetadata,
        metadata: TriggerMetadata,
    ) -> Result<bool> {
        self.triggers
            .compare_and_swap_metadata(id, expected, metadata)
            .await
    }
}
