use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use harvest_model::{DbTrigger, TriggerId, TriggerMetadata};
use tokio::sync::Mutex;

use super::TriggerStore;
use crate::error::{HarvestError, Result};

#[derive(Clone, Default)]
pub struct InMemoryTriggerStore {
    triggers: Arc<Mutex<HashMap<TriggerId, DbTrigger>>>,
}

impl fmt::Debug for InMemoryTriggerStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self
            .triggers
            .try_lock()
            .map(|guard| guard.len())
            .unwrap_or_default();
        f.debug_struct("InMemoryTriggerStore")
            .field("triggers", &len)
            .finish()
    }
}

impl InMemoryTriggerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TriggerStore for InMemoryTriggerStore {
    async fn list_active(&self) -> Result<Vec<DbTrigger>> {
        let mut active: Vec<DbTrigger> = self
            .triggers
            .lock()
            .await
            .values()
            .filter(|trigger| trigger.enabled)
            .cloned()
            .collect();
        active.sort_by_key(|trigger| (trigger.created_at, trigger.id));
        Ok(active)
    }

    async fn get(&self, id: TriggerId) -> Result<Option<DbTrigger>> {
        Ok(self.triggers.lock().await.get(&id).cloned())
    }

    async fn save(&self, trigger: DbTrigger) -> Result<()> {
        self.triggers.lock().await.insert(trigger.id, trigger);
        Ok(())
    }

    async fn update_metadata(
        &self,
        id: TriggerId,
        metadata: TriggerMetadata,
    ) -> Result<()> {
        let mut triggers = self.triggers.lock().await;
        let trigger = triggers
            .get_mut(&id)
            .ok_or_else(|| HarvestError::NotFound(format!("trigger {id}")))?;
        trigger.metadata = metadata;
        Ok(())
    }

    async fn compare_and_swap_metadata(
        &self,
        id: TriggerId,
        expected: &TriggerMetadata,
        metadata: TriggerMetadata,
    ) -> Result<bool> {
        let mut triggers = self.triggers.lock().await;
        let trigger = triggers
            .get_mut(&id)
            .ok_or_else(|| HarvestError::NotFound(format!("trigger {id}")))?;
        if trigger.metadata != *expected {
            return Ok(false);
        }
        trigger.metadata = metadata;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use harvest_model::JobDefinitionId;

    use super::*;

    fn trigger(enabled: bool) -> DbTrigger {
        DbTrigger {
            id: TriggerId::new(),
            integration_key: "github".into(),
            trigger_type: "default".into(),
            tenant_id: "t".into(),
            job_definition_id: JobDefinitionId::new(),
            controller_name: "github".into(),
            created_at: Some(Utc::now()),
            enabled,
            metadata: TriggerMetadata::new(),
        }
    }

    #[tokio::test]
    async fn disabled_triggers_are_not_listed() {
        let store = InMemoryTriggerStore::new();
        let active = trigger(true);
        store.save(active.clone()).await.unwrap();
        store.save(trigger(false)).await.unwrap();

        let listed = store.list_active().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, active.id);
    }

    #[tokio::test]
    async fn metadata_update_requires_existing_trigger() {
        let store = InMemoryTriggerStore::new();
        let err = store
            .update_metadata(TriggerId::new(), TriggerMetadata::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HarvestError::NotFound(_)));
    }

    #[tokio::test]
    async fn metadata_swap_only_applies_to_the_expected_state() {
        let store = InMemoryTriggerStore::new();
        let original = trigger(true);
        store.save(original.clone()).await.unwrap();

        let mut advanced = TriggerMetadata::new();
        advanced.set_str("current_cursor", "2024-01-01T00:00:00Z");
        assert!(
            store
                .compare_and_swap_metadata(original.id, &original.metadata, advanced.clone())
                .await
                .unwrap()
        );

        // A second writer holding the stale view loses.
        let mut competing = TriggerMetadata::new();
        competing.set_str("current_cursor", "2023-01-01T00:00:00Z");
        assert!(
            !store
                .compare_and_swap_metadata(original.id, &original.metadata, competing)
                .await
                .unwrap()
        );
        assert_eq!(store.get(original.id).await.unwrap().unwrap().metadata, advanced);
    }
}
