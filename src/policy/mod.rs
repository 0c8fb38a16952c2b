//! Policy lifecycle: signed create, update and delete, each paired with its
//! trigger in one local transaction and replicated afterwards.

pub mod signature;

pub use signature::verify_policy_signature;

use crate::error::PolicyError;
use crate::plugin::PluginRegistry;
use crate::scheduler::{create_time_trigger, trigger_from_policy, update_time_trigger};
use crate::state::{policies, transactions, triggers, SharedDb};
use crate::sync::PolicySyncer;
use crate::types::Policy;
use std::sync::Arc;
use tracing::{info, warn};

pub struct PolicyService {
    db: SharedDb,
    plugins: PluginRegistry,
    syncer: Arc<dyn PolicySyncer>,
}

impl PolicyService {
    pub fn new(db: SharedDb, plugins: PluginRegistry, syncer: Arc<dyn PolicySyncer>) -> Self {
        Self {
            db,
            plugins,
            syncer,
        }
    }

    /// Store a new policy and its trigger, then replicate it.
    pub async fn create_policy(&self, policy: Policy) -> Result<Policy, PolicyError> {
        self.validate(&policy).await?;

        {
            let db = self.db.lock().await;
            if policies::get(db.conn(), &policy.id)?.is_some() {
                return Err(PolicyError::Invalid(format!("policy {} already exists", policy.id)));
            }
            db.with_transaction(|tx| {
                policies::insert(tx, &policy)?;
                create_time_trigger(tx, &policy)?;
                Ok(())
            })?;
        }
        info!(policy_id = %policy.id, plugin_type = %policy.plugin_type, "Policy created");

        if let Err(e) = self.syncer.create_policy(&policy).await {
            warn!(policy_id = %policy.id, "Failed to sync created policy: {e}");
        }
        Ok(policy)
    }

    /// Replace a policy and reschedule its trigger, then replicate it.
    pub async fn update_policy(&self, policy: Policy) -> Result<Policy, PolicyError> {
        self.validate(&policy).await?;

        {
            let db = self.db.lock().await;
            if policies::get(db.conn(), &policy.id)?.is_none() {
                return Err(PolicyError::NotFound(policy.id.clone()));
            }
            db.with_transaction(|tx| {
                policies::update(tx, &policy)?;
                update_time_trigger(tx, &policy)?;
                Ok(())
            })?;
        }
        info!(policy_id = %policy.id, "Policy updated");

        if let Err(e) = self.syncer.update_policy(&policy).await {
            warn!(policy_id = %policy.id, "Failed to sync updated policy: {e}");
        }
        Ok(policy)
    }

    /// Delete a policy with its trigger and history. `signature` must be a
    /// valid owner signature over the stored policy.
    pub async fn delete_policy(&self, policy_id: &str, signature: &str) -> Result<(), PolicyError> {
        {
            let db = self.db.lock().await;
            let mut stored = policies::get(db.conn(), policy_id)?
                .ok_or_else(|| PolicyError::NotFound(policy_id.to_string()))?;
            stored.signature = signature.to_string();
            verify_policy_signature(&stored)
                .map_err(|e| PolicyError::InvalidSignature(format!("{e:#}")))?;

            db.with_transaction(|tx| {
                let history = transactions::delete_by_policy(tx, policy_id)?;
                triggers::delete(tx, policy_id)?;
                policies::delete(tx, policy_id)?;
                info!(policy_id, history, "Policy deleted");
                Ok(())
            })?;
        }

        if let Err(e) = self.syncer.delete_policy(policy_id, signature).await {
            warn!(policy_id, "Failed to sync policy deletion: {e}");
        }
        Ok(())
    }

    pub async fn get_policy(&self, policy_id: &str) -> Result<Policy, PolicyError> {
        let db = self.db.lock().await;
        policies::get(db.conn(), policy_id)?.ok_or_else(|| PolicyError::NotFound(policy_id.to_string()))
    }

    /// Signature, plugin rules and schedule, in that order.
    async fn validate(&self, policy: &Policy) -> Result<(), PolicyError> {
        verify_policy_signature(policy).map_err(|e| PolicyError::InvalidSignature(format!("{e:#}")))?;

        let plugin = self
            .plugins
            .resolve(&policy.plugin_type)
            .map_err(|e| PolicyError::Invalid(e.to_string()))?;
        plugin
            .validate_policy(policy)
            .await
            .map_err(|e| PolicyError::Invalid(e.to_string()))?;

        trigger_from_policy(policy).map_err(|e| PolicyError::Invalid(e.to_string()))?;
        Ok(())
    }
}
