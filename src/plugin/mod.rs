//! Policy plugin contract.
//!
//! A plugin owns the business rules of one policy type: it validates the
//! opaque policy body, proposes the transactions due in a cycle, and turns a
//! signature into a broadcast transaction. Concrete plugins live outside
//! this crate and are registered in a [`PluginRegistry`].

pub mod registry;

pub use registry::{PluginFactory, PluginRegistry};

use crate::error::PluginError;
use crate::types::{KeysignResponse, Policy, SignRequest};
use async_trait::async_trait;

#[async_trait]
pub trait Plugin: Send + Sync {
    /// Structural and business validation of the policy body, before it is stored.
    async fn validate_policy(&self, policy: &Policy) -> Result<(), PluginError>;

    /// Unsigned proposals for this cycle.
    ///
    /// When the policy's work is complete the plugin returns
    /// [`PluginError::NothingToDo`]; the pipeline then marks the policy done
    /// and creates no transaction record.
    async fn propose_transactions(&self, policy: &Policy) -> Result<Vec<SignRequest>, PluginError>;

    /// Check a proposal received from the counterpart against the policy.
    async fn validate_proposal(
        &self,
        policy: &Policy,
        request: &SignRequest,
    ) -> Result<(), PluginError> {
        if request.policy_id != policy.id {
            return Err(PluginError::InvalidPolicy(format!(
                "proposal is for policy {}, not {}",
                request.policy_id, policy.id
            )));
        }
        Ok(())
    }

    /// Assemble the signed transaction and submit it.
    ///
    /// `Ok` means the chain accepted the submission. Assembly and broadcast
    /// failures are reported as distinct variants.
    async fn signing_complete(
        &self,
        signature: &KeysignResponse,
        request: &SignRequest,
        policy: &Policy,
    ) -> Result<(), PluginError>;
}
