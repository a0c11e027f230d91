use crate::error::VaultError;
use crate::types::AccountId;

/// Single-manager authorization for privileged vault operations.
///
/// Hardening gap: the handoff is one step with no confirmation by the incoming
/// manager and no multi-party approval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessControl {
    manager: AccountId,
}

impl AccessControl {
    pub fn new(manager: AccountId) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &AccountId {
        &self.manager
    }

    pub fn ensure_manager(&self, caller: &AccountId) -> Result<(), VaultError> {
        if caller != &self.manager {
            return Err(VaultError::NotManager {
                caller: caller.clone(),
            });
        }
        Ok(())
    }

    /// Hand the role to `next`; returns the previous manager.
    pub(crate) fn transfer(
        &mut self,
        caller: &AccountId,
        next: AccountId,
    ) -> Result<AccountId, VaultError> {
        self.ensure_manager(caller)?;
        Ok(std::mem::replace(&mut self.manager, next))
    }
}
