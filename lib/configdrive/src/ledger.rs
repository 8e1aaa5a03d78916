// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tracks one-time delivery of administrative passwords.
//!
//! Each password-enabled instance carries a current password and a
//! `delivered` flag. Drive rebuilds read the current delivery value without
//! changing any state; the flag flips when the first guest read takes a
//! plaintext-bearing image (see [`crate::store`]), and every build after
//! that embeds the `saved_password` sentinel until the next reset.
//!
//! Delivery epochs make the flip race-free: every reset (or re-arm) bumps
//! the epoch, and [`PasswordLedger::mark_delivered`] only flips the flag for
//! the epoch the reader actually took, so a reset racing a read can never
//! have its fresh password swallowed by a stale delivery.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use configdrive_types::InstanceId;

/// Sentinel served once the current password has been retrieved.
pub const SAVED_PASSWORD: &str = "saved_password";

/// Sentinel served when the instance's template is not password-enabled.
pub const PASSWORD_NOT_APPLICABLE: &str = "not_applicable";

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("instance {0} is not registered with the password ledger")]
    UnknownInstance(InstanceId),

    #[error("instance {0}'s template is not password-enabled")]
    NotPasswordEnabled(InstanceId),
}

/// The value a drive build embeds in the password file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeliveryValue {
    /// The live password, not yet retrieved by the guest. The epoch
    /// identifies which arming of the ledger this value belongs to.
    Plaintext { value: String, epoch: u64 },
    /// The current password was already retrieved.
    Saved,
    /// The template does not support passwords.
    NotApplicable,
}

impl DeliveryValue {
    /// The single-line rendering embedded in the drive's password file.
    pub fn render(&self) -> &str {
        match self {
            DeliveryValue::Plaintext { value, .. } => value,
            DeliveryValue::Saved => SAVED_PASSWORD,
            DeliveryValue::NotApplicable => PASSWORD_NOT_APPLICABLE,
        }
    }
}

/// Per-instance password delivery state. Serializable so it can ride along
/// in the instance's durable record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordState {
    password_enabled: bool,
    current: Option<String>,
    epoch: u64,
    delivered: bool,
}

impl PasswordState {
    fn new(password_enabled: bool) -> Self {
        Self { password_enabled, current: None, epoch: 0, delivered: false }
    }

    fn delivery_value(&self) -> DeliveryValue {
        if !self.password_enabled {
            return DeliveryValue::NotApplicable;
        }
        match &self.current {
            Some(value) if !self.delivered => DeliveryValue::Plaintext {
                value: value.clone(),
                epoch: self.epoch,
            },
            _ => DeliveryValue::Saved,
        }
    }
}

/// Keyed registry of per-instance password state.
#[derive(Default)]
pub struct PasswordLedger {
    entries: Mutex<BTreeMap<InstanceId, PasswordState>>,
}

impl PasswordLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an instance with the given template mode.
    pub fn register(&self, instance: InstanceId, password_enabled: bool) {
        self.entries
            .lock()
            .unwrap()
            .insert(instance, PasswordState::new(password_enabled));
    }

    /// Reinstates a persisted state (service restart path).
    pub fn restore(&self, instance: InstanceId, state: PasswordState) {
        self.entries.lock().unwrap().insert(instance, state);
    }

    pub fn remove(&self, instance: InstanceId) {
        self.entries.lock().unwrap().remove(&instance);
    }

    /// Assigns a new password and arms delivery under a fresh epoch.
    pub fn set_password(
        &self,
        instance: InstanceId,
        plaintext: String,
    ) -> Result<(), LedgerError> {
        let mut entries = self.entries.lock().unwrap();
        let state = entries
            .get_mut(&instance)
            .ok_or(LedgerError::UnknownInstance(instance))?;
        if !state.password_enabled {
            return Err(LedgerError::NotPasswordEnabled(instance));
        }
        state.current = Some(plaintext);
        state.epoch += 1;
        state.delivered = false;
        Ok(())
    }

    /// The value the next drive build should embed. Pure read; delivery
    /// state only changes through [`Self::mark_delivered`].
    pub fn delivery_value(
        &self,
        instance: InstanceId,
    ) -> Result<DeliveryValue, LedgerError> {
        let entries = self.entries.lock().unwrap();
        let state = entries
            .get(&instance)
            .ok_or(LedgerError::UnknownInstance(instance))?;
        Ok(state.delivery_value())
    }

    /// Records that the plaintext for `epoch` was handed to a guest reader.
    /// Idempotent; a stale epoch (an intervening reset) is a no-op. Returns
    /// whether the flag flipped.
    pub fn mark_delivered(
        &self,
        instance: InstanceId,
        epoch: u64,
    ) -> Result<bool, LedgerError> {
        let mut entries = self.entries.lock().unwrap();
        let state = entries
            .get_mut(&instance)
            .ok_or(LedgerError::UnknownInstance(instance))?;
        if state.epoch == epoch && !state.delivered {
            state.delivered = true;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Re-arms delivery of the retained current password under a new epoch.
    /// Used by ssh-key rotation; a no-op when no password is set or the
    /// template is not password-enabled.
    pub fn re_arm(&self, instance: InstanceId) -> Result<(), LedgerError> {
        let mut entries = self.entries.lock().unwrap();
        let state = entries
            .get_mut(&instance)
            .ok_or(LedgerError::UnknownInstance(instance))?;
        if state.password_enabled && state.current.is_some() {
            state.epoch += 1;
            state.delivered = false;
        }
        Ok(())
    }

    /// Changes the template mode. Disabling password support discards the
    /// stored password; this is a template/offering change, not a reset.
    pub fn set_mode(
        &self,
        instance: InstanceId,
        password_enabled: bool,
    ) -> Result<(), LedgerError> {
        let mut entries = self.entries.lock().unwrap();
        let state = entries
            .get_mut(&instance)
            .ok_or(LedgerError::UnknownInstance(instance))?;
        state.password_enabled = password_enabled;
        if !password_enabled {
            state.current = None;
            state.delivered = false;
        }
        Ok(())
    }

    /// Current state, for the durable record.
    pub fn snapshot(
        &self,
        instance: InstanceId,
    ) -> Result<PasswordState, LedgerError> {
        let entries = self.entries.lock().unwrap();
        entries
            .get(&instance)
            .cloned()
            .ok_or(LedgerError::UnknownInstance(instance))
    }
}
