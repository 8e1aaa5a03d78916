// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-instance lifecycle handling: the event queue that admits and orders
//! requests, and the state driver that applies them.

use serde::{Deserialize, Serialize};

use configdrive_types::{
    Generation, InstanceId, PowerState, TopologyChange,
};

pub mod request_queue;
pub mod state_driver;

/// Where an instance's drive is in its lifecycle.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum DriveState {
    /// No drive exists for the instance.
    Absent,
    /// The instance is registered but no drive has been published yet
    /// (e.g. the provider is disabled on its network).
    Provisioning,
    /// A drive is published and reachable through the default attachment.
    Attached,
    /// The drive is being torn down.
    Detaching,
}

/// A lifecycle or administrative event applied to one instance.
#[derive(Clone, Debug, strum::Display)]
pub enum LifecycleEvent {
    /// Initial registration build.
    Created,
    Start,
    Stop,
    Reboot,
    Recover,
    Migrate,
    Destroy,
    Expunge,
    /// Replace the instance's userdata with the supplied bytes.
    UserDataUpdated(Vec<u8>),
    /// Assign a fresh administrative password and expose it once.
    PasswordReset,
    /// Rotate (or clear) the instance's ssh public key.
    SshKeyUpdated(Option<String>),
    /// The instance's template changed password-enablement.
    TemplatePasswordEnabled(bool),
    /// A NIC topology change reported by the platform.
    Topology(TopologyChange),
    /// A guest read took the one-time password; recorded so the seal
    /// reaches the durable record.
    PasswordObserved { epoch: u64 },
}

impl LifecycleEvent {
    /// Whether this is an administrative update of the instance record
    /// (as opposed to a power/topology transition).
    pub fn is_admin_update(&self) -> bool {
        matches!(
            self,
            LifecycleEvent::UserDataUpdated(_)
                | LifecycleEvent::PasswordReset
                | LifecycleEvent::SshKeyUpdated(_)
                | LifecycleEvent::TemplatePasswordEnabled(_)
        )
    }
}

/// What applying an event did to the instance's drive.
#[derive(Clone, Debug)]
pub enum EventOutcome {
    /// A new drive version was published.
    Published(Generation),
    /// The change was accepted and persisted, but the rebuild was deferred
    /// (provider disabled on the default attachment's network).
    Deferred,
    /// No rebuild was required.
    Unchanged,
    /// A password reset completed; `version` is `None` when the rebuild
    /// was deferred.
    PasswordReset { password: String, version: Option<Generation> },
    /// The instance was expunged and its drive torn down.
    Removed,
}

/// The service's view of one instance, mutated only by its state driver.
#[derive(Clone, Debug)]
pub struct InstanceRecord {
    pub id: InstanceId,
    pub name: String,
    pub zone: String,
    pub availability_zone: String,
    pub user_data: Vec<u8>,
    pub ssh_public_key: Option<String>,
    pub password_enabled: bool,
    pub power: PowerState,
    pub drive_state: DriveState,
    /// An update was accepted while rebuilds were suppressed; the next
    /// lifecycle event rebuilds instead of republishing.
    pub rebuild_pending: bool,
}
