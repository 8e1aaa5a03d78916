// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fundamental types shared by the config-drive crates.
//!
//! This crate defines the basic identifiers and records that the core
//! library, the server, and the API surface all traffic in, so that each of
//! them can use those types (and implement their own conversions to/from
//! them) without any layering oddities.

use std::fmt::{self, Display};
use std::net::IpAddr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies a virtual machine instance.
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Debug,
    Serialize,
    Deserialize,
    JsonSchema,
)]
#[serde(transparent)]
pub struct InstanceId(pub Uuid);

impl InstanceId {
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifies a virtual network.
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Debug,
    Serialize,
    Deserialize,
    JsonSchema,
)]
#[serde(transparent)]
pub struct NetworkId(pub Uuid);

impl NetworkId {
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifies a NIC attachment point on an instance.
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Debug,
    Serialize,
    Deserialize,
    JsonSchema,
)]
#[serde(transparent)]
pub struct AttachmentId(pub Uuid);

impl AttachmentId {
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for AttachmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A monotonically increasing version number for an instance's drive (and
/// for durable records). Starts at 1.
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Debug,
    Serialize,
    Deserialize,
    JsonSchema,
)]
#[serde(transparent)]
pub struct Generation(u64);

impl Generation {
    pub const fn new() -> Self {
        Self(1)
    }

    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    pub const fn get(&self) -> u64 {
        self.0
    }
}

impl Default for Generation {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The power/lifecycle state of an instance, as reported by the
/// orchestration platform.
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    Debug,
    Serialize,
    Deserialize,
    JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    Running,
    Stopped,
    Destroyed,
    Expunged,
}

impl Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PowerState::Running => "running",
            PowerState::Stopped => "stopped",
            PowerState::Destroyed => "destroyed",
            PowerState::Expunged => "expunged",
        };
        f.write_str(s)
    }
}

/// A NIC binding an instance to a network at an IP. At most one attachment
/// per instance is the default; the config drive is served through the
/// default attachment's network path.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct NicAttachment {
    pub id: AttachmentId,
    pub network_id: NetworkId,
    pub ip: IpAddr,
    pub is_default: bool,
    /// Attachment order on the instance (eth0, eth1, ...).
    pub device_index: u8,
}

/// A NIC topology change reported by the orchestration platform.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum TopologyChange {
    /// A NIC was attached to the instance.
    Attached { nic: NicAttachment },
    /// A NIC was detached from the instance.
    Detached { id: AttachmentId },
    /// An existing NIC became the default attachment.
    PromotedToDefault { id: AttachmentId },
}

/// Instance state transitions that administrative callers may request.
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    Debug,
    Serialize,
    Deserialize,
    JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStateRequested {
    Start,
    Stop,
    Reboot,
    Migrate,
    Recover,
    Destroy,
}

/// Body of a request to register an instance with the config-drive service.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct InstanceEnsureBody {
    pub name: String,
    pub zone: String,
    pub availability_zone: String,
    /// Base64-encoded userdata payload, if any.
    pub user_data: Option<String>,
    pub ssh_public_key: Option<String>,
    /// Whether the instance's template supports password management.
    pub password_enabled: bool,
    pub nics: Vec<NicAttachment>,
}

/// Response to an instance registration.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct InstanceEnsureResponse {
    /// Version of the initial drive, or `None` if the build was deferred
    /// (provider disabled on the default attachment's network).
    pub version: Option<Generation>,
    /// The administrative password generated for a password-enabled
    /// instance. This is the same value the next drive read will carry.
    pub password: Option<String>,
}

/// Result of an operation that may have republished the drive.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct DriveVersionResponse {
    /// New drive version, or `None` if the rebuild was deferred.
    pub version: Option<Generation>,
}

/// Body of a userdata update.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct UserDataUpdateBody {
    /// Base64-encoded userdata payload.
    pub user_data: String,
}

/// Body of an ssh public key update.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct SshKeyUpdateBody {
    pub public_key: Option<String>,
}

/// Body of a template password-enablement change.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct TemplateUpdateBody {
    pub password_enabled: bool,
}

/// Response to a password reset.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct PasswordResetResponse {
    /// The new plaintext password. The next drive read for this instance
    /// embeds exactly this value.
    pub password: String,
    /// Version of the rebuilt drive, or `None` if the rebuild was deferred.
    pub version: Option<Generation>,
}

/// Body of a per-network provider enable/disable request.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct ProviderStateBody {
    pub enabled: bool,
}

/// A single file within a drive image, as reported to API callers.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct DriveFileDescription {
    pub name: String,
    pub size: u64,
}

/// The current drive image for an (instance, attachment) pair.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct DriveDescription {
    pub instance_id: InstanceId,
    pub attachment_id: AttachmentId,
    pub version: Generation,
    pub files: Vec<DriveFileDescription>,
    /// Base64-encoded FAT volume bytes.
    pub image: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_starts_at_one_and_increments() {
        let gen = Generation::new();
        assert_eq!(gen.get(), 1);
        assert_eq!(gen.next().get(), 2);
        assert!(gen < gen.next());
    }

    #[test]
    fn ids_serialize_as_plain_uuid_strings() {
        let id = InstanceId::new_v4();
        let ser = serde_json::to_string(&id).unwrap();
        assert_eq!(ser, format!("\"{}\"", id.0));
        let de: InstanceId = serde_json::from_str(&ser).unwrap();
        assert_eq!(de, id);
    }

    #[test]
    fn topology_change_round_trips() {
        let change = TopologyChange::PromotedToDefault {
            id: AttachmentId::new_v4(),
        };
        let ser = serde_json::to_string(&change).unwrap();
        assert!(ser.contains("promoted_to_default"));
        let de: TopologyChange = serde_json::from_str(&ser).unwrap();
        assert_eq!(de, change);
    }
}
