// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Resolves which NIC attachment serves an instance's config drive.
//!
//! A multi-NIC instance serves its drive through exactly one attachment at
//! a time: the default. Topology changes from the orchestration platform
//! (attach, detach, promote) update the authoritative attachment here; the
//! lifecycle driver reacts to the reported outcome by rebuilding on the new
//! default and letting the old attachment's reads go stale.

use std::collections::BTreeMap;
use std::sync::Mutex;

use thiserror::Error;

use configdrive_types::{
    AttachmentId, InstanceId, NicAttachment, TopologyChange,
};

#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("instance {0} is not registered with the attachment resolver")]
    UnknownInstance(InstanceId),

    #[error("instance {0} has no default attachment")]
    NoAttachment(InstanceId),

    #[error("attachment {0} is not attached to instance {1}")]
    UnknownAttachment(AttachmentId, InstanceId),

    #[error("attachment {0} is already attached to instance {1}")]
    DuplicateAttachment(AttachmentId, InstanceId),

    #[error("instance {0} has more than one attachment marked default")]
    AmbiguousDefault(InstanceId),
}

/// What a topology change did to the authoritative attachment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TopologyOutcome {
    /// The default moved. The drive must be rebuilt on `new_default`; the
    /// displaced attachment (if any) no longer serves it.
    DefaultChanged {
        new_default: NicAttachment,
        displaced: Option<AttachmentId>,
    },
    /// The default attachment is unaffected.
    Unchanged,
}

/// Keyed registry of per-instance NIC attachments.
#[derive(Default)]
pub struct AttachmentResolver {
    entries: Mutex<BTreeMap<InstanceId, Vec<NicAttachment>>>,
}

impl AttachmentResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an instance's initial NIC set. Exactly one attachment may
    /// be marked default; when none is, the lowest-ordered attachment is
    /// promoted.
    pub fn register(
        &self,
        instance: InstanceId,
        mut nics: Vec<NicAttachment>,
    ) -> Result<(), ResolverError> {
        let defaults = nics.iter().filter(|n| n.is_default).count();
        if defaults > 1 {
            return Err(ResolverError::AmbiguousDefault(instance));
        }
        if defaults == 0 && !nics.is_empty() {
            let lowest = nics
                .iter()
                .enumerate()
                .min_by_key(|(_, n)| n.device_index)
                .map(|(i, _)| i)
                .unwrap();
            nics[lowest].is_default = true;
        }
        self.entries.lock().unwrap().insert(instance, nics);
        Ok(())
    }

    pub fn remove_instance(&self, instance: InstanceId) {
        self.entries.lock().unwrap().remove(&instance);
    }

    /// The attachment currently serving the drive.
    pub fn resolve_default(
        &self,
        instance: InstanceId,
    ) -> Result<NicAttachment, ResolverError> {
        let entries = self.entries.lock().unwrap();
        let nics = entries
            .get(&instance)
            .ok_or(ResolverError::UnknownInstance(instance))?;
        nics.iter()
            .find(|n| n.is_default)
            .cloned()
            .ok_or(ResolverError::NoAttachment(instance))
    }

    /// Applies a topology change and reports what happened to the default.
    pub fn apply(
        &self,
        instance: InstanceId,
        change: &TopologyChange,
    ) -> Result<TopologyOutcome, ResolverError> {
        let mut entries = self.entries.lock().unwrap();
        let nics = entries
            .get_mut(&instance)
            .ok_or(ResolverError::UnknownInstance(instance))?;

        match change {
            TopologyChange::Attached { nic } => {
                if nics.iter().any(|n| n.id == nic.id) {
                    return Err(ResolverError::DuplicateAttachment(
                        nic.id, instance,
                    ));
                }
                let mut nic = nic.clone();
                if nics.is_empty() {
                    nic.is_default = true;
                }
                if nic.is_default {
                    let displaced = demote_default(nics);
                    nics.push(nic.clone());
                    Ok(TopologyOutcome::DefaultChanged {
                        new_default: nic,
                        displaced,
                    })
                } else {
                    nics.push(nic);
                    Ok(TopologyOutcome::Unchanged)
                }
            }

            TopologyChange::Detached { id } => {
                let pos = nics
                    .iter()
                    .position(|n| n.id == *id)
                    .ok_or(ResolverError::UnknownAttachment(*id, instance))?;
                if !nics[pos].is_default {
                    nics.remove(pos);
                    return Ok(TopologyOutcome::Unchanged);
                }
                // The default is redefined, never deleted and left absent:
                // promote the lowest-ordered survivor before detaching.
                if nics.len() == 1 {
                    return Err(ResolverError::NoAttachment(instance));
                }
                let removed = nics.remove(pos);
                let lowest = nics
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, n)| n.device_index)
                    .map(|(i, _)| i)
                    .unwrap();
                nics[lowest].is_default = true;
                Ok(TopologyOutcome::DefaultChanged {
                    new_default: nics[lowest].clone(),
                    displaced: Some(removed.id),
                })
            }

            TopologyChange::PromotedToDefault { id } => {
                let pos = nics
                    .iter()
                    .position(|n| n.id == *id)
                    .ok_or(ResolverError::UnknownAttachment(*id, instance))?;
                if nics[pos].is_default {
                    return Ok(TopologyOutcome::Unchanged);
                }
                let displaced = demote_default(nics);
                nics[pos].is_default = true;
                Ok(TopologyOutcome::DefaultChanged {
                    new_default: nics[pos].clone(),
                    displaced,
                })
            }
        }
    }

    /// Current NIC set, for the durable record.
    pub fn snapshot(
        &self,
        instance: InstanceId,
    ) -> Result<Vec<NicAttachment>, ResolverError> {
        let entries = self.entries.lock().unwrap();
        entries
            .get(&instance)
            .cloned()
            .ok_or(ResolverError::UnknownInstance(instance))
    }
}

fn demote_default(nics: &mut [NicAttachment]) -> Option<AttachmentId> {
    for nic in nics.iter_mut() {
        if nic.is_default {
            nic.is_default = false;
            return Some(nic.id);
        }
    }
    None
}
