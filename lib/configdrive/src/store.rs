// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Owns the published drive image for each instance.
//!
//! Images are immutable and versioned; publishing encodes the new volume
//! outside the lock and swaps it in atomically, so readers always observe
//! either the prior complete version or the new complete version. Only the
//! current version is retained — readers in flight keep their `Arc` alive.
//!
//! One-time password delivery is enforced here. A publish whose content
//! embeds a live password also carries the pre-built "sealed" sibling (the
//! same content with the sentinel in the password file). The first read
//! takes the plaintext image and atomically swaps the sealed sibling in, so
//! every later read sees the sentinel even with no intervening
//! administrative event. The exposed epoch is sticky per entry: a rebuild
//! that raced the first read and still carries the taken epoch has its
//! sealed sibling installed instead, so a plaintext is never re-published
//! after a guest has read it.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use slog::{info, Logger};
use thiserror::Error;

use crate::content::FileSet;
use crate::image::{self, DriveImage, ImageError};
use configdrive_types::{AttachmentId, Generation, InstanceId};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no drive has been published for instance {0}")]
    NotAttached(InstanceId),

    #[error(
        "attachment {0} no longer serves the config drive for instance {1}"
    )]
    StaleAttachment(AttachmentId, InstanceId),
}

/// A drive publish: the live file set, plus the sealed sibling when the
/// content embeds a one-time password.
pub struct PublishPayload {
    pub files: FileSet,
    pub exposure: Option<PasswordExposure>,
}

/// Accompanies a publish whose password file holds a live plaintext.
pub struct PasswordExposure {
    /// Ledger epoch of the embedded password.
    pub epoch: u64,
    /// The same content with the `saved_password` sentinel, swapped in when
    /// the plaintext is taken by a reader.
    pub sealed_files: FileSet,
}

/// Result of a guest read.
pub struct DriveRead {
    pub image: Arc<DriveImage>,
    /// Set when this read took the one-time plaintext; the caller reports
    /// the delivery to the password ledger.
    pub delivered_password_epoch: Option<u64>,
}

struct SealedSuccessor {
    files: FileSet,
    bytes: Vec<u8>,
    epoch: u64,
}

struct StoreEntry {
    attachment: AttachmentId,
    image: Arc<DriveImage>,
    sealed: Option<SealedSuccessor>,
    /// Epoch of a plaintext a reader has taken; sticky until a publish for
    /// a different epoch replaces the entry.
    exposed_epoch: Option<u64>,
}

/// Keyed registry of current drive images.
pub struct DriveStore {
    log: Logger,
    entries: Mutex<BTreeMap<InstanceId, StoreEntry>>,
}

impl DriveStore {
    pub fn new(log: Logger) -> Self {
        Self { log, entries: Mutex::new(BTreeMap::new()) }
    }

    /// Publishes a freshly built file set as the current image for
    /// `(instance, attachment)`, assigning the next version. All-or-
    /// nothing: an encoding failure leaves the previous version current.
    pub fn publish(
        &self,
        instance: InstanceId,
        attachment: AttachmentId,
        payload: PublishPayload,
    ) -> Result<Generation, ImageError> {
        let live_bytes = image::encode(&payload.files)?;
        let sealed = match payload.exposure {
            Some(exposure) => Some(SealedSuccessor {
                bytes: image::encode(&exposure.sealed_files)?,
                files: exposure.sealed_files,
                epoch: exposure.epoch,
            }),
            None => None,
        };

        let mut entries = self.entries.lock().unwrap();
        let prior = entries.get(&instance);
        let version = match prior {
            Some(entry) => entry.image.version.next(),
            None => Generation::new(),
        };
        let exposed_epoch = prior.and_then(|e| e.exposed_epoch);

        // If a reader already took the plaintext for this epoch while this
        // build was in flight, install the sealed variant directly.
        let entry = match sealed {
            Some(successor)
                if exposed_epoch == Some(successor.epoch) =>
            {
                StoreEntry {
                    attachment,
                    image: Arc::new(DriveImage {
                        instance_id: instance,
                        attachment_id: attachment,
                        version,
                        files: successor.files,
                        bytes: successor.bytes,
                        password_epoch: None,
                    }),
                    sealed: None,
                    exposed_epoch,
                }
            }
            sealed => StoreEntry {
                attachment,
                image: Arc::new(DriveImage {
                    instance_id: instance,
                    attachment_id: attachment,
                    version,
                    files: payload.files,
                    bytes: live_bytes,
                    password_epoch: sealed.as_ref().map(|s| s.epoch),
                }),
                sealed,
                exposed_epoch,
            },
        };

        info!(self.log, "published config drive";
              "instance" => %instance,
              "attachment" => %attachment,
              "version" => %version);
        entries.insert(instance, entry);
        Ok(version)
    }

    /// Re-publishes the current content verbatim under a fresh version,
    /// possibly at a new attachment point (start/reboot/migrate path). The
    /// volume bytes are byte-identical to the prior version's.
    pub fn republish(
        &self,
        instance: InstanceId,
        attachment: AttachmentId,
    ) -> Result<Generation, StoreError> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries
            .get_mut(&instance)
            .ok_or(StoreError::NotAttached(instance))?;
        let version = entry.image.version.next();
        entry.image = Arc::new(DriveImage {
            instance_id: instance,
            attachment_id: attachment,
            version,
            files: entry.image.files.clone(),
            bytes: entry.image.bytes.clone(),
            password_epoch: entry.image.password_epoch,
        });
        entry.attachment = attachment;
        info!(self.log, "republished config drive";
              "instance" => %instance,
              "attachment" => %attachment,
              "version" => %version);
        Ok(version)
    }

    /// The current image for a guest read. The first read of a
    /// plaintext-bearing image takes the plaintext and swaps the sealed
    /// sibling in for all subsequent readers.
    pub fn current(
        &self,
        instance: InstanceId,
        attachment: AttachmentId,
    ) -> Result<DriveRead, StoreError> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries
            .get_mut(&instance)
            .ok_or(StoreError::NotAttached(instance))?;
        if entry.attachment != attachment {
            return Err(StoreError::StaleAttachment(attachment, instance));
        }

        if let Some(successor) = entry.sealed.take() {
            let live = entry.image.clone();
            let epoch = successor.epoch;
            entry.image = Arc::new(DriveImage {
                instance_id: instance,
                attachment_id: entry.attachment,
                version: live.version.next(),
                files: successor.files,
                bytes: successor.bytes,
                password_epoch: None,
            });
            entry.exposed_epoch = Some(epoch);
            info!(self.log, "one-time password taken; drive sealed";
                  "instance" => %instance,
                  "version" => %entry.image.version);
            return Ok(DriveRead {
                image: live,
                delivered_password_epoch: Some(epoch),
            });
        }

        Ok(DriveRead {
            image: entry.image.clone(),
            delivered_password_epoch: None,
        })
    }

    /// The current image regardless of attachment, for the durable record.
    pub fn current_image(
        &self,
        instance: InstanceId,
    ) -> Option<Arc<DriveImage>> {
        self.entries
            .lock()
            .unwrap()
            .get(&instance)
            .map(|e| e.image.clone())
    }

    /// Sealed-successor state, for the durable record.
    pub fn sealed_state(
        &self,
        instance: InstanceId,
    ) -> Option<(Option<(u64, FileSet)>, Option<u64>)> {
        let entries = self.entries.lock().unwrap();
        entries.get(&instance).map(|e| {
            (
                e.sealed.as_ref().map(|s| (s.epoch, s.files.clone())),
                e.exposed_epoch,
            )
        })
    }

    /// Reinstates a persisted drive at its persisted version (service
    /// restart path). The ledger is not consulted; content and version are
    /// exactly what was persisted.
    pub fn restore(
        &self,
        instance: InstanceId,
        attachment: AttachmentId,
        files: FileSet,
        version: Generation,
        password_epoch: Option<u64>,
        sealed: Option<(u64, FileSet)>,
        exposed_epoch: Option<u64>,
    ) -> Result<(), ImageError> {
        let bytes = image::encode(&files)?;
        let sealed = match sealed {
            Some((epoch, files)) => Some(SealedSuccessor {
                bytes: image::encode(&files)?,
                files,
                epoch,
            }),
            None => None,
        };
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            instance,
            StoreEntry {
                attachment,
                image: Arc::new(DriveImage {
                    instance_id: instance,
                    attachment_id: attachment,
                    version,
                    files,
                    bytes,
                    password_epoch,
                }),
                sealed,
                exposed_epoch,
            },
        );
        Ok(())
    }

    pub fn remove(&self, instance: InstanceId) {
        self.entries.lock().unwrap().remove(&instance);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::{DriveFile, FileSet, PASSWORD_FILE};

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    fn plain_files(user_data: &str) -> FileSet {
        FileSet::new(vec![
            DriveFile {
                name: "user-data".to_string(),
                data: user_data.as_bytes().to_vec(),
            },
            DriveFile {
                name: PASSWORD_FILE.to_string(),
                data: b"saved_password\n".to_vec(),
            },
        ])
    }

    fn exposed_payload(password: &str, epoch: u64) -> PublishPayload {
        let live = FileSet::new(vec![DriveFile {
            name: PASSWORD_FILE.to_string(),
            data: format!("{password}\n").into_bytes(),
        }]);
        let sealed = FileSet::new(vec![DriveFile {
            name: PASSWORD_FILE.to_string(),
            data: b"saved_password\n".to_vec(),
        }]);
        PublishPayload {
            files: live,
            exposure: Some(PasswordExposure { epoch, sealed_files: sealed }),
        }
    }

    #[test]
    fn publish_then_read() {
        let store = DriveStore::new(test_logger());
        let instance = InstanceId::new_v4();
        let attachment = AttachmentId::new_v4();

        let v1 = store
            .publish(
                instance,
                attachment,
                PublishPayload { files: plain_files("v1"), exposure: None },
            )
            .unwrap();
        assert_eq!(v1, Generation::new());

        let read = store.current(instance, attachment).unwrap();
        assert_eq!(read.image.version, v1);
        assert!(read.delivered_password_epoch.is_none());
        assert_eq!(
            read.image.files.get("user-data").unwrap().data,
            b"v1"
        );
    }

    #[test]
    fn versions_strictly_increase() {
        let store = DriveStore::new(test_logger());
        let instance = InstanceId::new_v4();
        let attachment = AttachmentId::new_v4();
        let mut last = None;
        for i in 0..3 {
            let v = store
                .publish(
                    instance,
                    attachment,
                    PublishPayload {
                        files: plain_files(&format!("v{i}")),
                        exposure: None,
                    },
                )
                .unwrap();
            if let Some(prev) = last {
                assert!(v > prev);
            }
            last = Some(v);
        }
    }

    #[test]
    fn reads_against_a_displaced_attachment_go_stale() {
        let store = DriveStore::new(test_logger());
        let instance = InstanceId::new_v4();
        let old = AttachmentId::new_v4();
        let new = AttachmentId::new_v4();

        store
            .publish(
                instance,
                old,
                PublishPayload { files: plain_files("v1"), exposure: None },
            )
            .unwrap();
        store
            .publish(
                instance,
                new,
                PublishPayload { files: plain_files("v2"), exposure: None },
            )
            .unwrap();

        assert!(store.current(instance, new).is_ok());
        assert!(matches!(
            store.current(instance, old),
            Err(StoreError::StaleAttachment(..))
        ));
        assert!(matches!(
            store.current(InstanceId::new_v4(), new),
            Err(StoreError::NotAttached(_))
        ));
    }

    #[test]
    fn republish_is_byte_identical() {
        let store = DriveStore::new(test_logger());
        let instance = InstanceId::new_v4();
        let attachment = AttachmentId::new_v4();

        let v1 = store
            .publish(
                instance,
                attachment,
                PublishPayload { files: plain_files("v1"), exposure: None },
            )
            .unwrap();
        let before = store.current(instance, attachment).unwrap().image;

        let v2 = store.republish(instance, attachment).unwrap();
        assert!(v2 > v1);
        let after = store.current(instance, attachment).unwrap().image;
        assert_eq!(after.bytes, before.bytes);
        assert_eq!(after.version, v2);
    }

    #[test]
    fn first_read_takes_the_plaintext_and_seals() {
        let store = DriveStore::new(test_logger());
        let instance = InstanceId::new_v4();
        let attachment = AttachmentId::new_v4();

        let v1 = store
            .publish(instance, attachment, exposed_payload("hunter2", 1))
            .unwrap();

        let first = store.current(instance, attachment).unwrap();
        assert_eq!(first.delivered_password_epoch, Some(1));
        assert_eq!(first.image.version, v1);
        assert_eq!(
            first.image.files.get(PASSWORD_FILE).unwrap().data,
            b"hunter2\n"
        );

        let second = store.current(instance, attachment).unwrap();
        assert!(second.delivered_password_epoch.is_none());
        assert!(second.image.version > v1);
        assert_eq!(
            second.image.files.get(PASSWORD_FILE).unwrap().data,
            b"saved_password\n"
        );
    }

    #[test]
    fn racing_rebuild_cannot_republish_a_taken_plaintext() {
        let store = DriveStore::new(test_logger());
        let instance = InstanceId::new_v4();
        let attachment = AttachmentId::new_v4();

        store
            .publish(instance, attachment, exposed_payload("hunter2", 1))
            .unwrap();
        // A guest read takes the plaintext for epoch 1.
        let read = store.current(instance, attachment).unwrap();
        assert_eq!(read.delivered_password_epoch, Some(1));

        // A rebuild that was computed before the read completes still
        // carries the epoch-1 plaintext; the store installs its sealed
        // sibling instead.
        store
            .publish(instance, attachment, exposed_payload("hunter2", 1))
            .unwrap();
        let after = store.current(instance, attachment).unwrap();
        assert!(after.delivered_password_epoch.is_none());
        assert_eq!(
            after.image.files.get(PASSWORD_FILE).unwrap().data,
            b"saved_password\n"
        );

        // A genuine reset (new epoch) exposes normally.
        store
            .publish(instance, attachment, exposed_payload("new-pass", 2))
            .unwrap();
        let reset_read = store.current(instance, attachment).unwrap();
        assert_eq!(reset_read.delivered_password_epoch, Some(2));
        assert_eq!(
            reset_read.image.files.get(PASSWORD_FILE).unwrap().data,
            b"new-pass\n"
        );
    }

    #[test]
    fn restore_reinstates_version_and_content() {
        let store = DriveStore::new(test_logger());
        let instance = InstanceId::new_v4();
        let attachment = AttachmentId::new_v4();
        let version = Generation::new().next().next();

        store
            .restore(
                instance,
                attachment,
                plain_files("restored"),
                version,
                None,
                None,
                Some(3),
            )
            .unwrap();
        let read = store.current(instance, attachment).unwrap();
        assert_eq!(read.image.version, version);
        assert_eq!(
            read.image.files.get("user-data").unwrap().data,
            b"restored"
        );
    }
}
