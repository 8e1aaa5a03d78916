// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Durable state for the config-drive service.
//!
//! Each instance has one JSON record under `<data_dir>/instances/`,
//! rewritten atomically (temp file + rename) after every applied event and
//! carrying a generation so stale writes are detectable. The record holds
//! the instance's inputs *and* the published drive's file set, so a
//! restarted service serves identical content at the same version without
//! consulting the password ledger. Per-network provider enablement lives in
//! `<data_dir>/networks.json`.

use std::collections::BTreeMap;
use std::io;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use slog::{warn, Logger};

use crate::instance::{DriveState, InstanceRecord};
use configdrive::content::{DriveFile, FileSet};
use configdrive::image::DriveImage;
use configdrive::ledger::PasswordState;
use configdrive_types::{
    AttachmentId, Generation, InstanceId, NetworkId, NicAttachment,
    PowerState,
};

const INSTANCES_DIR: &str = "instances";
const NETWORKS_FILE: &str = "networks.json";

/// A drive file with its payload carried as base64.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistedFile {
    pub name: String,
    pub data: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistedSealed {
    pub epoch: u64,
    pub files: Vec<PersistedFile>,
}

/// The published drive for an instance, persisted verbatim.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistedDrive {
    pub attachment_id: AttachmentId,
    pub version: Generation,
    pub files: Vec<PersistedFile>,
    pub password_epoch: Option<u64>,
    pub sealed: Option<PersistedSealed>,
    pub exposed_epoch: Option<u64>,
}

impl PersistedDrive {
    pub fn from_parts(
        image: &DriveImage,
        sealed: Option<(u64, FileSet)>,
        exposed_epoch: Option<u64>,
    ) -> Self {
        Self {
            attachment_id: image.attachment_id,
            version: image.version,
            files: encode_files(&image.files),
            password_epoch: image.password_epoch,
            sealed: sealed.map(|(epoch, files)| PersistedSealed {
                epoch,
                files: encode_files(&files),
            }),
            exposed_epoch,
        }
    }
}

/// One instance's full durable record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistedInstance {
    pub generation: Generation,
    pub id: InstanceId,
    pub name: String,
    pub zone: String,
    pub availability_zone: String,
    /// Base64-encoded userdata.
    pub user_data: String,
    pub ssh_public_key: Option<String>,
    pub password_enabled: bool,
    pub power: PowerState,
    pub drive_state: DriveState,
    pub rebuild_pending: bool,
    pub password: PasswordState,
    pub nics: Vec<NicAttachment>,
    pub drive: Option<PersistedDrive>,
}

impl PersistedInstance {
    pub fn new(
        generation: Generation,
        record: &InstanceRecord,
        password: PasswordState,
        nics: Vec<NicAttachment>,
        drive: Option<PersistedDrive>,
    ) -> Self {
        Self {
            generation,
            id: record.id,
            name: record.name.clone(),
            zone: record.zone.clone(),
            availability_zone: record.availability_zone.clone(),
            user_data: BASE64.encode(&record.user_data),
            ssh_public_key: record.ssh_public_key.clone(),
            password_enabled: record.password_enabled,
            power: record.power,
            drive_state: record.drive_state,
            rebuild_pending: record.rebuild_pending,
            password,
            nics,
            drive,
        }
    }

    /// Rebuilds the in-memory record from the durable one.
    pub fn to_record(&self) -> Result<InstanceRecord, base64::DecodeError> {
        Ok(InstanceRecord {
            id: self.id,
            name: self.name.clone(),
            zone: self.zone.clone(),
            availability_zone: self.availability_zone.clone(),
            user_data: BASE64.decode(&self.user_data)?,
            ssh_public_key: self.ssh_public_key.clone(),
            password_enabled: self.password_enabled,
            power: self.power,
            drive_state: self.drive_state,
            rebuild_pending: self.rebuild_pending,
        })
    }
}

pub fn encode_files(files: &FileSet) -> Vec<PersistedFile> {
    files
        .files()
        .iter()
        .map(|f| PersistedFile {
            name: f.name.clone(),
            data: BASE64.encode(&f.data),
        })
        .collect()
}

pub fn decode_files(
    files: &[PersistedFile],
) -> Result<FileSet, base64::DecodeError> {
    let files = files
        .iter()
        .map(|f| {
            Ok(DriveFile {
                name: f.name.clone(),
                data: BASE64.decode(&f.data)?,
            })
        })
        .collect::<Result<Vec<_>, base64::DecodeError>>()?;
    Ok(FileSet::new(files))
}

/// Filesystem layout for durable records.
pub struct StateDir {
    root: Utf8PathBuf,
    log: Logger,
}

impl StateDir {
    pub fn new(root: Utf8PathBuf, log: Logger) -> io::Result<Self> {
        std::fs::create_dir_all(root.join(INSTANCES_DIR))?;
        Ok(Self { root, log })
    }

    fn instance_path(&self, instance: InstanceId) -> Utf8PathBuf {
        self.root.join(INSTANCES_DIR).join(format!("{instance}.json"))
    }

    pub fn write_instance(
        &self,
        record: &PersistedInstance,
    ) -> io::Result<()> {
        let bytes = serde_json::to_vec_pretty(record)?;
        write_atomic(&self.instance_path(record.id), &bytes)
    }

    pub fn remove_instance(&self, instance: InstanceId) -> io::Result<()> {
        match std::fs::remove_file(self.instance_path(instance)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// Loads every readable instance record. Malformed records are logged
    /// and skipped rather than failing startup.
    pub fn load_instances(&self) -> io::Result<Vec<PersistedInstance>> {
        let mut records = Vec::new();
        for entry in std::fs::read_dir(self.root.join(INSTANCES_DIR))? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = std::fs::read(&path)?;
            match serde_json::from_slice::<PersistedInstance>(&bytes) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(self.log, "skipping malformed instance record";
                          "path" => %path.display(),
                          "error" => %e);
                }
            }
        }
        Ok(records)
    }

    pub fn write_networks(
        &self,
        providers: &BTreeMap<NetworkId, bool>,
    ) -> io::Result<()> {
        let bytes = serde_json::to_vec_pretty(providers)?;
        write_atomic(&self.root.join(NETWORKS_FILE), &bytes)
    }

    pub fn load_networks(&self) -> io::Result<BTreeMap<NetworkId, bool>> {
        let path = self.root.join(NETWORKS_FILE);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(BTreeMap::new())
            }
            Err(e) => return Err(e),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }
}

fn write_atomic(path: &Utf8PathBuf, bytes: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    fn state_dir() -> (tempfile::TempDir, StateDir) {
        let tmp = tempfile::tempdir().unwrap();
        let root =
            Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();
        let dir = StateDir::new(root, test_logger()).unwrap();
        (tmp, dir)
    }

    fn sample_record(id: InstanceId) -> PersistedInstance {
        PersistedInstance {
            generation: Generation::new(),
            id,
            name: "vm-one".to_string(),
            zone: "zone-1".to_string(),
            availability_zone: "az-1".to_string(),
            user_data: BASE64.encode(b"echo hi"),
            ssh_public_key: None,
            password_enabled: true,
            power: PowerState::Running,
            drive_state: DriveState::Attached,
            rebuild_pending: false,
            password: serde_json::from_value(serde_json::json!({
                "password_enabled": true,
                "current": "hunter2",
                "epoch": 1,
                "delivered": true,
            }))
            .unwrap(),
            nics: Vec::new(),
            drive: None,
        }
    }

    #[test]
    fn instance_records_round_trip() {
        let (_tmp, dir) = state_dir();
        let id = InstanceId::new_v4();
        dir.write_instance(&sample_record(id)).unwrap();

        let loaded = dir.load_instances().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, id);
        let record = loaded[0].to_record().unwrap();
        assert_eq!(record.user_data, b"echo hi");

        dir.remove_instance(id).unwrap();
        assert!(dir.load_instances().unwrap().is_empty());
        // Removing a missing record is not an error.
        dir.remove_instance(id).unwrap();
    }

    #[test]
    fn malformed_records_are_skipped() {
        let (_tmp, dir) = state_dir();
        let good = InstanceId::new_v4();
        dir.write_instance(&sample_record(good)).unwrap();
        std::fs::write(
            dir.root.join(INSTANCES_DIR).join("junk.json"),
            b"not json",
        )
        .unwrap();

        let loaded = dir.load_instances().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, good);
    }

    #[test]
    fn network_map_round_trips() {
        let (_tmp, dir) = state_dir();
        assert!(dir.load_networks().unwrap().is_empty());

        let mut providers = BTreeMap::new();
        providers.insert(NetworkId::new_v4(), false);
        providers.insert(NetworkId::new_v4(), true);
        dir.write_networks(&providers).unwrap();
        assert_eq!(dir.load_networks().unwrap(), providers);
    }

    #[test]
    fn drive_files_round_trip_through_base64() {
        let files = FileSet::new(vec![DriveFile {
            name: "user-data".to_string(),
            data: vec![0, 159, 146, 150],
        }]);
        let encoded = encode_files(&files);
        assert_eq!(decode_files(&encoded).unwrap(), files);
    }
}
