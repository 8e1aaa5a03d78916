// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Builds the file set embedded in a config drive.
//!
//! This is a pure transformation from an instance's current inputs to the
//! ordered set of named files the volume carries. All password state is
//! passed in as an already-fetched [`DeliveryValue`]; the lifecycle driver
//! is the only place that consults the ledger.

use std::net::IpAddr;

use serde::Serialize;
use thiserror::Error;

use crate::ledger::DeliveryValue;
use configdrive_types::{InstanceId, NetworkId, NicAttachment};

/// Upper bound on userdata carried by the drive.
pub const MAX_USER_DATA_BYTES: usize = 32 * 1024;

pub const META_DATA_FILE: &str = "meta-data";
pub const USER_DATA_FILE: &str = "user-data";
pub const PASSWORD_FILE: &str = "vm-password";
pub const NETWORK_CONFIG_FILE: &str = "network-config";
pub const PUBLIC_KEYS_FILE: &str = "public-keys";

#[derive(Debug, Error)]
pub enum ContentError {
    #[error(
        "userdata is {0} bytes, exceeding the {MAX_USER_DATA_BYTES}-byte \
        capacity of the drive"
    )]
    InvalidUserData(usize),

    #[error("failed to serialize instance metadata: {0}")]
    Metadata(#[from] serde_json::Error),
}

/// A single named file destined for the drive volume.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DriveFile {
    pub name: String,
    pub data: Vec<u8>,
}

/// The ordered set of files a drive build produced.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FileSet(Vec<DriveFile>);

impl FileSet {
    pub fn new(files: Vec<DriveFile>) -> Self {
        Self(files)
    }

    pub fn files(&self) -> &[DriveFile] {
        &self.0
    }

    pub fn get(&self, name: &str) -> Option<&DriveFile> {
        self.0.iter().find(|f| f.name == name)
    }

    /// Total payload bytes across all files.
    pub fn payload_len(&self) -> usize {
        self.0.iter().map(|f| f.data.len()).sum()
    }
}

/// Inputs to a drive build.
pub struct ContentInput<'a> {
    pub instance_id: InstanceId,
    pub instance_name: &'a str,
    pub zone: &'a str,
    pub availability_zone: &'a str,
    /// The default attachment the drive is served through.
    pub nic: &'a NicAttachment,
    pub user_data: &'a [u8],
    pub delivery: &'a DeliveryValue,
    pub ssh_public_key: Option<&'a str>,
}

// cloud-init metadata is YAML, but YAML is a strict superset of JSON.
#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct MetaData<'a> {
    instance_id: InstanceId,
    local_hostname: &'a str,
    zone: &'a str,
    availability_zone: &'a str,
    network_id: NetworkId,
    local_ip: IpAddr,
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct NetworkConfig {
    network_id: NetworkId,
    ip_address: IpAddr,
    device_index: u8,
}

/// Validates a userdata payload against the drive's capacity. Called both
/// by [`build_file_set`] and by the update path, so an oversize update is
/// rejected even when the rebuild itself is deferred.
pub fn validate_user_data(user_data: &[u8]) -> Result<(), ContentError> {
    if user_data.len() > MAX_USER_DATA_BYTES {
        return Err(ContentError::InvalidUserData(user_data.len()));
    }
    Ok(())
}

/// Builds the ordered file set for a drive.
///
/// The userdata file is always present (empty when none was supplied); the
/// public-keys file is absent when the instance has no key. Userdata is
/// validated before anything else so the caller can fetch password state
/// only for builds that will be accepted.
pub fn build_file_set(
    input: &ContentInput<'_>,
) -> Result<FileSet, ContentError> {
    validate_user_data(input.user_data)?;

    let meta_data = serde_json::to_vec(&MetaData {
        instance_id: input.instance_id,
        local_hostname: input.instance_name,
        zone: input.zone,
        availability_zone: input.availability_zone,
        network_id: input.nic.network_id,
        local_ip: input.nic.ip,
    })?;

    let network_config = serde_json::to_vec(&NetworkConfig {
        network_id: input.nic.network_id,
        ip_address: input.nic.ip,
        device_index: input.nic.device_index,
    })?;

    let mut files = vec![
        DriveFile { name: META_DATA_FILE.to_string(), data: meta_data },
        DriveFile {
            name: USER_DATA_FILE.to_string(),
            data: input.user_data.to_vec(),
        },
        DriveFile {
            name: PASSWORD_FILE.to_string(),
            data: format!("{}\n", input.delivery.render()).into_bytes(),
        },
        DriveFile {
            name: NETWORK_CONFIG_FILE.to_string(),
            data: network_config,
        },
    ];

    if let Some(key) = input.ssh_public_key {
        files.push(DriveFile {
            name: PUBLIC_KEYS_FILE.to_string(),
            data: format!("{key}\n").into_bytes(),
        });
    }

    Ok(FileSet::new(files))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    use configdrive_types::AttachmentId;

    fn test_nic() -> NicAttachment {
        NicAttachment {
            id: AttachmentId::new_v4(),
            network_id: NetworkId::new_v4(),
            ip: IpAddr::V4(Ipv4Addr::new(10, 1, 1, 4)),
            is_default: true,
            device_index: 0,
        }
    }

    fn test_input<'a>(
        nic: &'a NicAttachment,
        user_data: &'a [u8],
        delivery: &'a DeliveryValue,
    ) -> ContentInput<'a> {
        ContentInput {
            instance_id: InstanceId::new_v4(),
            instance_name: "vm-one",
            zone: "zone-1",
            availability_zone: "az-1",
            nic,
            user_data,
            delivery,
            ssh_public_key: None,
        }
    }

    #[test]
    fn file_set_carries_expected_files_in_order() {
        let nic = test_nic();
        let delivery = DeliveryValue::Saved;
        let mut input = test_input(&nic, b"echo hi", &delivery);
        input.ssh_public_key = Some("ssh-ed25519 AAAA test@host");

        let files = build_file_set(&input).unwrap();
        let names: Vec<&str> =
            files.files().iter().map(|f| f.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                META_DATA_FILE,
                USER_DATA_FILE,
                PASSWORD_FILE,
                NETWORK_CONFIG_FILE,
                PUBLIC_KEYS_FILE,
            ]
        );
        assert_eq!(files.get(USER_DATA_FILE).unwrap().data, b"echo hi");
        assert_eq!(
            files.get(PUBLIC_KEYS_FILE).unwrap().data,
            b"ssh-ed25519 AAAA test@host\n"
        );
    }

    #[test]
    fn userdata_file_is_present_even_when_empty() {
        let nic = test_nic();
        let delivery = DeliveryValue::NotApplicable;
        let input = test_input(&nic, b"", &delivery);
        let files = build_file_set(&input).unwrap();
        assert_eq!(files.get(USER_DATA_FILE).unwrap().data, b"");
        assert!(files.get(PUBLIC_KEYS_FILE).is_none());
    }

    #[test]
    fn password_file_is_a_single_line() {
        let nic = test_nic();
        let delivery = DeliveryValue::Plaintext {
            value: "fV3dsa9q".to_string(),
            epoch: 1,
        };
        let input = test_input(&nic, b"", &delivery);
        let files = build_file_set(&input).unwrap();
        assert_eq!(files.get(PASSWORD_FILE).unwrap().data, b"fV3dsa9q\n");

        let sentinel = DeliveryValue::Saved;
        let input = test_input(&nic, b"", &sentinel);
        let files = build_file_set(&input).unwrap();
        assert_eq!(
            files.get(PASSWORD_FILE).unwrap().data,
            b"saved_password\n"
        );
    }

    #[test]
    fn metadata_names_the_default_attachment() {
        let nic = test_nic();
        let delivery = DeliveryValue::Saved;
        let input = test_input(&nic, b"", &delivery);
        let files = build_file_set(&input).unwrap();
        let meta: serde_json::Value =
            serde_json::from_slice(&files.get(META_DATA_FILE).unwrap().data)
                .unwrap();
        assert_eq!(meta["local-hostname"], "vm-one");
        assert_eq!(meta["network-id"], nic.network_id.to_string());
        assert_eq!(meta["local-ip"], "10.1.1.4");
    }

    #[test]
    fn oversize_userdata_is_rejected() {
        let nic = test_nic();
        let delivery = DeliveryValue::Saved;
        let big = vec![0xa5u8; MAX_USER_DATA_BYTES + 1];
        let input = test_input(&nic, &big, &delivery);
        assert!(matches!(
            build_file_set(&input),
            Err(ContentError::InvalidUserData(_))
        ));
        assert!(validate_user_data(&big).is_err());
        assert!(validate_user_data(&big[..MAX_USER_DATA_BYTES]).is_ok());
    }
}
