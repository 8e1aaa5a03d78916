// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Encodes a drive file set into the FAT volume the guest device reads.

use std::io::{Cursor, Write};

use fatfs::{FileSystem, FormatVolumeOptions, FsOptions};
use thiserror::Error;

use crate::content::FileSet;
use configdrive_types::{AttachmentId, Generation, InstanceId};

const SECTOR_SZ: usize = 512;
const VOLUME_LABEL: [u8; 11] = *b"cidata     ";

/// Upper bound on file payload, in sectors. vfat can hold more, but config
/// drive contents never need it.
pub const MAX_FILE_SECTORS: usize = 512;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error(
        "drive contents span {0} sectors, exceeding the \
        {MAX_FILE_SECTORS}-sector device capacity"
    )]
    TooLarge(usize),

    #[error("failed to encode FAT volume: {0}")]
    Encode(#[from] std::io::Error),
}

/// A published drive image. Immutable once built; the store hands these out
/// behind `Arc` so readers in flight against an old version complete
/// against that version.
pub struct DriveImage {
    pub instance_id: InstanceId,
    pub attachment_id: AttachmentId,
    pub version: Generation,
    pub files: FileSet,
    pub bytes: Vec<u8>,
    /// Delivery epoch of the live password this image embeds, if any.
    pub password_epoch: Option<u64>,
}

impl std::fmt::Debug for DriveImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriveImage")
            .field("instance_id", &self.instance_id)
            .field("attachment_id", &self.attachment_id)
            .field("version", &self.version)
            .field("bytes", &format!("<{} bytes>", self.bytes.len()))
            .finish()
    }
}

/// Encodes `files` as a FAT12 volume labeled `cidata`.
pub fn encode(files: &FileSet) -> Result<Vec<u8>, ImageError> {
    let file_sectors: usize = files
        .files()
        .iter()
        .map(|f| f.data.len().div_ceil(SECTOR_SZ))
        .sum();
    if file_sectors > MAX_FILE_SECTORS {
        return Err(ImageError::TooLarge(file_sectors));
    }

    // If we're storing < 341 KiB of clusters, the FAT overhead is 37
    // sectors. With the 512-sector cap above that always holds.
    // Additionally, fatfs refuses to format a disk smaller than 42 sectors.
    let sectors = 42.max(file_sectors + 37);

    // Some tools require the sector count to be a multiple of the
    // sectors-per-track value. fatfs defaults to 32, which won't evenly
    // divide the count computed above, so pin it to the count itself.
    let sectors_per_track = sectors.try_into().unwrap();

    let mut disk = Cursor::new(vec![0; sectors * SECTOR_SZ]);
    fatfs::format_volume(
        &mut disk,
        FormatVolumeOptions::new()
            .bytes_per_cluster(512)
            .sectors_per_track(sectors_per_track)
            .fat_type(fatfs::FatType::Fat12)
            .volume_label(VOLUME_LABEL),
    )?;

    {
        let fs = FileSystem::new(&mut disk, FsOptions::new())?;
        let root_dir = fs.root_dir();
        for file in files.files() {
            root_dir.create_file(&file.name)?.write_all(&file.data)?;
        }
    }

    Ok(disk.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::{DriveFile, FileSet};

    use std::io::Read;

    fn file_set(sizes: &[(&str, usize)]) -> FileSet {
        FileSet::new(
            sizes
                .iter()
                .map(|(name, size)| DriveFile {
                    name: name.to_string(),
                    data: vec![0x5a; *size],
                })
                .collect(),
        )
    }

    #[test]
    fn encoded_volume_reads_back_intact() {
        let files = FileSet::new(vec![
            DriveFile {
                name: "meta-data".to_string(),
                data: b"{\"local-hostname\":\"vm-one\"}".to_vec(),
            },
            DriveFile { name: "user-data".to_string(), data: Vec::new() },
            DriveFile {
                name: "vm-password".to_string(),
                data: b"saved_password\n".to_vec(),
            },
        ]);
        let bytes = encode(&files).unwrap();

        let mut disk = Cursor::new(bytes);
        let fs = FileSystem::new(&mut disk, FsOptions::new()).unwrap();
        let root_dir = fs.root_dir();
        for expected in files.files() {
            let mut contents = Vec::new();
            root_dir
                .open_file(&expected.name)
                .unwrap()
                .read_to_end(&mut contents)
                .unwrap();
            assert_eq!(contents, expected.data, "file {}", expected.name);
        }
    }

    /// fatfs panics if asked to format a filesystem with nonsensical
    /// geometry, so check the sector math over a spread of odd sizes.
    #[test]
    fn encode_handles_awkward_file_sizes() {
        for md_size in [0usize, 1, 511, 512, 1019, 4096] {
            for ud_size in [0usize, 269, 8192, 32 * 1024 + 4096] {
                let files = file_set(&[
                    ("meta-data", md_size),
                    ("user-data", ud_size),
                ]);
                assert!(
                    encode(&files).is_ok(),
                    "md={md_size} ud={ud_size}"
                );
            }
        }
    }

    #[test]
    fn oversize_contents_are_rejected_before_formatting() {
        let files = file_set(&[("user-data", MAX_FILE_SECTORS * 512 + 1)]);
        assert!(matches!(encode(&files), Err(ImageError::TooLarge(_))));
    }
}
