// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Core engine for per-instance configuration drives.
//!
//! For virtual machines with no in-band metadata-server path, the config
//! drive is a small read-only FAT volume carrying the instance's metadata,
//! userdata, ssh key, and one-time administrative password. This crate owns
//! the content of those drives:
//!
//! - [`content`] builds the ordered file set for a drive from an instance's
//!   current inputs (a pure transformation).
//! - [`image`] encodes a file set into the FAT volume the guest device
//!   reads.
//! - [`ledger`] tracks per-instance one-time password delivery.
//! - [`nic`] resolves which NIC attachment currently serves the drive.
//! - [`store`] owns the published, versioned images and the atomic swap
//!   that keeps readers from ever observing a torn drive.
//!
//! Deciding *when* drives are rebuilt (lifecycle events, per-instance
//! serialization) belongs to the server crate; everything here is callable
//! from any context and keyed by instance id.

pub mod content;
pub mod image;
pub mod ledger;
pub mod nic;
pub mod store;

pub use content::{ContentError, DriveFile, FileSet};
pub use image::{DriveImage, ImageError};
pub use ledger::{DeliveryValue, LedgerError, PasswordLedger, PasswordState};
pub use nic::{AttachmentResolver, ResolverError, TopologyOutcome};
pub use store::{DriveRead, DriveStore, PublishPayload, StoreError};
