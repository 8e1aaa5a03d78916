// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Server library for the config-drive service.
//!
//! The [`service::ConfigDriveService`] owns one lifecycle driver task per
//! instance; administrative and platform events are queued per instance and
//! applied in arrival order, while distinct instances proceed fully in
//! parallel. The [`server`] module exposes the administrative and
//! guest-facing operations over HTTP.

pub mod config;
pub mod instance;
pub mod persist;
pub mod server;
pub mod service;
