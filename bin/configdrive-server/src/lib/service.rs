// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The config-drive service: one lifecycle driver per instance, shared
//! component registries, and the administrative/guest-facing operations.
//!
//! Mutual exclusion per instance comes from the single driver task behind
//! each event queue; operations on distinct instances share nothing but the
//! short-lock component maps, so one slow instance cannot delay another.
//! Guest reads ([`ConfigDriveService::drive`]) never wait on a rebuild:
//! they clone the current image `Arc` under a brief map lock.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use slog::{error, info, o, warn, Logger};
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::instance::request_queue::{EventDeniedReason, EventQueue};
use crate::instance::state_driver::StateDriver;
use crate::instance::{
    DriveState, EventOutcome, InstanceRecord, LifecycleEvent,
};
use crate::persist::{decode_files, PersistedInstance, StateDir};
use configdrive::content::{self, ContentError};
use configdrive::image::{DriveImage, ImageError};
use configdrive::ledger::{LedgerError, PasswordLedger};
use configdrive::nic::{AttachmentResolver, ResolverError};
use configdrive::store::{DriveStore, StoreError};
use configdrive_types::{
    AttachmentId, Generation, InstanceId, InstanceStateRequested, NetworkId,
    NicAttachment, PowerState, TopologyChange,
};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("instance {0} is not known to the config-drive service")]
    UnknownInstance(InstanceId),

    #[error("instance {0} is already registered")]
    AlreadyRegistered(InstanceId),

    #[error("request denied: {0}")]
    Denied(EventDeniedReason),

    #[error(transparent)]
    Content(#[from] ContentError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Resolver(#[from] ResolverError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("drive build failed: {0}")]
    BuildFailed(#[from] ImageError),

    #[error("config-drive provider is disabled on network {0}")]
    ProviderDisabled(NetworkId),

    #[error("platform collaborator unavailable: {0}")]
    Unavailable(String),

    #[error("failed to persist instance state: {0}")]
    Persist(String),
}

/// External collaborators consumed by the service.
#[async_trait]
pub trait Platform: Send + Sync + 'static {
    /// Generates a raw administrative password.
    async fn generate_password(&self) -> anyhow::Result<String>;
}

/// Default platform: locally generated alphanumeric passwords.
pub struct LocalPlatform {
    password_length: usize,
}

impl LocalPlatform {
    pub fn new(password_length: usize) -> Self {
        Self { password_length }
    }
}

impl Default for LocalPlatform {
    fn default() -> Self {
        Self::new(12)
    }
}

#[async_trait]
impl Platform for LocalPlatform {
    async fn generate_password(&self) -> anyhow::Result<String> {
        let mut rng = rand::thread_rng();
        Ok((0..self.password_length)
            .map(|_| rng.sample(Alphanumeric) as char)
            .collect())
    }
}

/// Shared component registries, handed to every instance driver.
pub(crate) struct Components {
    pub log: Logger,
    pub platform: Arc<dyn Platform>,
    pub ledger: PasswordLedger,
    pub resolver: AttachmentResolver,
    pub store: DriveStore,
    /// Per-network provider enablement; networks default to enabled.
    pub providers: Mutex<BTreeMap<NetworkId, bool>>,
    pub state_dir: Option<StateDir>,
}

impl Components {
    pub fn provider_enabled(&self, network: NetworkId) -> bool {
        *self.providers.lock().unwrap().get(&network).unwrap_or(&true)
    }
}

struct InstanceHandle {
    queue: Arc<EventQueue>,
    driver: JoinHandle<()>,
}

impl Drop for InstanceHandle {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// Parameters for registering an instance.
#[derive(Clone, Debug)]
pub struct NewInstance {
    pub id: InstanceId,
    pub name: String,
    pub zone: String,
    pub availability_zone: String,
    pub user_data: Vec<u8>,
    pub ssh_public_key: Option<String>,
    pub password_enabled: bool,
    pub nics: Vec<NicAttachment>,
}

/// Result of registering an instance.
#[derive(Clone, Debug)]
pub struct Registered {
    /// Version of the initial drive; `None` when the build was deferred.
    pub version: Option<Generation>,
    /// The initial administrative password of a password-enabled instance.
    pub password: Option<String>,
}

pub struct ConfigDriveService {
    log: Logger,
    components: Arc<Components>,
    instances: Mutex<BTreeMap<InstanceId, InstanceHandle>>,
}

impl ConfigDriveService {
    /// Builds the service, restoring any durable state under `state_dir`.
    /// Must be called from within a tokio runtime; instance drivers are
    /// spawned onto it.
    pub fn new(
        log: Logger,
        platform: Arc<dyn Platform>,
        state_dir: Option<StateDir>,
    ) -> anyhow::Result<Self> {
        let providers = match &state_dir {
            Some(dir) => dir.load_networks()?,
            None => BTreeMap::new(),
        };
        let components = Arc::new(Components {
            log: log.new(o!("component" => "configdrive-core")),
            platform,
            ledger: PasswordLedger::new(),
            resolver: AttachmentResolver::new(),
            store: DriveStore::new(log.new(o!("component" => "store"))),
            providers: Mutex::new(providers),
            state_dir,
        });
        let service = Self {
            log,
            components,
            instances: Mutex::new(BTreeMap::new()),
        };

        let persisted = match &service.components.state_dir {
            Some(dir) => dir.load_instances()?,
            None => Vec::new(),
        };
        for record in persisted {
            let id = record.id;
            if let Err(e) = service.restore_instance(record) {
                error!(service.log, "failed to restore instance";
                       "instance" => %id,
                       "error" => %e);
            }
        }
        Ok(service)
    }

    fn restore_instance(
        &self,
        persisted: PersistedInstance,
    ) -> anyhow::Result<()> {
        if persisted.power == PowerState::Expunged {
            return Ok(());
        }
        let record = persisted.to_record()?;
        let id = record.id;

        self.components
            .ledger
            .restore(id, persisted.password.clone());
        self.components.resolver.register(id, persisted.nics.clone())?;
        if let Some(drive) = &persisted.drive {
            let files = decode_files(&drive.files)?;
            let sealed = match &drive.sealed {
                Some(s) => Some((s.epoch, decode_files(&s.files)?)),
                None => None,
            };
            self.components.store.restore(
                id,
                drive.attachment_id,
                files,
                drive.version,
                drive.password_epoch,
                sealed,
                drive.exposed_epoch,
            )?;
        }

        let handle = self.spawn_driver(record, persisted.generation);
        self.instances.lock().unwrap().insert(id, handle);
        info!(self.log, "restored instance"; "instance" => %id);
        Ok(())
    }

    fn spawn_driver(
        &self,
        record: InstanceRecord,
        persist_gen: Generation,
    ) -> InstanceHandle {
        let id = record.id;
        let queue = Arc::new(EventQueue::new(
            self.log.new(o!("queue" => id.to_string())),
            id,
            record.power,
        ));
        let driver = StateDriver::new(
            self.components.clone(),
            queue.clone(),
            record,
            persist_gen,
            self.log.new(o!("instance" => id.to_string())),
        );
        InstanceHandle { queue, driver: tokio::spawn(driver.run()) }
    }

    /// Registers an instance and publishes its initial drive. A
    /// password-enabled instance gets a generated password, reported back
    /// here and embedded in the first drive read.
    pub async fn register_instance(
        &self,
        new: NewInstance,
    ) -> Result<Registered, ServiceError> {
        content::validate_user_data(&new.user_data)?;
        if new.nics.is_empty() {
            return Err(ResolverError::NoAttachment(new.id).into());
        }

        let password = match new.password_enabled {
            true => Some(
                self.components
                    .platform
                    .generate_password()
                    .await
                    .map_err(|e| ServiceError::Unavailable(e.to_string()))?,
            ),
            false => None,
        };

        let rx = {
            let mut instances = self.instances.lock().unwrap();
            if instances.contains_key(&new.id) {
                return Err(ServiceError::AlreadyRegistered(new.id));
            }
            self.components.resolver.register(new.id, new.nics.clone())?;
            self.components.ledger.register(new.id, new.password_enabled);
            if let Some(pw) = &password {
                self.components.ledger.set_password(new.id, pw.clone())?;
            }

            let record = InstanceRecord {
                id: new.id,
                name: new.name.clone(),
                zone: new.zone.clone(),
                availability_zone: new.availability_zone.clone(),
                user_data: new.user_data.clone(),
                ssh_public_key: new.ssh_public_key.clone(),
                password_enabled: new.password_enabled,
                power: PowerState::Running,
                drive_state: DriveState::Absent,
                rebuild_pending: false,
            };
            let handle = self.spawn_driver(record, Generation::new());
            let rx = handle
                .queue
                .try_queue(LifecycleEvent::Created)
                .map_err(ServiceError::Denied)?;
            instances.insert(new.id, handle);
            rx
        };

        let outcome =
            rx.await.map_err(|_| ServiceError::UnknownInstance(new.id))??;
        let version = match outcome {
            EventOutcome::Published(v) => Some(v),
            _ => None,
        };
        info!(self.log, "registered instance";
              "instance" => %new.id,
              "version" => ?version);
        Ok(Registered { version, password })
    }

    async fn submit(
        &self,
        instance: InstanceId,
        event: LifecycleEvent,
    ) -> Result<EventOutcome, ServiceError> {
        let is_admin_update = event.is_admin_update();
        let rx = {
            let instances = self.instances.lock().unwrap();
            let handle = instances
                .get(&instance)
                .ok_or(ServiceError::UnknownInstance(instance))?;
            handle.queue.try_queue(event).map_err(|reason| {
                map_denied(instance, is_admin_update, reason)
            })?
        };
        rx.await.map_err(|_| ServiceError::UnknownInstance(instance))?
    }

    /// Applies a requested power transition.
    pub async fn request_state(
        &self,
        instance: InstanceId,
        state: InstanceStateRequested,
    ) -> Result<Option<Generation>, ServiceError> {
        let event = match state {
            InstanceStateRequested::Start => LifecycleEvent::Start,
            InstanceStateRequested::Stop => LifecycleEvent::Stop,
            InstanceStateRequested::Reboot => LifecycleEvent::Reboot,
            InstanceStateRequested::Migrate => LifecycleEvent::Migrate,
            InstanceStateRequested::Recover => LifecycleEvent::Recover,
            InstanceStateRequested::Destroy => LifecycleEvent::Destroy,
        };
        match self.submit(instance, event).await? {
            EventOutcome::Published(v) => Ok(Some(v)),
            _ => Ok(None),
        }
    }

    /// Replaces the instance's userdata. Returns the new drive version, or
    /// `None` when the rebuild was deferred.
    pub async fn update_user_data(
        &self,
        instance: InstanceId,
        user_data: Vec<u8>,
    ) -> Result<Option<Generation>, ServiceError> {
        match self
            .submit(instance, LifecycleEvent::UserDataUpdated(user_data))
            .await?
        {
            EventOutcome::Published(v) => Ok(Some(v)),
            _ => Ok(None),
        }
    }

    /// Assigns a fresh password and returns it; the same value appears in
    /// the next drive read.
    pub async fn reset_password(
        &self,
        instance: InstanceId,
    ) -> Result<(String, Option<Generation>), ServiceError> {
        match self.submit(instance, LifecycleEvent::PasswordReset).await? {
            EventOutcome::PasswordReset { password, version } => {
                Ok((password, version))
            }
            other => unreachable!(
                "password reset produced unexpected outcome {other:?}"
            ),
        }
    }

    pub async fn update_ssh_key(
        &self,
        instance: InstanceId,
        public_key: Option<String>,
    ) -> Result<Option<Generation>, ServiceError> {
        match self
            .submit(instance, LifecycleEvent::SshKeyUpdated(public_key))
            .await?
        {
            EventOutcome::Published(v) => Ok(Some(v)),
            _ => Ok(None),
        }
    }

    pub async fn set_template_password_enabled(
        &self,
        instance: InstanceId,
        enabled: bool,
    ) -> Result<(), ServiceError> {
        self.submit(
            instance,
            LifecycleEvent::TemplatePasswordEnabled(enabled),
        )
        .await?;
        Ok(())
    }

    pub async fn apply_topology_change(
        &self,
        instance: InstanceId,
        change: TopologyChange,
    ) -> Result<Option<Generation>, ServiceError> {
        match self
            .submit(instance, LifecycleEvent::Topology(change))
            .await?
        {
            EventOutcome::Published(v) => Ok(Some(v)),
            _ => Ok(None),
        }
    }

    /// Expunges an instance: tears down its drive, ledger entry, NIC set,
    /// and durable record.
    pub async fn expunge_instance(
        &self,
        instance: InstanceId,
    ) -> Result<(), ServiceError> {
        self.submit(instance, LifecycleEvent::Expunge).await?;
        self.instances.lock().unwrap().remove(&instance);
        Ok(())
    }

    /// The current drive image for a guest read. Never blocked by an
    /// in-flight rebuild. The first read of a freshly reset password takes
    /// the plaintext; the service records the delivery so every later read
    /// returns the sentinel.
    pub fn drive(
        &self,
        instance: InstanceId,
        attachment: AttachmentId,
    ) -> Result<Arc<DriveImage>, ServiceError> {
        if !self.instances.lock().unwrap().contains_key(&instance) {
            return Err(ServiceError::UnknownInstance(instance));
        }
        let read = self.components.store.current(instance, attachment)?;
        if let Some(epoch) = read.delivered_password_epoch {
            if let Err(e) =
                self.components.ledger.mark_delivered(instance, epoch)
            {
                warn!(self.log, "failed to record password delivery";
                      "instance" => %instance,
                      "error" => %e);
            }
            // Nudge the driver so the seal reaches the durable record; the
            // read itself does not wait on it.
            if let Some(handle) =
                self.instances.lock().unwrap().get(&instance)
            {
                let _ = handle
                    .queue
                    .try_queue(LifecycleEvent::PasswordObserved { epoch });
            }
        }
        Ok(read.image)
    }

    /// Enables or disables the provider on a network. Disabling stops
    /// rebuilds for instances attached there (existing images remain,
    /// stale but present); re-enabling lets the next lifecycle event
    /// rebuild.
    pub fn set_provider_state(&self, network: NetworkId, enabled: bool) {
        let providers = {
            let mut providers = self.components.providers.lock().unwrap();
            providers.insert(network, enabled);
            providers.clone()
        };
        info!(self.log, "provider state changed";
              "network" => %network,
              "enabled" => enabled);
        if let Some(dir) = &self.components.state_dir {
            if let Err(e) = dir.write_networks(&providers) {
                error!(self.log, "failed to persist network map";
                       "error" => %e);
            }
        }
    }
}

fn map_denied(
    instance: InstanceId,
    is_admin_update: bool,
    reason: EventDeniedReason,
) -> ServiceError {
    match reason {
        // A fully or partially expunged instance is gone from the caller's
        // point of view, as is a destroyed one for administrative updates.
        EventDeniedReason::Expunged | EventDeniedReason::ExpungePending => {
            ServiceError::UnknownInstance(instance)
        }
        EventDeniedReason::Destroyed if is_admin_update => {
            ServiceError::UnknownInstance(instance)
        }
        other => ServiceError::Denied(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    use configdrive::content::{
        PASSWORD_FILE, PUBLIC_KEYS_FILE, USER_DATA_FILE,
    };
    use tokio::sync::Notify;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    /// Deterministic platform: hands out queued passwords in order.
    struct FakePlatform {
        passwords: Mutex<VecDeque<String>>,
    }

    impl FakePlatform {
        fn with_passwords(passwords: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                passwords: Mutex::new(
                    passwords.iter().map(|s| s.to_string()).collect(),
                ),
            })
        }
    }

    #[async_trait]
    impl Platform for FakePlatform {
        async fn generate_password(&self) -> anyhow::Result<String> {
            Ok(self
                .passwords
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| "fallback-pw".to_string()))
        }
    }

    /// Platform whose password generation blocks until released, to pin
    /// one instance's driver while others proceed.
    struct GatedPlatform {
        gate: Notify,
    }

    #[async_trait]
    impl Platform for GatedPlatform {
        async fn generate_password(&self) -> anyhow::Result<String> {
            self.gate.notified().await;
            Ok("gated-pw".to_string())
        }
    }

    fn nic(device_index: u8, is_default: bool) -> NicAttachment {
        NicAttachment {
            id: AttachmentId::new_v4(),
            network_id: NetworkId::new_v4(),
            ip: IpAddr::V4(Ipv4Addr::new(10, 1, device_index + 1, 4)),
            is_default,
            device_index,
        }
    }

    fn new_instance(user_data: &[u8], nics: Vec<NicAttachment>) -> NewInstance {
        NewInstance {
            id: InstanceId::new_v4(),
            name: "vm-one".to_string(),
            zone: "zone-1".to_string(),
            availability_zone: "az-1".to_string(),
            user_data: user_data.to_vec(),
            ssh_public_key: None,
            password_enabled: true,
            nics,
        }
    }

    fn service(platform: Arc<dyn Platform>) -> ConfigDriveService {
        ConfigDriveService::new(test_logger(), platform, None).unwrap()
    }

    fn password_line(image: &DriveImage) -> String {
        String::from_utf8(
            image.files.get(PASSWORD_FILE).unwrap().data.clone(),
        )
        .unwrap()
    }

    fn user_data_of(image: &DriveImage) -> Vec<u8> {
        image.files.get(USER_DATA_FILE).unwrap().data.clone()
    }

    #[tokio::test]
    async fn creation_exposes_password_exactly_once() {
        let svc = service(FakePlatform::with_passwords(&["first-pw"]));
        let spec = new_instance(b"hello world vm I1", vec![nic(0, true)]);
        let id = spec.id;
        let attachment = spec.nics[0].id;

        let registered = svc.register_instance(spec).await.unwrap();
        assert_eq!(registered.password.as_deref(), Some("first-pw"));
        let v1 = registered.version.unwrap();

        // First read: exact userdata and the live password.
        let first = svc.drive(id, attachment).unwrap();
        assert_eq!(first.version, v1);
        assert_eq!(user_data_of(&first), b"hello world vm I1");
        assert_eq!(password_line(&first), "first-pw\n");

        // Second read, no reset in between: sentinel, same userdata.
        let second = svc.drive(id, attachment).unwrap();
        assert!(second.version > v1);
        assert_eq!(user_data_of(&second), b"hello world vm I1");
        assert_eq!(password_line(&second), "saved_password\n");

        // And it stays sealed.
        let third = svc.drive(id, attachment).unwrap();
        assert_eq!(password_line(&third), "saved_password\n");
    }

    #[tokio::test]
    async fn password_reset_rearms_delivery() {
        let svc =
            service(FakePlatform::with_passwords(&["first-pw", "second-pw"]));
        let spec = new_instance(b"", vec![nic(0, true)]);
        let id = spec.id;
        let attachment = spec.nics[0].id;
        svc.register_instance(spec).await.unwrap();
        svc.drive(id, attachment).unwrap();
        assert_eq!(
            password_line(&svc.drive(id, attachment).unwrap()),
            "saved_password\n"
        );

        let (password, version) = svc.reset_password(id).await.unwrap();
        assert_eq!(password, "second-pw");
        assert!(version.is_some());
        assert_eq!(
            password_line(&svc.drive(id, attachment).unwrap()),
            "second-pw\n"
        );
        assert_eq!(
            password_line(&svc.drive(id, attachment).unwrap()),
            "saved_password\n"
        );
    }

    #[tokio::test]
    async fn concurrent_userdata_updates_apply_in_admission_order() {
        let svc = service(FakePlatform::with_passwords(&[]));
        let spec = new_instance(b"v1", vec![nic(0, true)]);
        let id = spec.id;
        let attachment = spec.nics[0].id;
        svc.register_instance(spec).await.unwrap();

        // Submit both updates concurrently; join! polls in declaration
        // order, so v2 is admitted first and v3 second.
        let (r2, r3) = tokio::join!(
            svc.update_user_data(id, b"v2".to_vec()),
            svc.update_user_data(id, b"v3".to_vec()),
        );
        let (v2, v3) = (r2.unwrap().unwrap(), r3.unwrap().unwrap());
        assert!(v3 > v2);

        let image = svc.drive(id, attachment).unwrap();
        assert_eq!(user_data_of(&image), b"v3");
        assert_eq!(image.version, v3);
    }

    #[tokio::test]
    async fn oversize_userdata_is_rejected_and_prior_content_served() {
        let svc = service(FakePlatform::with_passwords(&[]));
        let spec = new_instance(b"v1", vec![nic(0, true)]);
        let id = spec.id;
        let attachment = spec.nics[0].id;
        svc.register_instance(spec).await.unwrap();
        let before = svc.drive(id, attachment).unwrap();

        let oversize = vec![0u8; content::MAX_USER_DATA_BYTES + 1];
        assert!(matches!(
            svc.update_user_data(id, oversize).await,
            Err(ServiceError::Content(ContentError::InvalidUserData(_)))
        ));

        let after = svc.drive(id, attachment).unwrap();
        assert_eq!(user_data_of(&after), user_data_of(&before));
    }

    #[tokio::test]
    async fn promote_to_default_moves_the_drive() {
        let svc = service(FakePlatform::with_passwords(&["pw"]));
        let nics = vec![nic(0, true), nic(1, false)];
        let (old, new) = (nics[0].id, nics[1].id);
        let spec = new_instance(b"hello", nics);
        let id = spec.id;
        svc.register_instance(spec).await.unwrap();
        // Deliver the password so the post-promote read shows the
        // sentinel.
        svc.drive(id, old).unwrap();

        let version = svc
            .apply_topology_change(
                id,
                TopologyChange::PromotedToDefault { id: new },
            )
            .await
            .unwrap();
        assert!(version.is_some());

        let image = svc.drive(id, new).unwrap();
        assert_eq!(user_data_of(&image), b"hello");
        assert_eq!(password_line(&image), "saved_password\n");
        assert!(matches!(
            svc.drive(id, old),
            Err(ServiceError::Store(StoreError::StaleAttachment(..)))
        ));
    }

    #[tokio::test]
    async fn stop_start_republishes_identical_bytes() {
        let svc = service(FakePlatform::with_passwords(&["pw"]));
        let spec = new_instance(b"hello", vec![nic(0, true)]);
        let id = spec.id;
        let attachment = spec.nics[0].id;
        svc.register_instance(spec).await.unwrap();
        // Seal the password so no read mutates the image afterwards.
        svc.drive(id, attachment).unwrap();
        let before = svc.drive(id, attachment).unwrap();

        svc.request_state(id, InstanceStateRequested::Stop)
            .await
            .unwrap();
        let started = svc
            .request_state(id, InstanceStateRequested::Start)
            .await
            .unwrap()
            .unwrap();
        let after = svc.drive(id, attachment).unwrap();
        assert_eq!(after.bytes, before.bytes);
        assert_eq!(after.version, started);
        assert!(after.version > before.version);
    }

    #[tokio::test]
    async fn migrate_republishes_identical_content() {
        let svc = service(FakePlatform::with_passwords(&["pw"]));
        let spec = new_instance(b"hello", vec![nic(0, true)]);
        let id = spec.id;
        let attachment = spec.nics[0].id;
        svc.register_instance(spec).await.unwrap();
        svc.drive(id, attachment).unwrap();
        let before = svc.drive(id, attachment).unwrap();

        svc.request_state(id, InstanceStateRequested::Migrate)
            .await
            .unwrap();
        let after = svc.drive(id, attachment).unwrap();
        assert_eq!(after.bytes, before.bytes);
    }

    #[tokio::test]
    async fn ssh_key_update_rearms_password_delivery() {
        let svc = service(FakePlatform::with_passwords(&["keep-pw"]));
        let spec = new_instance(b"", vec![nic(0, true)]);
        let id = spec.id;
        let attachment = spec.nics[0].id;
        svc.register_instance(spec).await.unwrap();
        svc.drive(id, attachment).unwrap();
        assert_eq!(
            password_line(&svc.drive(id, attachment).unwrap()),
            "saved_password\n"
        );

        svc.update_ssh_key(id, Some("ssh-ed25519 AAAA new@host".into()))
            .await
            .unwrap();
        let image = svc.drive(id, attachment).unwrap();
        assert_eq!(
            image.files.get(PUBLIC_KEYS_FILE).unwrap().data,
            b"ssh-ed25519 AAAA new@host\n"
        );
        // Key rotation re-exposes the current password once.
        assert_eq!(password_line(&image), "keep-pw\n");
        assert_eq!(
            password_line(&svc.drive(id, attachment).unwrap()),
            "saved_password\n"
        );
    }

    #[tokio::test]
    async fn disabled_provider_defers_rebuilds_without_dropping_updates() {
        let svc = service(FakePlatform::with_passwords(&["pw"]));
        let the_nic = nic(0, true);
        let network = the_nic.network_id;
        let attachment = the_nic.id;
        svc.set_provider_state(network, false);

        let spec = new_instance(b"v1", vec![the_nic]);
        let id = spec.id;
        let registered = svc.register_instance(spec).await.unwrap();
        assert!(registered.version.is_none());
        assert!(matches!(
            svc.drive(id, attachment),
            Err(ServiceError::Store(StoreError::NotAttached(_)))
        ));

        // Updates are accepted while the provider is off.
        assert!(svc
            .update_user_data(id, b"v2".to_vec())
            .await
            .unwrap()
            .is_none());

        // Re-enabling alone changes nothing; the next lifecycle event
        // publishes the deferred content.
        svc.set_provider_state(network, true);
        let version = svc
            .request_state(id, InstanceStateRequested::Reboot)
            .await
            .unwrap()
            .unwrap();
        let image = svc.drive(id, attachment).unwrap();
        assert_eq!(image.version, version);
        assert_eq!(user_data_of(&image), b"v2");
    }

    #[tokio::test]
    async fn expunged_instances_are_unknown() {
        let svc = service(FakePlatform::with_passwords(&["pw"]));
        let spec = new_instance(b"", vec![nic(0, true)]);
        let id = spec.id;
        let attachment = spec.nics[0].id;
        svc.register_instance(spec).await.unwrap();

        svc.expunge_instance(id).await.unwrap();
        assert!(matches!(
            svc.update_user_data(id, b"v2".to_vec()).await,
            Err(ServiceError::UnknownInstance(_))
        ));
        assert!(matches!(
            svc.drive(id, attachment),
            Err(ServiceError::UnknownInstance(_))
        ));
    }

    #[tokio::test]
    async fn password_ops_on_destroyed_instances_are_unknown() {
        let svc = service(FakePlatform::with_passwords(&["pw"]));
        let spec = new_instance(b"", vec![nic(0, true)]);
        let id = spec.id;
        svc.register_instance(spec).await.unwrap();

        svc.request_state(id, InstanceStateRequested::Destroy)
            .await
            .unwrap();
        assert!(matches!(
            svc.reset_password(id).await,
            Err(ServiceError::UnknownInstance(_))
        ));

        // Recover + start brings it back.
        svc.request_state(id, InstanceStateRequested::Recover)
            .await
            .unwrap();
        svc.request_state(id, InstanceStateRequested::Start)
            .await
            .unwrap();
        assert!(svc.reset_password(id).await.is_ok());
    }

    #[tokio::test]
    async fn slow_instance_does_not_delay_others() {
        let gated = Arc::new(GatedPlatform { gate: Notify::new() });
        let svc = service(gated.clone());

        let spec_a = new_instance(b"a", vec![nic(0, true)]);
        let id_a = spec_a.id;
        let mut spec_b = new_instance(b"b", vec![nic(0, true)]);
        spec_b.password_enabled = false;
        let id_b = spec_b.id;
        let attachment_b = spec_b.nics[0].id;

        // Registration of A parks its platform call on the gate, so open
        // it once for the initial password, then close the gate behind a
        // reset that will block A's driver.
        gated.gate.notify_one();
        svc.register_instance(spec_a).await.unwrap();
        svc.register_instance(spec_b).await.unwrap();

        let svc = Arc::new(svc);
        let svc_a = svc.clone();
        let blocked =
            tokio::spawn(
                async move { svc_a.reset_password(id_a).await },
            );

        // B's operations complete while A's driver is parked.
        tokio::time::timeout(
            Duration::from_secs(5),
            svc.update_user_data(id_b, b"b2".to_vec()),
        )
        .await
        .expect("instance B should not wait behind instance A")
        .unwrap();
        assert_eq!(
            user_data_of(&svc.drive(id_b, attachment_b).unwrap()),
            b"b2"
        );
        assert!(!blocked.is_finished());

        gated.gate.notify_one();
        let (password, _) = blocked.await.unwrap().unwrap();
        assert_eq!(password, "gated-pw");
    }

    #[tokio::test]
    async fn restart_serves_identical_content_and_keeps_the_seal() {
        let tmp = tempfile::tempdir().unwrap();
        let root = camino::Utf8PathBuf::from_path_buf(
            tmp.path().to_path_buf(),
        )
        .unwrap();

        let spec = new_instance(b"durable", vec![nic(0, true)]);
        let id = spec.id;
        let attachment = spec.nics[0].id;

        let (version, files_before) = {
            let dir =
                StateDir::new(root.clone(), test_logger()).unwrap();
            let svc = ConfigDriveService::new(
                test_logger(),
                FakePlatform::with_passwords(&["pw"]),
                Some(dir),
            )
            .unwrap();
            svc.register_instance(spec).await.unwrap();
            // Take the password, then run one more event so the sealed
            // drive reaches the durable record.
            svc.drive(id, attachment).unwrap();
            svc.request_state(id, InstanceStateRequested::Stop)
                .await
                .unwrap();
            let image = svc.drive(id, attachment).unwrap();
            (image.version, image.files.clone())
        };

        let dir = StateDir::new(root, test_logger()).unwrap();
        let restarted = ConfigDriveService::new(
            test_logger(),
            FakePlatform::with_passwords(&[]),
            Some(dir),
        )
        .unwrap();
        let image = restarted.drive(id, attachment).unwrap();
        assert_eq!(image.version, version);
        assert_eq!(image.files, files_before);
        // The password stays sealed across the restart.
        assert_eq!(password_line(&image), "saved_password\n");
        assert_eq!(
            user_data_of(&restarted.drive(id, attachment).unwrap()),
            b"durable"
        );
    }
}
