// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Applies lifecycle events to one instance's drive.
//!
//! Each instance has a single driver task consuming its event queue, so a
//! VM undergoes one drive change at a time and there is a single source of
//! truth for its record. Rebuild rules:
//!
//! - create and administrative updates rebuild from the current inputs;
//! - start/reboot/migrate republish the current volume verbatim (content
//!   must be byte-identical across a restart and unaffected by host
//!   relocation) unless an update was deferred, in which case they rebuild;
//! - a disabled provider turns rebuilds into deferrals: the update is
//!   recorded and the pending marker set, never silently dropped;
//! - any rebuild failure leaves the previously published version current
//!   and is reported to the submitting caller.

use std::sync::Arc;

use slog::{error, info, Logger};

use super::request_queue::EventQueue;
use super::{DriveState, EventOutcome, InstanceRecord, LifecycleEvent};
use crate::persist::{PersistedDrive, PersistedInstance};
use crate::service::{Components, ServiceError};
use configdrive::content::{self, ContentInput};
use configdrive::ledger::{DeliveryValue, LedgerError};
use configdrive::store::{PasswordExposure, PublishPayload};
use configdrive_types::{
    Generation, NicAttachment, PowerState,
};

pub(crate) struct StateDriver {
    components: Arc<Components>,
    queue: Arc<EventQueue>,
    record: InstanceRecord,
    persist_gen: Generation,
    log: Logger,
}

impl StateDriver {
    pub(crate) fn new(
        components: Arc<Components>,
        queue: Arc<EventQueue>,
        record: InstanceRecord,
        persist_gen: Generation,
        log: Logger,
    ) -> Self {
        Self { components, queue, record, persist_gen, log }
    }

    pub(crate) async fn run(mut self) {
        while let Some(queued) = self.queue.next().await {
            let event = queued.event;
            let expunged = matches!(event, LifecycleEvent::Expunge);

            let result = match self.apply(&event).await {
                Ok(outcome) if !expunged => {
                    self.persist().map(|()| outcome)
                }
                other => other,
            };
            if let Err(e) = &result {
                info!(self.log, "lifecycle event failed";
                      "event" => %event,
                      "error" => %e);
            }

            self.queue.event_applied(&event, self.record.power);
            let _ = queued.done.send(result);
            if expunged {
                break;
            }
        }
        info!(self.log, "instance driver exiting");
    }

    async fn apply(
        &mut self,
        event: &LifecycleEvent,
    ) -> Result<EventOutcome, ServiceError> {
        info!(self.log, "applying lifecycle event"; "event" => %event);
        let id = self.record.id;

        match event {
            LifecycleEvent::Created => {
                self.record.drive_state = DriveState::Provisioning;
                self.rebuild_or_defer()
            }

            LifecycleEvent::Start => {
                self.record.power = PowerState::Running;
                self.refresh()
            }

            // A reboot or migration republishes; neither resets password
            // delivery nor changes content.
            LifecycleEvent::Reboot | LifecycleEvent::Migrate => {
                self.refresh()
            }

            LifecycleEvent::Stop => {
                self.record.power = PowerState::Stopped;
                Ok(EventOutcome::Unchanged)
            }

            LifecycleEvent::Recover => {
                self.record.power = PowerState::Stopped;
                Ok(EventOutcome::Unchanged)
            }

            LifecycleEvent::Destroy => {
                self.record.power = PowerState::Destroyed;
                Ok(EventOutcome::Unchanged)
            }

            LifecycleEvent::Expunge => {
                self.record.drive_state = DriveState::Detaching;
                self.components.store.remove(id);
                self.components.resolver.remove_instance(id);
                self.components.ledger.remove(id);
                if let Some(dir) = &self.components.state_dir {
                    if let Err(e) = dir.remove_instance(id) {
                        error!(self.log, "failed to remove durable record";
                               "error" => %e);
                    }
                }
                self.record.power = PowerState::Expunged;
                self.record.drive_state = DriveState::Absent;
                self.queue.close();
                Ok(EventOutcome::Removed)
            }

            LifecycleEvent::UserDataUpdated(data) => {
                content::validate_user_data(data)?;
                self.record.user_data = data.clone();
                self.rebuild_or_defer()
            }

            LifecycleEvent::PasswordReset => {
                if !self.record.password_enabled {
                    return Err(
                        LedgerError::NotPasswordEnabled(id).into()
                    );
                }
                let password = self
                    .components
                    .platform
                    .generate_password()
                    .await
                    .map_err(|e| ServiceError::Unavailable(e.to_string()))?;
                self.components
                    .ledger
                    .set_password(id, password.clone())?;
                let version = match self.rebuild_or_defer()? {
                    EventOutcome::Published(v) => Some(v),
                    _ => None,
                };
                Ok(EventOutcome::PasswordReset { password, version })
            }

            // Key rotation is a trust-boundary change; it also re-arms
            // password delivery.
            LifecycleEvent::SshKeyUpdated(key) => {
                self.record.ssh_public_key = key.clone();
                self.components.ledger.re_arm(id)?;
                self.rebuild_or_defer()
            }

            LifecycleEvent::TemplatePasswordEnabled(enabled) => {
                self.record.password_enabled = *enabled;
                self.components.ledger.set_mode(id, *enabled)?;
                Ok(EventOutcome::Unchanged)
            }

            LifecycleEvent::Topology(change) => {
                match self.components.resolver.apply(id, change)? {
                    configdrive::nic::TopologyOutcome::DefaultChanged {
                        new_default,
                        displaced,
                    } => {
                        info!(self.log, "default attachment changed";
                              "new" => %new_default.id,
                              "displaced" => ?displaced);
                        self.rebuild_or_defer()
                    }
                    configdrive::nic::TopologyOutcome::Unchanged => {
                        Ok(EventOutcome::Unchanged)
                    }
                }
            }

            // The store already sealed the drive; this event exists so the
            // delivered flag reaches the durable record.
            LifecycleEvent::PasswordObserved { .. } => {
                Ok(EventOutcome::Unchanged)
            }
        }
    }

    /// Start/reboot/migrate path: republish the current volume verbatim at
    /// the current default attachment, falling back to a full rebuild when
    /// an update was deferred or no drive exists yet.
    fn refresh(&mut self) -> Result<EventOutcome, ServiceError> {
        if self.record.rebuild_pending
            || self.record.drive_state != DriveState::Attached
        {
            return self.rebuild_or_defer();
        }
        let nic =
            self.components.resolver.resolve_default(self.record.id)?;
        if !self.components.provider_enabled(nic.network_id) {
            // Provider went dark: the existing image remains, stale but
            // present, until the next enabling event.
            return Ok(EventOutcome::Unchanged);
        }
        let version =
            self.components.store.republish(self.record.id, nic.id)?;
        Ok(EventOutcome::Published(version))
    }

    fn rebuild_or_defer(&mut self) -> Result<EventOutcome, ServiceError> {
        match self.rebuild() {
            Ok(version) => {
                self.record.rebuild_pending = false;
                self.record.drive_state = DriveState::Attached;
                Ok(EventOutcome::Published(version))
            }
            Err(ServiceError::ProviderDisabled(network)) => {
                info!(self.log, "rebuild deferred, provider disabled";
                      "network" => %network);
                self.record.rebuild_pending = true;
                Ok(EventOutcome::Deferred)
            }
            Err(e) => Err(e),
        }
    }

    /// Builds and publishes a drive from the instance's current inputs.
    /// This is the only path that consults the password ledger's delivery
    /// value.
    fn rebuild(&mut self) -> Result<Generation, ServiceError> {
        let id = self.record.id;
        let nic = self.components.resolver.resolve_default(id)?;
        if !self.components.provider_enabled(nic.network_id) {
            return Err(ServiceError::ProviderDisabled(nic.network_id));
        }

        let delivery = self.components.ledger.delivery_value(id)?;
        let files =
            content::build_file_set(&self.content_input(&nic, &delivery))?;

        // A live password ships with its pre-sealed sibling so the first
        // guest read can atomically retire the plaintext.
        let exposure = match &delivery {
            DeliveryValue::Plaintext { epoch, .. } => {
                let sealed = DeliveryValue::Saved;
                let sealed_files = content::build_file_set(
                    &self.content_input(&nic, &sealed),
                )?;
                Some(PasswordExposure { epoch: *epoch, sealed_files })
            }
            _ => None,
        };

        let version = self.components.store.publish(
            id,
            nic.id,
            PublishPayload { files, exposure },
        )?;
        Ok(version)
    }

    fn content_input<'a>(
        &'a self,
        nic: &'a NicAttachment,
        delivery: &'a DeliveryValue,
    ) -> ContentInput<'a> {
        ContentInput {
            instance_id: self.record.id,
            instance_name: &self.record.name,
            zone: &self.record.zone,
            availability_zone: &self.record.availability_zone,
            nic,
            user_data: &self.record.user_data,
            delivery,
            ssh_public_key: self.record.ssh_public_key.as_deref(),
        }
    }

    /// Writes the instance's full durable record: inputs, password state,
    /// NIC set, and the published drive contents (so a restart serves
    /// identical content without consulting the ledger).
    fn persist(&mut self) -> Result<(), ServiceError> {
        let Some(dir) = &self.components.state_dir else {
            return Ok(());
        };
        if self.record.power == PowerState::Expunged {
            return Ok(());
        }

        let id = self.record.id;
        let password = self.components.ledger.snapshot(id)?;
        let nics = self.components.resolver.snapshot(id)?;
        let drive = self.components.store.current_image(id).map(|image| {
            let (sealed, exposed_epoch) = self
                .components
                .store
                .sealed_state(id)
                .unwrap_or((None, None));
            PersistedDrive::from_parts(&image, sealed, exposed_epoch)
        });

        self.persist_gen = self.persist_gen.next();
        let record = PersistedInstance::new(
            self.persist_gen,
            &self.record,
            password,
            nics,
            drive,
        );
        dir.write_instance(&record)
            .map_err(|e| ServiceError::Persist(e.to_string()))
    }
}
