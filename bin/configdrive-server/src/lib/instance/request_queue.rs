// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Admits and orders the lifecycle events targeting one instance.
//!
//! Each instance has a FIFO queue consumed by its state driver, so at most
//! one rebuild is in flight per instance and concurrent requests are
//! applied in arrival order, each seeing the effects of the previous one.
//! The queue maintains a disposition for each kind of event — enqueue it,
//! silently ignore it (for idempotency), or deny it — computed from the
//! instance's recorded power state and from requests already queued but not
//! yet processed (a reboot queued behind a stop will never be satisfiable,
//! so it is denied up front).

use std::collections::VecDeque;
use std::sync::Mutex;

use slog::{debug, info, Logger};
use thiserror::Error;
use tokio::sync::{oneshot, Notify};

use super::{EventOutcome, LifecycleEvent};
use crate::service::ServiceError;
use configdrive_types::{InstanceId, PowerState};

/// A set of reasons why an event may be refused admission.
#[derive(Copy, Clone, Debug, Error)]
pub enum EventDeniedReason {
    #[error("instance has been expunged")]
    Expunged,

    #[error("instance has a pending request to expunge")]
    ExpungePending,

    #[error("instance is destroyed and must be recovered first")]
    Destroyed,

    #[error("operation requires a running instance")]
    InstanceNotRunning,

    #[error("instance has a pending request to stop")]
    HaltPending,
}

/// The possible methods of handling an event submitted to the queue.
#[derive(Copy, Clone, Debug)]
enum EventDisposition {
    /// Put the event on the queue.
    Enqueue,

    /// Complete the event immediately without queuing it. This makes
    /// requests appear idempotent to callers without making the state
    /// driver deal with the same transition twice.
    Ignore,

    /// Refuse the event.
    Deny(EventDeniedReason),
}

pub type EventResult = Result<EventOutcome, ServiceError>;

/// An admitted event awaiting the state driver, with the channel its
/// submitter is waiting on.
#[derive(Debug)]
pub struct QueuedEvent {
    pub event: LifecycleEvent,
    pub done: oneshot::Sender<EventResult>,
}

struct Inner {
    queue: VecDeque<QueuedEvent>,
    power: PowerState,
    start_pending: bool,
    stop_pending: bool,
    expunge_pending: bool,
    closed: bool,
}

/// FIFO event queue for a single instance.
pub struct EventQueue {
    instance_id: InstanceId,
    inner: Mutex<Inner>,
    notify: Notify,
    log: Logger,
}

impl EventQueue {
    pub fn new(
        log: Logger,
        instance_id: InstanceId,
        power: PowerState,
    ) -> Self {
        Self {
            instance_id,
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                power,
                start_pending: false,
                stop_pending: false,
                expunge_pending: false,
                closed: false,
            }),
            notify: Notify::new(),
            log,
        }
    }

    /// Asks to place an event on the queue. Returns the receiver the
    /// submitter awaits; ignored events complete immediately.
    pub fn try_queue(
        &self,
        event: LifecycleEvent,
    ) -> Result<oneshot::Receiver<EventResult>, EventDeniedReason> {
        let mut inner = self.inner.lock().unwrap();

        let disposition = if inner.closed {
            EventDisposition::Deny(EventDeniedReason::Expunged)
        } else if inner.expunge_pending {
            match event {
                LifecycleEvent::Expunge => EventDisposition::Ignore,
                _ => {
                    EventDisposition::Deny(EventDeniedReason::ExpungePending)
                }
            }
        } else {
            inner.disposition(&event)
        };

        debug!(self.log, "queuing lifecycle event";
               "event" => %event,
               "disposition" => ?disposition);

        match disposition {
            EventDisposition::Deny(reason) => return Err(reason),
            EventDisposition::Ignore => {
                let (tx, rx) = oneshot::channel();
                let _ = tx.send(Ok(EventOutcome::Unchanged));
                return Ok(rx);
            }
            EventDisposition::Enqueue => {}
        }

        match event {
            LifecycleEvent::Start => inner.start_pending = true,
            LifecycleEvent::Stop => inner.stop_pending = true,
            LifecycleEvent::Expunge => inner.expunge_pending = true,
            _ => {}
        }

        let (tx, rx) = oneshot::channel();
        inner.queue.push_back(QueuedEvent { event, done: tx });
        self.notify.notify_one();
        Ok(rx)
    }

    /// Next admitted event, in arrival order. Returns `None` once the
    /// queue is closed and drained.
    pub async fn next(&self) -> Option<QueuedEvent> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(queued) = inner.queue.pop_front() {
                    return Some(queued);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Notifies the queue that the state driver applied an event, so
    /// dispositions for future submissions reflect the new state.
    pub fn event_applied(
        &self,
        event: &LifecycleEvent,
        power: PowerState,
    ) {
        let mut inner = self.inner.lock().unwrap();
        inner.power = power;
        match event {
            LifecycleEvent::Start => inner.start_pending = false,
            LifecycleEvent::Stop => inner.stop_pending = false,
            _ => {}
        }
    }

    /// Closes the queue, failing any events still waiting behind the one
    /// that closed it.
    pub fn close(&self) {
        let drained = {
            let mut inner = self.inner.lock().unwrap();
            inner.closed = true;
            std::mem::take(&mut inner.queue)
        };
        if !drained.is_empty() {
            info!(self.log, "draining queue on close";
                  "dropped" => drained.len());
        }
        for queued in drained {
            let _ = queued
                .done
                .send(Err(ServiceError::UnknownInstance(self.instance_id)));
        }
        self.notify.notify_one();
    }
}

impl Inner {
    fn disposition(&self, event: &LifecycleEvent) -> EventDisposition {
        use EventDeniedReason as Reason;
        use EventDisposition as Disposition;

        let running = self.power == PowerState::Running;
        match event {
            // Internal events queue unconditionally.
            LifecycleEvent::Created
            | LifecycleEvent::PasswordObserved { .. } => Disposition::Enqueue,

            LifecycleEvent::Start => {
                if self.stop_pending {
                    Disposition::Enqueue
                } else if self.start_pending {
                    Disposition::Ignore
                } else {
                    match self.power {
                        PowerState::Running => Disposition::Ignore,
                        PowerState::Stopped => Disposition::Enqueue,
                        PowerState::Destroyed | PowerState::Expunged => {
                            Disposition::Deny(Reason::Destroyed)
                        }
                    }
                }
            }

            LifecycleEvent::Stop => {
                if self.start_pending {
                    Disposition::Enqueue
                } else if self.stop_pending {
                    Disposition::Ignore
                } else {
                    match self.power {
                        PowerState::Running => Disposition::Enqueue,
                        _ => Disposition::Ignore,
                    }
                }
            }

            LifecycleEvent::Reboot
            | LifecycleEvent::Migrate
            | LifecycleEvent::Topology(_) => {
                if self.stop_pending {
                    Disposition::Deny(Reason::HaltPending)
                } else if running || self.start_pending {
                    Disposition::Enqueue
                } else {
                    Disposition::Deny(Reason::InstanceNotRunning)
                }
            }

            LifecycleEvent::Recover => match self.power {
                PowerState::Destroyed => Disposition::Enqueue,
                _ => Disposition::Ignore,
            },

            LifecycleEvent::Destroy => match self.power {
                PowerState::Destroyed => Disposition::Ignore,
                _ => Disposition::Enqueue,
            },

            LifecycleEvent::UserDataUpdated(_)
            | LifecycleEvent::PasswordReset
            | LifecycleEvent::SshKeyUpdated(_)
            | LifecycleEvent::TemplatePasswordEnabled(_) => {
                match self.power {
                    PowerState::Destroyed | PowerState::Expunged => {
                        Disposition::Deny(Reason::Destroyed)
                    }
                    _ => Disposition::Enqueue,
                }
            }

            // Expunge always queues; the driver tears everything down and
            // closes the queue.
            LifecycleEvent::Expunge => Disposition::Enqueue,
        }
    }
}
