//! Reservation queue engine
//!
//! Every operation locks the affected device record, applies its change,
//! captures a snapshot, and releases the lock before any notice is sent or
//! the snapshot is published. Delivery failures are logged and never undo
//! the change.

use chrono::{DateTime, Utc};
use gpushare_core::{
    Clock, Device, GpushareError, GpushareResult, Reservation, ReservationConfig, User,
};
use gpushare_notify::{announce, deliver, Broadcaster, Mail, Notices, Notifier};
use gpushare_store::{DeviceRecord, DeviceSnapshot, EntityStore};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Result of a next-available-spot request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextAvailable {
    /// A GPU was free and is now held by the user
    Ready(Reservation),
    /// Every GPU was taken; the user waits on all of them
    Queued(Vec<Reservation>),
}

/// Result of a release
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    pub released: Reservation,
    pub promoted: Option<Reservation>,
}

/// Counts from one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub reminded: usize,
}

/// Notice to send once the device lock is released
#[derive(Debug)]
enum Notice {
    Queued {
        holder: String,
        reservation: Reservation,
        model: String,
    },
    Ready {
        reservation: Reservation,
        model: String,
    },
    Expired {
        reservation: Reservation,
        model: String,
    },
    Reminder {
        reservation: Reservation,
        model: String,
    },
}

pub struct QueueEngine {
    store: Arc<EntityStore>,
    notifier: Arc<dyn Notifier>,
    broadcaster: Arc<dyn Broadcaster>,
    clock: Arc<dyn Clock>,
    notices: Notices,
    config: ReservationConfig,
}

impl QueueEngine {
    pub fn new(
        store: Arc<EntityStore>,
        notifier: Arc<dyn Notifier>,
        broadcaster: Arc<dyn Broadcaster>,
        clock: Arc<dyn Clock>,
        notices: Notices,
        config: ReservationConfig,
    ) -> Self {
        info!(
            usage_period_secs = config.usage_period_secs,
            reminder_period_secs = config.reminder_period_secs,
            notifier = notifier.name(),
            "Queue engine initialized"
        );

        Self {
            store,
            notifier,
            broadcaster,
            clock,
            notices,
            config,
        }
    }

    /// Queue for one specific GPU
    pub async fn reserve_specific(&self, gpu: &str, username: &str) -> GpushareResult<Reservation> {
        let actor = self.actor(username).await?;
        let handle = self.store.device_for_gpu(gpu).await?;
        let now = self.clock.now();

        let (reservation, notices, snapshot) = {
            let mut record = handle.lock().await;
            authorize(&actor, &record.device)?;
            let device = record.device.name.clone();

            let gpu_record = record.gpu_or_not_found(gpu)?;
            let holder = gpu_record.queue.current().map(|r| r.user.clone());
            let model = gpu_record.gpu.model_name.clone();

            let reservation = Reservation::new(gpu, &device, &actor.username, now);
            let id = reservation.id;
            let became_current =
                gpu_record
                    .queue
                    .enqueue(reservation, now, self.config.usage_period());
            let reservation = gpu_record
                .queue
                .get(id)
                .cloned()
                .ok_or_else(|| GpushareError::Internal(format!("Reservation {} vanished", id)))?;

            let mut notices = Vec::new();
            if let (false, Some(holder)) = (became_current, holder) {
                notices.push(Notice::Queued {
                    holder,
                    reservation: reservation.clone(),
                    model,
                });
            }

            info!(
                gpu = %gpu,
                device = %device,
                user = %actor.username,
                current = became_current,
                "Reservation created"
            );

            (reservation, notices, DeviceSnapshot::capture(&record))
        };

        self.finish(notices, Some(snapshot)).await;
        Ok(reservation)
    }

    /// Take the first free GPU on a device, or queue on all of them
    pub async fn reserve_next_available(
        &self,
        device: &str,
        username: &str,
    ) -> GpushareResult<NextAvailable> {
        let actor = self.actor(username).await?;
        let handle = self.store.device(device).await?;
        let now = self.clock.now();
        let period = self.config.usage_period();

        let (outcome, notices, snapshot) = {
            let mut record = handle.lock().await;
            authorize(&actor, &record.device)?;
            if record.gpus.is_empty() {
                return Err(GpushareError::NotFound(format!(
                    "No GPUs on device {}",
                    device
                )));
            }

            let mut notices = Vec::new();
            let outcome = if let Some(gpu_record) =
                record.gpus.iter_mut().find(|g| g.queue.is_empty())
            {
                let reservation =
                    Reservation::new(&gpu_record.gpu.uuid, device, &actor.username, now);
                let id = reservation.id;
                gpu_record.queue.enqueue(reservation, now, period);
                let reservation = gpu_record.queue.get(id).cloned().ok_or_else(|| {
                    GpushareError::Internal(format!("Reservation {} vanished", id))
                })?;

                info!(
                    gpu = %reservation.gpu,
                    device = %device,
                    user = %actor.username,
                    "Next available GPU reserved"
                );
                notices.push(Notice::Ready {
                    reservation: reservation.clone(),
                    model: gpu_record.gpu.model_name.clone(),
                });
                NextAvailable::Ready(reservation)
            } else {
                let mut queued = Vec::with_capacity(record.gpus.len());
                for gpu_record in record.gpus.iter_mut() {
                    let reservation =
                        Reservation::new(&gpu_record.gpu.uuid, device, &actor.username, now)
                            .next_available();
                    let holder = gpu_record.queue.current().map(|r| r.user.clone());
                    gpu_record.queue.enqueue(reservation.clone(), now, period);

                    if let Some(holder) = holder {
                        notices.push(Notice::Queued {
                            holder,
                            reservation: reservation.clone(),
                            model: gpu_record.gpu.model_name.clone(),
                        });
                    }
                    queued.push(reservation);
                }

                info!(
                    device = %device,
                    user = %actor.username,
                    gpus = queued.len(),
                    "Queued for next available GPU"
                );
                NextAvailable::Queued(queued)
            };

            (outcome, notices, DeviceSnapshot::capture(&record))
        };

        self.finish(notices, Some(snapshot)).await;
        Ok(outcome)
    }

    /// Give up the GPU; only the current holder may do this
    pub async fn release(
        &self,
        gpu: &str,
        reservation_id: Uuid,
        username: &str,
    ) -> GpushareResult<Release> {
        let actor = self.actor(username).await?;
        let handle = self.store.device_for_gpu(gpu).await?;
        let now = self.clock.now();

        let (release, notices, snapshot) = {
            let mut record = handle.lock().await;
            authorize(&actor, &record.device)?;

            let gpu_record = record.gpu_or_not_found(gpu)?;
            let current = gpu_record.queue.current().ok_or_else(|| {
                GpushareError::NotFound(format!("No current reservation on GPU {}", gpu))
            })?;
            if current.id != reservation_id {
                return Err(match gpu_record.queue.get(reservation_id) {
                    Some(_) => GpushareError::Unauthorized(format!(
                        "Reservation {} is not the current holder of GPU {}",
                        reservation_id, gpu
                    )),
                    None => GpushareError::NotFound(format!("Reservation {}", reservation_id)),
                });
            }
            if current.user != actor.username {
                return Err(GpushareError::Unauthorized(format!(
                    "{} does not hold GPU {}",
                    actor.username, gpu
                )));
            }

            let released = gpu_record.queue.pop_current().ok_or_else(|| {
                GpushareError::Internal(format!("Current reservation on {} vanished", gpu))
            })?;
            info!(gpu = %gpu, user = %actor.username, "Reservation released");

            let (promoted, notices) = self.promote_next(&mut record, gpu, now);
            (
                Release { released, promoted },
                notices,
                DeviceSnapshot::capture(&record),
            )
        };

        self.finish(notices, Some(snapshot)).await;
        Ok(release)
    }

    /// Leave a queue; only waiting reservations can be cancelled
    pub async fn cancel(
        &self,
        gpu: &str,
        reservation_id: Uuid,
        username: &str,
    ) -> GpushareResult<Reservation> {
        let actor = self.actor(username).await?;
        let handle = self.store.device_for_gpu(gpu).await?;

        let (cancelled, snapshot) = {
            let mut record = handle.lock().await;
            authorize(&actor, &record.device)?;

            let gpu_record = record.gpu_or_not_found(gpu)?;
            let reservation = gpu_record.queue.get(reservation_id).ok_or_else(|| {
                GpushareError::NotFound(format!("Reservation {}", reservation_id))
            })?;
            if reservation.user != actor.username {
                return Err(GpushareError::Unauthorized(format!(
                    "Reservation {} belongs to another user",
                    reservation_id
                )));
            }
            if reservation.is_current() {
                return Err(GpushareError::Policy(format!(
                    "Reservation {} is in use; release the GPU instead of cancelling",
                    reservation_id
                )));
            }

            let cancelled = gpu_record.queue.remove_waiting(reservation_id).ok_or_else(|| {
                GpushareError::NotFound(format!("Reservation {}", reservation_id))
            })?;
            info!(gpu = %gpu, user = %actor.username, "Reservation cancelled");

            (cancelled, DeviceSnapshot::capture(&record))
        };

        self.finish(Vec::new(), Some(snapshot)).await;
        Ok(cancelled)
    }

    /// Renew the usage window once the reminder threshold is reached
    pub async fn extend(
        &self,
        gpu: &str,
        reservation_id: Uuid,
        username: &str,
    ) -> GpushareResult<Reservation> {
        let actor = self.actor(username).await?;
        let handle = self.store.device_for_gpu(gpu).await?;
        let now = self.clock.now();
        let reminder_period = self.config.reminder_period();

        let (extended, snapshot) = {
            let mut record = handle.lock().await;
            authorize(&actor, &record.device)?;

            let gpu_record = record.gpu_or_not_found(gpu)?;
            let in_queue = gpu_record.queue.get(reservation_id).is_some();
            let current = gpu_record.queue.current_mut().ok_or_else(|| {
                GpushareError::NotFound(format!("No current reservation on GPU {}", gpu))
            })?;
            if current.id != reservation_id {
                return Err(if in_queue {
                    GpushareError::Unauthorized(format!(
                        "Reservation {} is not the current holder of GPU {}",
                        reservation_id, gpu
                    ))
                } else {
                    GpushareError::NotFound(format!("Reservation {}", reservation_id))
                });
            }
            if current.user != actor.username {
                return Err(GpushareError::Unauthorized(format!(
                    "{} does not hold GPU {}",
                    actor.username, gpu
                )));
            }
            if current.is_expired(now) {
                return Err(GpushareError::Policy(format!(
                    "Reservation {} expired at {}",
                    reservation_id,
                    describe(current.usage_expires)
                )));
            }
            if !current.reminder_due(now, reminder_period) {
                let opens = current.usage_expires.map(|e| e - reminder_period);
                return Err(GpushareError::Policy(format!(
                    "Too early to extend; extension opens at {}",
                    describe(opens)
                )));
            }

            current.extend(now, self.config.usage_period());
            let extended = current.clone();
            info!(
                gpu = %gpu,
                user = %actor.username,
                expires = %describe(extended.usage_expires),
                "Reservation extended"
            );

            (extended, DeviceSnapshot::capture(&record))
        };

        self.finish(Vec::new(), Some(snapshot)).await;
        Ok(extended)
    }

    /// Expire overdue usage windows and send due reminders
    ///
    /// Only current reservations are considered; waiting ones never expire.
    pub async fn sweep(&self) -> SweepReport {
        let now = self.clock.now();
        let reminder_period = self.config.reminder_period();
        let mut report = SweepReport::default();

        for handle in self.store.devices().await {
            let (notices, snapshot) = {
                let mut record = handle.lock().await;
                let mut notices = Vec::new();
                let mut changed = false;

                for index in 0..record.gpus.len() {
                    let uuid = record.gpus[index].gpu.uuid.clone();
                    let model = record.gpus[index].gpu.model_name.clone();
                    let queue = &mut record.gpus[index].queue;

                    let Some(current) = queue.current_mut() else {
                        continue;
                    };

                    if current.is_expired(now) {
                        let Some(expired) = queue.pop_current() else {
                            continue;
                        };
                        info!(gpu = %uuid, user = %expired.user, "Reservation expired");
                        notices.push(Notice::Expired {
                            reservation: expired,
                            model,
                        });
                        let (_, promoted) = self.promote_next(&mut record, &uuid, now);
                        notices.extend(promoted);
                        report.expired += 1;
                        changed = true;
                    } else if current.reminder_due(now, reminder_period)
                        && !current.extension_reminder_sent
                    {
                        current.extension_reminder_sent = true;
                        debug!(gpu = %uuid, user = %current.user, "Sending extension reminder");
                        notices.push(Notice::Reminder {
                            reservation: current.clone(),
                            model,
                        });
                        report.reminded += 1;
                    }
                }

                let snapshot = changed.then(|| DeviceSnapshot::capture(&record));
                (notices, snapshot)
            };

            self.finish(notices, snapshot).await;
        }

        if report != SweepReport::default() {
            info!(
                expired = report.expired,
                reminded = report.reminded,
                "Reservation sweep finished"
            );
        }
        report
    }

    /// Number of reservations ahead of the user on a GPU
    pub async fn queue_position(&self, gpu: &str, username: &str) -> GpushareResult<Option<usize>> {
        let actor = self.actor(username).await?;
        let handle = self.store.device_for_gpu(gpu).await?;
        let record = handle.lock().await;
        authorize(&actor, &record.device)?;

        let gpu_record = record
            .gpu(gpu)
            .ok_or_else(|| GpushareError::NotFound(format!("GPU {}", gpu)))?;
        Ok(gpu_record.queue.position_of(&actor.username))
    }

    /// Snapshot of one device as seen by a user
    pub async fn device_snapshot(&self, device: &str, username: &str) -> GpushareResult<DeviceSnapshot> {
        let actor = self.actor(username).await?;
        let handle = self.store.device(device).await?;
        let record = handle.lock().await;
        authorize(&actor, &record.device)?;
        Ok(DeviceSnapshot::capture(&record))
    }

    /// Snapshots of every device the user may use
    pub async fn visible_snapshots(&self, username: &str) -> GpushareResult<Vec<DeviceSnapshot>> {
        let actor = self.actor(username).await?;
        let mut snapshots = Vec::new();
        for handle in self.store.devices().await {
            let record = handle.lock().await;
            if record.device.can_be_used_by(&actor) {
                snapshots.push(DeviceSnapshot::capture(&record));
            }
        }
        Ok(snapshots)
    }

    /// Send a message written by a user to chosen users, or to everyone
    ///
    /// Messaging every user is reserved for staff. Returns how many users
    /// the message went to. Unlike queue notices, a delivery failure is
    /// returned to the sender since nothing else changed.
    pub async fn send_message(
        &self,
        username: &str,
        recipients: &[String],
        all_users: bool,
        subject: &str,
        body: &str,
    ) -> GpushareResult<usize> {
        let sender = self.actor(username).await?;

        let (mail, count) = if all_users {
            if !sender.staff {
                return Err(GpushareError::Unauthorized(format!(
                    "{} may not message all users",
                    sender.username
                )));
            }
            let mut everyone = self.store.users().await;
            everyone.sort_by(|a, b| a.username.cmp(&b.username));
            let count = everyone
                .iter()
                .filter(|user| user.username != sender.username)
                .count();
            (
                self.notices.message_all(&sender, &everyone, subject, body),
                count,
            )
        } else {
            if recipients.is_empty() {
                return Err(GpushareError::Policy(
                    "Select at least one recipient".to_string(),
                ));
            }
            let mut users: Vec<User> = Vec::with_capacity(recipients.len());
            for name in recipients {
                if users.iter().any(|user| &user.username == name) {
                    continue;
                }
                let user = self
                    .store
                    .user(name)
                    .await
                    .ok_or_else(|| GpushareError::NotFound(format!("User {}", name)))?;
                users.push(user);
            }
            let count = users.len();
            (
                self.notices.user_message(&sender, &users, subject, body),
                count,
            )
        };

        self.notifier.send(&mail).await?;
        info!(
            sender = %sender.username,
            recipients = count,
            all_users = all_users,
            "Message sent"
        );
        Ok(count)
    }

    /// Open the next usage window on a GPU whose holder just left
    ///
    /// A promoted next-available-spot reservation takes its owner's sibling
    /// waiting reservations on the same device with it.
    fn promote_next(
        &self,
        record: &mut DeviceRecord,
        gpu: &str,
        now: DateTime<Utc>,
    ) -> (Option<Reservation>, Vec<Notice>) {
        let Some(gpu_record) = record.gpu_mut(gpu) else {
            return (None, Vec::new());
        };
        let model = gpu_record.gpu.model_name.clone();
        let Some(promoted) = gpu_record
            .queue
            .promote(now, self.config.usage_period())
            .cloned()
        else {
            return (None, Vec::new());
        };

        info!(gpu = %gpu, user = %promoted.user, "Reservation promoted");

        if promoted.user_reserved_next_available_spot {
            let purged = record.purge_next_available(&promoted.user, gpu);
            debug!(
                gpu = %gpu,
                user = %promoted.user,
                purged = purged.len(),
                "Removed sibling next-available reservations"
            );
        }

        let notices = vec![Notice::Ready {
            reservation: promoted.clone(),
            model,
        }];
        (Some(promoted), notices)
    }

    async fn actor(&self, username: &str) -> GpushareResult<User> {
        self.store
            .user(username)
            .await
            .ok_or_else(|| GpushareError::Unauthenticated(format!("Unknown user {}", username)))
    }

    async fn render(&self, notice: Notice) -> Option<Mail> {
        let recipient = match &notice {
            Notice::Queued { holder, .. } => holder.clone(),
            Notice::Ready { reservation, .. }
            | Notice::Expired { reservation, .. }
            | Notice::Reminder { reservation, .. } => reservation.user.clone(),
        };
        let Some(user) = self.store.user(&recipient).await else {
            debug!(user = %recipient, "No addresses for notice recipient");
            return None;
        };

        let mail = match notice {
            Notice::Queued {
                reservation, model, ..
            } => self.notices.reservation_queued(&user, &reservation, &model),
            Notice::Ready { reservation, model } => {
                self.notices.gpu_ready(&user, &reservation, &model)
            }
            Notice::Expired { reservation, model } => {
                self.notices.reservation_expired(&user, &reservation, &model)
            }
            Notice::Reminder { reservation, model } => {
                self.notices.extension_reminder(&user, &reservation, &model)
            }
        };
        Some(mail)
    }

    async fn finish(&self, notices: Vec<Notice>, snapshot: Option<DeviceSnapshot>) {
        let mut mails = Vec::with_capacity(notices.len());
        for notice in notices {
            if let Some(mail) = self.render(notice).await {
                mails.push(mail);
            }
        }
        deliver(self.notifier.as_ref(), mails).await;

        if let Some(snapshot) = snapshot {
            announce(
                self.broadcaster.as_ref(),
                &snapshot.name,
                snapshot.to_message(),
            )
            .await;
        }
    }
}

fn authorize(user: &User, device: &Device) -> GpushareResult<()> {
    if device.can_be_used_by(user) {
        Ok(())
    } else {
        Err(GpushareError::Unauthorized(format!(
            "{} may not use device {}",
            user.username, device.name
        )))
    }
}

fn describe(time: Option<DateTime<Utc>>) -> String {
    time.map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use gpushare_core::{DeviceAccess, Gpu, ManualClock, NotificationConfig};
    use gpushare_notify::{ChannelBroadcaster, MemoryNotifier};
    use gpushare_store::GpuRecord;

    struct Harness {
        engine: Arc<QueueEngine>,
        store: Arc<EntityStore>,
        clock: Arc<ManualClock>,
        notifier: Arc<MemoryNotifier>,
        broadcaster: Arc<ChannelBroadcaster>,
    }

    async fn harness(gpus: &[&str]) -> Harness {
        let store = Arc::new(EntityStore::new());
        for name in ["alice", "bob", "carol", "dave"] {
            store
                .add_user(User::new(name, format!("{}@example.org", name)))
                .await;
        }
        store.add_device(Device::new("box", "box:8080")).await.unwrap();
        let mut restricted = Device::new("private", "private:8080");
        restricted.access = DeviceAccess::Users(["alice".to_string()].into_iter().collect());
        store.add_device(restricted).await.unwrap();

        let now = Utc::now();
        for (device, uuids) in [("box", gpus), ("private", &["GPU-P"][..])] {
            let handle = store.device(device).await.unwrap();
            let mut record = handle.lock().await;
            for uuid in uuids {
                store.claim_gpu(uuid, device).await.unwrap();
                record.gpus.push(GpuRecord::new(Gpu {
                    uuid: uuid.to_string(),
                    device: device.to_string(),
                    model_name: "Tesla K80".to_string(),
                    used_memory: "0 MiB".to_string(),
                    total_memory: "11439 MiB".to_string(),
                    utilization: None,
                    in_use: false,
                    marked_as_failed: false,
                    last_updated: now,
                }));
            }
        }

        let clock = Arc::new(ManualClock::new(now));
        let notifier = Arc::new(MemoryNotifier::new());
        let broadcaster = Arc::new(ChannelBroadcaster::new());
        let engine = Arc::new(QueueEngine::new(
            store.clone(),
            notifier.clone(),
            broadcaster.clone(),
            clock.clone(),
            Notices::new(&NotificationConfig::default()),
            ReservationConfig {
                usage_period_secs: 24 * 3600,
                reminder_period_secs: 3600,
                sweep_interval_secs: 60,
            },
        ));

        Harness {
            engine,
            store,
            clock,
            notifier,
            broadcaster,
        }
    }

    async fn queue_of(store: &EntityStore, gpu: &str) -> Vec<Reservation> {
        let handle = store.device_for_gpu(gpu).await.unwrap();
        let record = handle.lock().await;
        let gpu = record.gpu(gpu).unwrap();
        assert!(gpu.queue.invariant_holds());
        gpu.queue.iter().cloned().collect()
    }

    #[tokio::test]
    async fn test_reserve_specific_starts_then_queues() {
        let h = harness(&["GPU-1"]).await;

        let first = h.engine.reserve_specific("GPU-1", "alice").await.unwrap();
        assert!(first.is_current());
        assert!(h.notifier.take().await.is_empty());

        h.clock.advance(Duration::seconds(1));
        let second = h.engine.reserve_specific("GPU-1", "bob").await.unwrap();
        assert!(!second.is_current());

        let sent = h.notifier.take().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, vec!["alice@example.org"]);

        let queue = queue_of(&h.store, "GPU-1").await;
        assert_eq!(queue.len(), 2);
        assert_eq!(queue[0].user, "alice");
    }

    #[tokio::test]
    async fn test_reserve_requires_access() {
        let h = harness(&["GPU-1"]).await;

        assert!(matches!(
            h.engine.reserve_specific("GPU-P", "bob").await,
            Err(GpushareError::Unauthorized(_))
        ));
        assert!(matches!(
            h.engine.reserve_specific("GPU-1", "mallory").await,
            Err(GpushareError::Unauthenticated(_))
        ));
        assert!(matches!(
            h.engine.reserve_specific("GPU-404", "alice").await,
            Err(GpushareError::NotFound(_))
        ));
        assert!(h.engine.reserve_specific("GPU-P", "alice").await.is_ok());
    }

    #[tokio::test]
    async fn test_next_available_takes_free_gpu() {
        let h = harness(&["GPU-1", "GPU-2"]).await;
        h.engine.reserve_specific("GPU-2", "alice").await.unwrap();

        let outcome = h.engine.reserve_next_available("box", "bob").await.unwrap();
        let NextAvailable::Ready(reservation) = outcome else {
            panic!("expected a ready reservation");
        };
        assert_eq!(reservation.gpu, "GPU-1");
        assert!(reservation.is_current());
        assert!(!reservation.user_reserved_next_available_spot);

        assert_eq!(queue_of(&h.store, "GPU-1").await.len(), 1);
        assert_eq!(queue_of(&h.store, "GPU-2").await.len(), 1);

        let sent = h.notifier.take().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, vec!["bob@example.org"]);
    }

    #[tokio::test]
    async fn test_next_available_promotion_purges_siblings() {
        let h = harness(&["GPU-1", "GPU-2"]).await;
        let held = h.engine.reserve_specific("GPU-1", "alice").await.unwrap();
        h.engine.reserve_specific("GPU-2", "bob").await.unwrap();

        h.clock.advance(Duration::seconds(1));
        let NextAvailable::Queued(queued) =
            h.engine.reserve_next_available("box", "carol").await.unwrap()
        else {
            panic!("expected queued reservations");
        };
        assert_eq!(queued.len(), 2);
        assert!(queued
            .iter()
            .all(|r| r.user_reserved_next_available_spot && !r.is_current()));
        h.notifier.take().await;

        h.clock.advance(Duration::minutes(10));
        let release = h.engine.release("GPU-1", held.id, "alice").await.unwrap();
        let promoted = release.promoted.unwrap();
        assert_eq!(promoted.user, "carol");
        assert_eq!(promoted.usage_started, Some(h.clock.now()));

        let gpu1 = queue_of(&h.store, "GPU-1").await;
        assert_eq!(gpu1.len(), 1);
        assert_eq!(gpu1[0].user, "carol");
        let gpu2 = queue_of(&h.store, "GPU-2").await;
        assert_eq!(gpu2.len(), 1);
        assert_eq!(gpu2[0].user, "bob");

        let sent = h.notifier.take().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, vec!["carol@example.org"]);
    }

    #[tokio::test]
    async fn test_expiry_promotion_purges_siblings() {
        let h = harness(&["GPU-1", "GPU-2"]).await;
        let start = h.clock.now();
        h.engine.reserve_specific("GPU-1", "alice").await.unwrap();
        h.clock.advance(Duration::hours(1));
        h.engine.reserve_specific("GPU-2", "bob").await.unwrap();
        h.engine.reserve_next_available("box", "carol").await.unwrap();
        h.notifier.take().await;

        h.clock.set(start + Duration::hours(24) + Duration::seconds(1));
        let report = h.engine.sweep().await;
        assert_eq!(report.expired, 1);
        // GPU-2 is inside its reminder window but not yet expired
        assert_eq!(report.reminded, 1);

        let gpu1 = queue_of(&h.store, "GPU-1").await;
        assert_eq!(gpu1.len(), 1);
        assert_eq!(gpu1[0].user, "carol");
        assert_eq!(gpu1[0].usage_started, Some(h.clock.now()));
        let gpu2 = queue_of(&h.store, "GPU-2").await;
        assert_eq!(gpu2.len(), 1);
        assert_eq!(gpu2[0].user, "bob");

        let sent = h.notifier.take().await;
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0].to, vec!["alice@example.org"]);
        assert!(sent[0].subject.contains("expired"));
        assert_eq!(sent[1].to, vec!["carol@example.org"]);
        assert_eq!(sent[2].to, vec!["bob@example.org"]);
    }

    #[tokio::test]
    async fn test_release_rules() {
        let h = harness(&["GPU-1"]).await;
        let dummy = Uuid::new_v4();
        assert!(matches!(
            h.engine.release("GPU-1", dummy, "alice").await,
            Err(GpushareError::NotFound(_))
        ));

        let alice = h.engine.reserve_specific("GPU-1", "alice").await.unwrap();
        let bob = h.engine.reserve_specific("GPU-1", "bob").await.unwrap();

        assert!(matches!(
            h.engine.release("GPU-1", alice.id, "bob").await,
            Err(GpushareError::Unauthorized(_))
        ));
        assert!(matches!(
            h.engine.release("GPU-1", bob.id, "bob").await,
            Err(GpushareError::Unauthorized(_))
        ));
        assert!(matches!(
            h.engine.release("GPU-1", dummy, "alice").await,
            Err(GpushareError::NotFound(_))
        ));

        h.clock.advance(Duration::hours(2));
        let release = h.engine.release("GPU-1", alice.id, "alice").await.unwrap();
        assert_eq!(release.released.id, alice.id);

        let queue = queue_of(&h.store, "GPU-1").await;
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].id, bob.id);
        assert_eq!(queue[0].usage_started, Some(h.clock.now()));
        assert_eq!(
            queue[0].usage_expires,
            Some(h.clock.now() + Duration::hours(24))
        );

        let last = h.engine.release("GPU-1", bob.id, "bob").await.unwrap();
        assert!(last.promoted.is_none());
        assert!(queue_of(&h.store, "GPU-1").await.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_releases_promote_once() {
        let h = harness(&["GPU-1"]).await;
        let alice = h.engine.reserve_specific("GPU-1", "alice").await.unwrap();
        h.engine.reserve_specific("GPU-1", "bob").await.unwrap();
        h.engine.reserve_specific("GPU-1", "carol").await.unwrap();

        let (a, b) = tokio::join!(
            h.engine.release("GPU-1", alice.id, "alice"),
            h.engine.release("GPU-1", alice.id, "alice"),
        );
        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);

        let queue = queue_of(&h.store, "GPU-1").await;
        assert_eq!(queue.len(), 2);
        assert_eq!(queue[0].user, "bob");
        assert!(queue[0].is_current());
        assert!(!queue[1].is_current());
    }

    #[tokio::test]
    async fn test_cancel_only_waiting_own_reservations() {
        let h = harness(&["GPU-1"]).await;
        let alice = h.engine.reserve_specific("GPU-1", "alice").await.unwrap();
        let bob = h.engine.reserve_specific("GPU-1", "bob").await.unwrap();

        assert!(matches!(
            h.engine.cancel("GPU-1", alice.id, "alice").await,
            Err(GpushareError::Policy(_))
        ));
        assert!(matches!(
            h.engine.cancel("GPU-1", bob.id, "alice").await,
            Err(GpushareError::Unauthorized(_))
        ));

        let cancelled = h.engine.cancel("GPU-1", bob.id, "bob").await.unwrap();
        assert_eq!(cancelled.id, bob.id);
        assert!(matches!(
            h.engine.cancel("GPU-1", bob.id, "bob").await,
            Err(GpushareError::NotFound(_))
        ));
        assert_eq!(queue_of(&h.store, "GPU-1").await.len(), 1);
    }

    #[tokio::test]
    async fn test_extend_only_after_reminder_threshold() {
        let h = harness(&["GPU-1"]).await;
        let alice = h.engine.reserve_specific("GPU-1", "alice").await.unwrap();
        let bob = h.engine.reserve_specific("GPU-1", "bob").await.unwrap();

        h.clock.advance(Duration::hours(2));
        assert!(matches!(
            h.engine.extend("GPU-1", alice.id, "alice").await,
            Err(GpushareError::Policy(_))
        ));
        assert!(matches!(
            h.engine.extend("GPU-1", bob.id, "bob").await,
            Err(GpushareError::Unauthorized(_))
        ));

        h.clock.advance(Duration::hours(21) + Duration::minutes(30));
        assert_eq!(h.engine.sweep().await.reminded, 1);

        let extended = h.engine.extend("GPU-1", alice.id, "alice").await.unwrap();
        assert_eq!(
            extended.usage_expires,
            Some(h.clock.now() + Duration::hours(24))
        );
        assert!(!extended.extension_reminder_sent);
    }

    #[tokio::test]
    async fn test_extend_rejected_after_expiry() {
        let h = harness(&["GPU-1"]).await;
        let alice = h.engine.reserve_specific("GPU-1", "alice").await.unwrap();
        let bob = h.engine.reserve_specific("GPU-1", "bob").await.unwrap();

        h.clock.advance(Duration::hours(25));
        assert!(matches!(
            h.engine.extend("GPU-1", alice.id, "alice").await,
            Err(GpushareError::Policy(_))
        ));

        assert_eq!(h.engine.sweep().await.expired, 1);
        let queue = queue_of(&h.store, "GPU-1").await;
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].id, bob.id);
        assert!(queue[0].is_current());
    }

    #[tokio::test]
    async fn test_sweep_reminds_once_then_expires() {
        let h = harness(&["GPU-1"]).await;
        let alice = h.engine.reserve_specific("GPU-1", "alice").await.unwrap();
        h.engine.reserve_specific("GPU-1", "bob").await.unwrap();
        h.notifier.take().await;

        h.clock.advance(Duration::hours(22));
        assert_eq!(h.engine.sweep().await, SweepReport::default());

        h.clock.advance(Duration::hours(1));
        assert_eq!(h.engine.sweep().await.reminded, 1);
        assert_eq!(h.engine.sweep().await.reminded, 0);
        let sent = h.notifier.take().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, vec!["alice@example.org"]);

        let mut events = h.broadcaster.subscribe("box").await;
        h.clock.advance(Duration::hours(1) + Duration::seconds(1));
        let report = h.engine.sweep().await;
        assert_eq!(report.expired, 1);

        let queue = queue_of(&h.store, "GPU-1").await;
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].user, "bob");
        assert_eq!(queue[0].usage_started, Some(h.clock.now()));
        assert!(queue.iter().all(|r| r.id != alice.id));

        let sent = h.notifier.take().await;
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].to, vec!["alice@example.org"]);
        assert!(sent[0].subject.contains("expired"));
        assert_eq!(sent[1].to, vec!["bob@example.org"]);

        let message = events.try_recv().unwrap();
        let snapshot: DeviceSnapshot = serde_json::from_str(&message).unwrap();
        assert_eq!(snapshot.gpus[0].current_user.as_deref(), Some("bob"));
    }

    #[tokio::test]
    async fn test_notification_failure_keeps_state() {
        let h = harness(&["GPU-1"]).await;
        h.notifier.set_failing(true);
        h.engine.reserve_specific("GPU-1", "alice").await.unwrap();
        h.engine.reserve_specific("GPU-1", "bob").await.unwrap();
        assert_eq!(queue_of(&h.store, "GPU-1").await.len(), 2);
    }

    #[tokio::test]
    async fn test_every_change_is_broadcast() {
        let h = harness(&["GPU-1"]).await;
        let mut events = h.broadcaster.subscribe("box").await;

        let alice = h.engine.reserve_specific("GPU-1", "alice").await.unwrap();
        let bob = h.engine.reserve_specific("GPU-1", "bob").await.unwrap();
        h.engine.cancel("GPU-1", bob.id, "bob").await.unwrap();
        h.engine.release("GPU-1", alice.id, "alice").await.unwrap();

        let mut count = 0;
        while events.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, 4);
    }

    #[tokio::test]
    async fn test_queue_position_and_views() {
        let h = harness(&["GPU-1"]).await;
        h.engine.reserve_specific("GPU-1", "alice").await.unwrap();
        h.engine.reserve_specific("GPU-1", "bob").await.unwrap();

        assert_eq!(h.engine.queue_position("GPU-1", "alice").await.unwrap(), Some(0));
        assert_eq!(h.engine.queue_position("GPU-1", "bob").await.unwrap(), Some(1));
        assert_eq!(h.engine.queue_position("GPU-1", "carol").await.unwrap(), None);

        let snapshot = h.engine.device_snapshot("box", "carol").await.unwrap();
        assert_eq!(snapshot.gpus[0].next_users, vec!["bob"]);
        assert!(matches!(
            h.engine.device_snapshot("private", "carol").await,
            Err(GpushareError::Unauthorized(_))
        ));
        assert_eq!(h.engine.visible_snapshots("carol").await.unwrap().len(), 1);
        assert_eq!(h.engine.visible_snapshots("alice").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_send_message_to_chosen_users() {
        let h = harness(&["GPU-1"]).await;
        let recipients = vec!["bob".to_string(), "carol".to_string(), "bob".to_string()];

        let sent = h
            .engine
            .send_message("alice", &recipients, false, "Hi", "Done with GPU-1 soon")
            .await
            .unwrap();
        assert_eq!(sent, 2);

        let mails = h.notifier.take().await;
        assert_eq!(mails.len(), 1);
        assert_eq!(mails[0].to, vec!["bob@example.org", "carol@example.org"]);
        assert_eq!(mails[0].cc, vec!["alice@example.org"]);

        assert!(matches!(
            h.engine.send_message("alice", &[], false, "Hi", "").await,
            Err(GpushareError::Policy(_))
        ));
        assert!(matches!(
            h.engine
                .send_message("alice", &["mallory".to_string()], false, "Hi", "")
                .await,
            Err(GpushareError::NotFound(_))
        ));
        assert!(h.notifier.take().await.is_empty());
    }

    #[tokio::test]
    async fn test_message_all_users_needs_staff() {
        let h = harness(&["GPU-1"]).await;
        assert!(matches!(
            h.engine.send_message("bob", &[], true, "All", "").await,
            Err(GpushareError::Unauthorized(_))
        ));

        let mut admin = User::new("admin", "admin@example.org");
        admin.staff = true;
        h.store.add_user(admin).await;

        let sent = h
            .engine
            .send_message("admin", &[], true, "Maintenance", "Down at noon")
            .await
            .unwrap();
        assert_eq!(sent, 4);

        let mails = h.notifier.take().await;
        assert_eq!(mails.len(), 1);
        assert_eq!(mails[0].to, vec!["admin@example.org"]);
        assert_eq!(
            mails[0].bcc,
            vec![
                "alice@example.org",
                "bob@example.org",
                "carol@example.org",
                "dave@example.org"
            ]
        );
    }

    #[tokio::test]
    async fn test_message_delivery_failure_is_returned() {
        let h = harness(&["GPU-1"]).await;
        h.notifier.set_failing(true);
        assert!(h
            .engine
            .send_message("alice", &["bob".to_string()], false, "Hi", "")
            .await
            .is_err());
    }
}
