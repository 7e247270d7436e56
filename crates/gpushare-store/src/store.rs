//! In-memory entity store
//!
//! Every device record (the device, its GPUs, their process sets and
//! reservation queues) sits behind its own async mutex. Mutations for one
//! device are serialized on that lock; different devices never contend.

use gpushare_core::{
    DaemonConfig, Device, Gpu, GpuProcess, GpushareError, GpushareResult, Reservation, User,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::queue::ReservationQueue;

/// A GPU with its process set and reservation queue
#[derive(Debug, Clone)]
pub struct GpuRecord {
    pub gpu: Gpu,
    pub processes: Vec<GpuProcess>,
    pub queue: ReservationQueue,
}

impl GpuRecord {
    pub fn new(gpu: Gpu) -> Self {
        Self {
            gpu,
            processes: Vec::new(),
            queue: ReservationQueue::new(),
        }
    }
}

/// A device and everything it owns
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    pub device: Device,
    /// GPUs in first-sighting order
    pub gpus: Vec<GpuRecord>,
}

impl DeviceRecord {
    pub fn new(device: Device) -> Self {
        Self {
            device,
            gpus: Vec::new(),
        }
    }

    pub fn gpu(&self, uuid: &str) -> Option<&GpuRecord> {
        self.gpus.iter().find(|g| g.gpu.uuid == uuid)
    }

    pub fn gpu_mut(&mut self, uuid: &str) -> Option<&mut GpuRecord> {
        self.gpus.iter_mut().find(|g| g.gpu.uuid == uuid)
    }

    pub fn gpu_or_not_found(&mut self, uuid: &str) -> GpushareResult<&mut GpuRecord> {
        let device = self.device.name.clone();
        self.gpu_mut(uuid)
            .ok_or_else(|| GpushareError::NotFound(format!("GPU {} on device {}", uuid, device)))
    }

    /// Drop the user's waiting next-available-spot reservations on every
    /// GPU of this device other than `except_gpu`
    pub fn purge_next_available(&mut self, user: &str, except_gpu: &str) -> Vec<Reservation> {
        let mut purged = Vec::new();
        for record in self.gpus.iter_mut().filter(|g| g.gpu.uuid != except_gpu) {
            purged.extend(
                record
                    .queue
                    .drain_waiting(|r| r.user == user && r.user_reserved_next_available_spot),
            );
        }
        purged
    }

    /// All reservations on this device, by GPU order then queue order
    pub fn reservations(&self) -> impl Iterator<Item = &Reservation> {
        self.gpus.iter().flat_map(|g| g.queue.iter())
    }
}

/// Shared handle to one device record
pub type DeviceHandle = Arc<Mutex<DeviceRecord>>;

/// Entity store shared by the queue engine and the reconciler
#[derive(Debug, Default)]
pub struct EntityStore {
    users: RwLock<HashMap<String, User>>,
    devices: RwLock<BTreeMap<String, DeviceHandle>>,
    /// GPU uuid to owning device name
    gpu_owners: RwLock<HashMap<String, String>>,
}

impl EntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed devices and users from configuration
    pub async fn load(&self, config: &DaemonConfig) -> GpushareResult<()> {
        for user in &config.users {
            self.add_user(user.clone().into()).await;
        }
        for device in &config.devices {
            self.add_device(device.clone().into()).await?;
        }
        info!(
            devices = config.devices.len(),
            users = config.users.len(),
            "Entity store loaded"
        );
        Ok(())
    }

    /// Add or replace a user
    pub async fn add_user(&self, user: User) {
        debug!(user = %user.username, "Registering user");
        self.users.write().await.insert(user.username.clone(), user);
    }

    pub async fn user(&self, username: &str) -> Option<User> {
        self.users.read().await.get(username).cloned()
    }

    pub async fn users(&self) -> Vec<User> {
        self.users.read().await.values().cloned().collect()
    }

    /// Provision a device
    pub async fn add_device(&self, device: Device) -> GpushareResult<()> {
        let mut devices = self.devices.write().await;
        if devices.contains_key(&device.name) {
            return Err(GpushareError::Config(format!(
                "Device already exists: {}",
                device.name
            )));
        }
        debug!(device = %device.name, address = %device.address, "Registering device");
        devices.insert(
            device.name.clone(),
            Arc::new(Mutex::new(DeviceRecord::new(device))),
        );
        Ok(())
    }

    pub async fn device(&self, name: &str) -> GpushareResult<DeviceHandle> {
        self.devices
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| GpushareError::NotFound(format!("Device {}", name)))
    }

    /// All devices in name order
    pub async fn devices(&self) -> Vec<DeviceHandle> {
        self.devices.read().await.values().cloned().collect()
    }

    pub async fn device_names(&self) -> Vec<String> {
        self.devices.read().await.keys().cloned().collect()
    }

    /// Device that owns a GPU
    pub async fn device_for_gpu(&self, uuid: &str) -> GpushareResult<DeviceHandle> {
        let owner = self
            .gpu_owners
            .read()
            .await
            .get(uuid)
            .cloned()
            .ok_or_else(|| GpushareError::NotFound(format!("GPU {}", uuid)))?;
        self.device(&owner).await
    }

    /// Record that `device` owns the GPU `uuid`
    ///
    /// Fails if another device already owns that uuid. Callers hold the
    /// device's lock while claiming and inserting the GPU record.
    pub async fn claim_gpu(&self, uuid: &str, device: &str) -> GpushareResult<()> {
        let mut owners = self.gpu_owners.write().await;
        match owners.get(uuid) {
            Some(owner) if owner != device => Err(GpushareError::Ingestion(format!(
                "GPU {} already belongs to device {}",
                uuid, owner
            ))),
            Some(_) => Ok(()),
            None => {
                owners.insert(uuid.to_string(), device.to_string());
                Ok(())
            }
        }
    }

    pub async fn gpu_count(&self) -> usize {
        self.gpu_owners.read().await.len()
    }

    /// Find a reservation by id on the device that owns `gpu`
    pub async fn reservation(&self, gpu: &str, id: Uuid) -> GpushareResult<Reservation> {
        let handle = self.device_for_gpu(gpu).await?;
        let record = handle.lock().await;
        record
            .gpu(gpu)
            .and_then(|g| g.queue.get(id))
            .cloned()
            .ok_or_else(|| GpushareError::NotFound(format!("Reservation {}", id)))
    }
}
