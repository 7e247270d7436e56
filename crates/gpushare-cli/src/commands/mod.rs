//! CLI commands implementation

use anyhow::Result;
use chrono::{DateTime, Utc};
use gpushare_core::{GpuProcess, Reservation};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

/// API client for communicating with the daemon
pub struct ApiClient {
    base_url: String,
    user_header: String,
    user: Option<String>,
    client: reqwest::Client,
}

impl ApiClient {
    pub fn new(base_url: &str, user_header: &str, user: Option<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            user_header: user_header.to_string(),
            user,
            client: reqwest::Client::new(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.with_user(self.client.get(self.url(path)))
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.with_user(self.client.post(self.url(path)))
    }

    fn with_user(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.user {
            Some(user) => request.header(self.user_header.as_str(), user.as_str()),
            None => request,
        }
    }
}

/// Device snapshot from API
#[derive(Debug, Deserialize)]
pub struct DeviceResponse {
    pub name: String,
    pub gpus: Vec<GpuResponse>,
}

/// GPU entry of a device snapshot
#[derive(Debug, Deserialize)]
pub struct GpuResponse {
    pub uuid: String,
    pub model_name: String,
    pub memory: String,
    pub utilization: Option<String>,
    pub processes: Vec<GpuProcess>,
    pub last_update: DateTime<Utc>,
    pub failed: bool,
    pub in_use: bool,
    pub current_user: Option<String>,
    pub usage_expires: Option<DateTime<Utc>>,
    pub next_users: Vec<String>,
}

/// Status response
#[derive(Debug, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub devices: usize,
    pub gpus: usize,
    pub users: usize,
}

#[derive(Debug, Deserialize)]
pub struct ReserveNextResponse {
    pub ready: bool,
    pub reservations: Vec<Reservation>,
}

#[derive(Debug, Deserialize)]
pub struct ReleaseResponse {
    pub released: Reservation,
    pub promoted: Option<Reservation>,
}

#[derive(Debug, Deserialize)]
pub struct PositionResponse {
    pub gpu: String,
    pub position: Option<usize>,
}

/// Message to other users
#[derive(Debug, Serialize)]
pub struct MessageRequest {
    pub recipients: Vec<String>,
    pub all_users: bool,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Deserialize)]
pub struct MessageResponse {
    pub sent: usize,
}

/// List devices
pub async fn devices(client: &ApiClient) -> Result<()> {
    let response = client.get("/api/v1/devices").send().await?;

    if response.status().is_success() {
        let devices: Vec<DeviceResponse> = response.json().await?;

        if devices.is_empty() {
            println!("No devices available");
        } else {
            println!(
                "{:<16} {:<40} {:<20} {:<24} {:<8} {:<12} {:<6}",
                "DEVICE", "GPU", "MODEL", "MEMORY", "STATE", "HOLDER", "QUEUE"
            );
            println!("{}", "-".repeat(132));
            for device in devices {
                for gpu in device.gpus {
                    println!(
                        "{:<16} {:<40} {:<20} {:<24} {:<8} {:<12} {:<6}",
                        device.name,
                        gpu.uuid,
                        gpu.model_name,
                        gpu.memory,
                        gpu_state(&gpu),
                        gpu.current_user.as_deref().unwrap_or("-"),
                        gpu.next_users.len()
                    );
                }
            }
        }
    } else {
        let error = response.text().await?;
        eprintln!("Failed to list devices: {}", error);
    }

    Ok(())
}

/// Show a device, or the daemon status
pub async fn status(client: &ApiClient, device: Option<String>) -> Result<()> {
    match device {
        Some(name) => {
            let response = client
                .get(&format!("/api/v1/devices/{}", name))
                .send()
                .await?;

            if response.status().is_success() {
                let device: DeviceResponse = response.json().await?;
                print_device_details(&device);
            } else {
                let error = response.text().await?;
                eprintln!("Device not found: {}", error);
            }
        }
        None => {
            let response = client.get("/api/v1/status").send().await?;

            if response.status().is_success() {
                let status: StatusResponse = response.json().await?;
                println!("gpushare v{}", status.version);
                println!();
                println!("Devices: {}", status.devices);
                println!("GPUs: {}", status.gpus);
                println!("Users: {}", status.users);
            } else {
                let error = response.text().await?;
                eprintln!("Failed to get status: {}", error);
            }
        }
    }

    Ok(())
}

/// Queue for a specific GPU
pub async fn reserve(client: &ApiClient, gpu: String) -> Result<()> {
    let response = client
        .post(&format!("/api/v1/gpus/{}/reserve", gpu))
        .send()
        .await?;

    if response.status().is_success() {
        let reservation: Reservation = response.json().await?;
        print_reservation(&reservation);
    } else {
        let error = response.text().await?;
        eprintln!("Failed to reserve GPU: {}", error);
    }

    Ok(())
}

/// Take the next free GPU on a device, or queue on all of them
pub async fn reserve_next(client: &ApiClient, device: String) -> Result<()> {
    let response = client
        .post(&format!("/api/v1/devices/{}/reserve", device))
        .send()
        .await?;

    if response.status().is_success() {
        let outcome: ReserveNextResponse = response.json().await?;
        if outcome.ready {
            println!("A GPU on '{}' was free", device);
        } else {
            println!(
                "All GPUs on '{}' are taken; queued on {} of them",
                device,
                outcome.reservations.len()
            );
        }
        for reservation in &outcome.reservations {
            print_reservation(reservation);
        }
    } else {
        let error = response.text().await?;
        eprintln!("Failed to reserve on device: {}", error);
    }

    Ok(())
}

/// Give up a held GPU
pub async fn release(client: &ApiClient, gpu: String, reservation: Uuid) -> Result<()> {
    let response = client
        .post(&format!(
            "/api/v1/gpus/{}/reservations/{}/release",
            gpu, reservation
        ))
        .send()
        .await?;

    if response.status().is_success() {
        let release: ReleaseResponse = response.json().await?;
        println!("Released GPU {}", release.released.gpu);
        match release.promoted {
            Some(next) => println!("  Now held by: {}", next.user),
            None => println!("  GPU is free"),
        }
    } else {
        let error = response.text().await?;
        eprintln!("Failed to release GPU: {}", error);
    }

    Ok(())
}

/// Leave a queue
pub async fn cancel(client: &ApiClient, gpu: String, reservation: Uuid) -> Result<()> {
    let response = client
        .post(&format!(
            "/api/v1/gpus/{}/reservations/{}/cancel",
            gpu, reservation
        ))
        .send()
        .await?;

    if response.status().is_success() {
        println!("Reservation {} cancelled", reservation);
    } else {
        let error = response.text().await?;
        eprintln!("Failed to cancel reservation: {}", error);
    }

    Ok(())
}

/// Renew a usage window
pub async fn extend(client: &ApiClient, gpu: String, reservation: Uuid) -> Result<()> {
    let response = client
        .post(&format!(
            "/api/v1/gpus/{}/reservations/{}/extend",
            gpu, reservation
        ))
        .send()
        .await?;

    if response.status().is_success() {
        let extended: Reservation = response.json().await?;
        println!(
            "Reservation extended until {}",
            format_time(extended.usage_expires)
        );
    } else {
        let error = response.text().await?;
        eprintln!("Failed to extend reservation: {}", error);
    }

    Ok(())
}

/// Show queue position
pub async fn position(client: &ApiClient, gpu: String) -> Result<()> {
    let response = client
        .get(&format!("/api/v1/gpus/{}/position", gpu))
        .send()
        .await?;

    if response.status().is_success() {
        let position: PositionResponse = response.json().await?;
        debug!(gpu = %position.gpu, position = ?position.position, "Queue position");
        match position.position {
            Some(0) => println!("You hold GPU {}", position.gpu),
            Some(ahead) => println!("{} reservation(s) ahead of you on {}", ahead, position.gpu),
            None => println!("You are not queued for {}", position.gpu),
        }
    } else {
        let error = response.text().await?;
        eprintln!("Failed to get queue position: {}", error);
    }

    Ok(())
}

/// Send a message to chosen users, or to everyone
pub async fn message(client: &ApiClient, request: &MessageRequest) -> Result<()> {
    let response = client.post("/api/v1/messages").json(request).send().await?;

    if response.status().is_success() {
        let receipt: MessageResponse = response.json().await?;
        println!("Message sent to {} user(s)", receipt.sent);
    } else {
        let error = response.text().await?;
        eprintln!("Failed to send message: {}", error);
    }

    Ok(())
}

fn gpu_state(gpu: &GpuResponse) -> &'static str {
    if gpu.failed {
        "FAILED"
    } else if gpu.in_use {
        "BUSY"
    } else {
        "IDLE"
    }
}

fn format_time(time: Option<DateTime<Utc>>) -> String {
    time.map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| "-".to_string())
}

/// Helper to print a reservation
fn print_reservation(reservation: &Reservation) {
    println!("Reservation: {}", reservation.id);
    println!("  GPU: {} on {}", reservation.gpu, reservation.device);
    if reservation.usage_started.is_some() {
        println!("  State: active until {}", format_time(reservation.usage_expires));
    } else {
        println!("  State: waiting");
    }
}

/// Helper to print device details
fn print_device_details(device: &DeviceResponse) {
    println!("Device: {}", device.name);
    for gpu in &device.gpus {
        println!();
        println!("  {} ({})", gpu.model_name, gpu.uuid);
        println!("    Memory: {}", gpu.memory);
        if let Some(utilization) = &gpu.utilization {
            println!("    Utilization: {}", utilization);
        }
        println!("    State: {}", gpu_state(gpu));
        println!("    Last update: {}", format_time(Some(gpu.last_update)));
        match &gpu.current_user {
            Some(user) => println!(
                "    Held by: {} until {}",
                user,
                format_time(gpu.usage_expires)
            ),
            None => println!("    Held by: -"),
        }
        if !gpu.next_users.is_empty() {
            println!("    Queue: {}", gpu.next_users.join(", "));
        }
        for process in &gpu.processes {
            println!(
                "    [{}] {} {} ({})",
                process.pid, process.name, process.memory_usage, process.username
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_url() {
        let client = ApiClient::new("http://localhost:9090/", "x-remote-user", None);
        assert_eq!(
            client.url("/api/v1/devices"),
            "http://localhost:9090/api/v1/devices"
        );
    }

    #[test]
    fn test_parse_device_snapshot() {
        let device: DeviceResponse = serde_json::from_value(serde_json::json!({
            "name": "box",
            "gpus": [{
                "uuid": "GPU-1",
                "model_name": "Tesla K80",
                "memory": "900 MiB / 11439 MiB",
                "used_memory": "900 MiB",
                "total_memory": "11439 MiB",
                "utilization": null,
                "processes": [],
                "last_update": "2024-01-01T00:00:00Z",
                "failed": true,
                "in_use": true,
                "reserved": false,
                "current_user": null,
                "usage_expires": null,
                "next_users": []
            }]
        }))
        .unwrap();
        assert_eq!(gpu_state(&device.gpus[0]), "FAILED");
        assert_eq!(format_time(None), "-");
    }

    #[test]
    fn test_message_request_body() {
        let request = MessageRequest {
            recipients: vec!["bob".to_string()],
            all_users: false,
            subject: "GPU-1".to_string(),
            body: "Done soon?".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            serde_json::json!({
                "recipients": ["bob"],
                "all_users": false,
                "subject": "GPU-1",
                "body": "Done soon?"
            })
        );

        let receipt: MessageResponse = serde_json::from_str(r#"{"sent": 3}"#).unwrap();
        assert_eq!(receipt.sent, 3);
    }
}
