//! Status snapshots reported through the management surface.

use std::net::IpAddr;
use std::time::SystemTime;

use serde::Serialize;

/// Snapshot of one checker.
#[derive(Debug, Clone, Serialize)]
pub struct CheckerStatus {
    #[serde(rename = "type")]
    pub kind: String,
    pub connect_ip: Option<IpAddr>,
    pub connect_port: Option<u16>,
    pub bind_ip: Option<IpAddr>,
    /// Seconds.
    pub connect_timeout: f64,
    /// Seconds.
    pub check_timeout: f64,
    pub fwmark: u32,
    pub path: String,
    pub status_code: Option<u16>,
    pub digest: Option<String>,
    pub virtualhost: Option<String>,
    pub dynamic_weight: bool,
    pub dynamic_weight_header: bool,
    pub dynamic_weight_coeff: u32,
    /// Seconds.
    pub delay_loop: f64,
    pub retries: u32,
    /// Seconds.
    pub retry_delay: f64,
    pub alive: bool,
    pub failed_attempts: u32,
    /// Unix timestamp of the last completed check, seconds.
    pub last_check_ts: Option<u64>,
}

/// Snapshot of one real server and its checkers.
#[derive(Debug, Clone, Serialize)]
pub struct RealStatus {
    pub ip: IpAddr,
    pub port: Option<u16>,
    pub alive: bool,
    pub weight: u32,
    pub transitions: u64,
    pub checkers: Vec<CheckerStatus>,
}

/// Snapshot of one virtual service and its reals.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub vip: IpAddr,
    pub vport: Option<u16>,
    pub proto: String,
    pub lvs_method: String,
    pub alive: bool,
    /// Aggregate weight of the alive reals.
    pub weight: i32,
    pub reals_alive: usize,
    /// Number of quorum flips since the service was created.
    pub transitions: u64,
    pub reals: Vec<RealStatus>,
}

/// Full status of the health-checking core.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    /// Unix timestamp of the last successful reload, seconds.
    pub update_timestamp: Option<u64>,
    pub services: Vec<ServiceStatus>,
}

pub(crate) fn unix_seconds(ts: SystemTime) -> u64 {
    ts.duration_since(SystemTime::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}
