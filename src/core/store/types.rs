use serde::{Deserialize, Serialize};

use crate::core::orchestrator::{JobKind, JobStatus, MaintenanceAction};
use crate::core::precheck::CheckResult;
use crate::core::profile::DeviceProfile;
use crate::core::transport::ChannelState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageStatus {
    NotCopied,
    Copied,
    Verified,
    VerificationFailed,
}

impl ImageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ImageStatus::NotCopied => "not_copied",
            ImageStatus::Copied => "copied",
            ImageStatus::Verified => "verified",
            ImageStatus::VerificationFailed => "verification_failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "not_copied" => Some(ImageStatus::NotCopied),
            "copied" => Some(ImageStatus::Copied),
            "verified" => Some(ImageStatus::Verified),
            "verification_failed" => Some(ImageStatus::VerificationFailed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrecheckStatus {
    NotRun,
    Pass,
    Warning,
    Fail,
}

impl PrecheckStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PrecheckStatus::NotRun => "not_run",
            PrecheckStatus::Pass => "pass",
            PrecheckStatus::Warning => "warning",
            PrecheckStatus::Fail => "fail",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "not_run" => Some(PrecheckStatus::NotRun),
            "pass" => Some(PrecheckStatus::Pass),
            "warning" => Some(PrecheckStatus::Warning),
            "fail" => Some(PrecheckStatus::Fail),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reachability {
    Online,
    Offline,
}

impl Reachability {
    pub fn as_str(self) -> &'static str {
        match self {
            Reachability::Online => "online",
            Reachability::Offline => "offline",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "online" => Some(Reachability::Online),
            "offline" => Some(Reachability::Offline),
            _ => None,
        }
    }
}

/// Free space on one stack member's filesystem. `free_bytes` is `None` when
/// the device did not report it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberSpace {
    pub member: u32,
    pub filesystem: String,
    pub free_bytes: Option<u64>,
    pub total_bytes: Option<u64>,
}

/// What discovery learned about a device.
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    pub address: String,
    pub hostname: Option<String>,
    pub serial: Option<String>,
    pub model: String,
    pub profile: DeviceProfile,
    pub version: String,
    pub boot_variable: Option<String>,
    pub ignore_startup_config: Option<bool>,
    pub config_register: Option<String>,
    pub members: Vec<MemberSpace>,
    pub channel_state: ChannelState,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceRecord {
    pub address: String,
    pub hostname: Option<String>,
    pub serial: Option<String>,
    pub model: String,
    pub profile: DeviceProfile,
    pub version: Option<String>,
    pub boot_variable: Option<String>,
    pub ignore_startup_config: Option<bool>,
    pub config_register: Option<String>,
    pub members: Vec<MemberSpace>,
    pub target_image: Option<String>,
    pub image_status: ImageStatus,
    pub precheck_status: PrecheckStatus,
    pub precheck_summary: Option<String>,
    pub channel_state: ChannelState,
    pub reachability: Reachability,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PrecheckRecord {
    pub address: String,
    pub check_name: String,
    pub result: CheckResult,
    pub message: String,
    pub checked_at: String,
}

/// Job as stored. Timestamps are RFC 3339 UTC.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub job_id: String,
    pub kind: JobKind,
    pub device: String,
    pub image: Option<String>,
    pub target_version: Option<String>,
    pub action: Option<MaintenanceAction>,
    pub status: JobStatus,
    pub scheduled_at: Option<String>,
    pub timezone: Option<String>,
    pub summary: Option<String>,
    pub error: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub kind: JobKind,
    pub device: String,
    pub image: Option<String>,
    pub target_version: Option<String>,
    pub action: Option<MaintenanceAction>,
    pub scheduled_at: Option<chrono::DateTime<chrono::Utc>>,
    pub timezone: Option<String>,
}

#[derive(Debug, Clone)]
pub enum InsertOutcome {
    Created(JobRecord),
    /// Another active job already holds the device.
    Conflict { job_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobLogEntry {
    pub seq: i64,
    pub job_id: String,
    pub message: String,
    pub created_at: String,
}
