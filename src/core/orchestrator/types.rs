use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Discovery,
    Precheck,
    Copy,
    Verify,
    Upgrade,
    Maintenance,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Discovery => "discovery",
            JobKind::Precheck => "precheck",
            JobKind::Copy => "copy",
            JobKind::Verify => "verify",
            JobKind::Upgrade => "upgrade",
            JobKind::Maintenance => "maintenance",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "discovery" => Some(JobKind::Discovery),
            "precheck" => Some(JobKind::Precheck),
            "copy" => Some(JobKind::Copy),
            "verify" => Some(JobKind::Verify),
            "upgrade" => Some(JobKind::Upgrade),
            "maintenance" => Some(JobKind::Maintenance),
            _ => None,
        }
    }

    /// Kinds that act on a device already in the inventory.
    pub fn needs_inventory(self) -> bool {
        !matches!(self, JobKind::Discovery)
    }

    /// Kinds that operate on the device's target image.
    pub fn needs_image(self) -> bool {
        matches!(self, JobKind::Copy | JobKind::Verify | JobKind::Upgrade)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Scheduled,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Scheduled => "scheduled",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(JobStatus::Pending),
            "scheduled" => Some(JobStatus::Scheduled),
            "running" => Some(JobStatus::Running),
            "success" => Some(JobStatus::Success),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_active(self) -> bool {
        matches!(
            self,
            JobStatus::Pending | JobStatus::Scheduled | JobStatus::Running
        )
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }
}

/// Allowed job status transitions. Terminal states have no way out, and a
/// running job can only finish.
pub fn can_transition(from: JobStatus, to: JobStatus) -> bool {
    use JobStatus::*;
    matches!(
        (from, to),
        (Pending, Running)
            | (Pending, Scheduled)
            | (Pending, Cancelled)
            | (Scheduled, Running)
            | (Scheduled, Scheduled)
            | (Scheduled, Cancelled)
            | (Running, Success)
            | (Running, Failed)
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaintenanceAction {
    RemoveInactive,
    Commit,
    EnableChannel,
    DisableChannel,
}

impl MaintenanceAction {
    pub fn as_str(self) -> &'static str {
        match self {
            MaintenanceAction::RemoveInactive => "remove_inactive",
            MaintenanceAction::Commit => "commit",
            MaintenanceAction::EnableChannel => "enable_channel",
            MaintenanceAction::DisableChannel => "disable_channel",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "remove_inactive" => Some(MaintenanceAction::RemoveInactive),
            "commit" => Some(MaintenanceAction::Commit),
            "enable_channel" => Some(MaintenanceAction::EnableChannel),
            "disable_channel" => Some(MaintenanceAction::DisableChannel),
            _ => None,
        }
    }
}

/// Request to create one job, as accepted by the HTTP API.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct JobRequest {
    pub device: String,
    pub kind: JobKind,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub action: Option<MaintenanceAction>,
    /// Local wall-clock time, e.g. `2026-10-20T02:00`.
    #[serde(default)]
    pub schedule_at: Option<String>,
    /// IANA zone the schedule time is expressed in.
    #[serde(default)]
    pub timezone: Option<String>,
}

impl JobRequest {
    pub fn now(device: &str, kind: JobKind) -> Self {
        Self {
            device: device.to_string(),
            kind,
            image: None,
            action: None,
            schedule_at: None,
            timezone: None,
        }
    }

    pub fn maintenance(device: &str, action: MaintenanceAction) -> Self {
        Self {
            action: Some(action),
            ..Self::now(device, JobKind::Maintenance)
        }
    }
}

const LOCAL_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
];

/// Convert a wall-clock time in a named zone to UTC. Returns the instant and
/// the canonical zone name.
pub fn resolve_schedule(local: &str, timezone: &str) -> Result<(DateTime<Utc>, String), String> {
    let tz: Tz = timezone
        .parse()
        .map_err(|_| format!("unknown timezone '{}'", timezone))?;
    let naive = LOCAL_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(local.trim(), format).ok())
        .ok_or_else(|| format!("invalid schedule time '{}'", local))?;
    // A time skipped by a DST jump has no local mapping; an ambiguous one
    // takes the first occurrence.
    let instant = tz
        .from_local_datetime(&naive)
        .earliest()
        .ok_or_else(|| format!("'{}' does not exist in {}", local, timezone))?;
    Ok((instant.with_timezone(&Utc), tz.name().to_string()))
}
