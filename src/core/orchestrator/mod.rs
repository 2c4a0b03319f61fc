//! Job orchestration.
//!
//! Every request becomes a persisted job before anything touches a device.
//! A job leaves `pending`/`scheduled` only through a conditional store
//! update, so whichever of the immediate dispatch, a schedule timer or the
//! periodic sweep gets there first runs it, and a cancelled job never
//! starts. A device has at most one active job at any time.

mod error;
pub mod types;
mod workers;

#[cfg(test)]
mod tests;

pub use error::{JobError, OrchestratorError};
pub use types::{
    JobKind, JobRequest, JobStatus, MaintenanceAction, can_transition, resolve_schedule,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::core::events::EventBus;
use crate::core::images::{ImageArtifact, ImageCatalog, version_from_filename};
use crate::core::lifecycle::LifecycleComponent;
use crate::core::precheck::CheckResult;
use crate::core::store::{
    DeviceRecord, InsertOutcome, JobLogEntry, JobRecord, NewJob, PrecheckRecord, PrecheckStatus,
    Reachability, Store,
};
use crate::core::transport::{Connector, TransportSettings};

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Upper bound on jobs in `running` at once.
    pub max_concurrent: usize,
    /// Zone used when a schedule request names none.
    pub default_timezone: String,
    /// Base URL of the image file server, needed by copy jobs.
    pub image_base_url: Option<String>,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            default_timezone: "UTC".to_string(),
            image_base_url: None,
        }
    }
}

/// Per-device result of a batch submission.
#[derive(Debug, Clone, Serialize)]
pub struct BatchEntry {
    pub device: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone)]
pub struct Orchestrator {
    store: Store,
    bus: EventBus,
    connector: Arc<dyn Connector>,
    catalog: Arc<dyn ImageCatalog>,
    transport: TransportSettings,
    settings: Arc<OrchestratorSettings>,
    permits: Arc<Semaphore>,
    /// Jobs handed to a task in this process, so a timer and the sweep do
    /// not spawn the same job twice.
    inflight: Arc<Mutex<HashSet<String>>>,
    timers: Arc<Mutex<HashMap<String, Uuid>>>,
    scheduler: Arc<Mutex<Option<JobScheduler>>>,
}

fn validate_address(address: &str) -> Result<(), OrchestratorError> {
    if address.is_empty() {
        return Err(OrchestratorError::Validation(
            "device address is empty".to_string(),
        ));
    }
    if address.chars().any(|c| c.is_whitespace() || c == '/') {
        return Err(OrchestratorError::Validation(format!(
            "invalid device address '{}'",
            address
        )));
    }
    Ok(())
}

impl Orchestrator {
    pub fn new(
        store: Store,
        bus: EventBus,
        connector: Arc<dyn Connector>,
        catalog: Arc<dyn ImageCatalog>,
        transport: TransportSettings,
        settings: OrchestratorSettings,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(settings.max_concurrent.max(1)));
        Self {
            store,
            bus,
            connector,
            catalog,
            transport,
            settings: Arc::new(settings),
            permits,
            inflight: Arc::new(Mutex::new(HashSet::new())),
            timers: Arc::new(Mutex::new(HashMap::new())),
            scheduler: Arc::new(Mutex::new(None)),
        }
    }

    /// Use `scheduler` for one-shot timers of scheduled jobs. Without one,
    /// scheduled jobs start only through `dispatch_due`.
    pub async fn attach_scheduler(&self, scheduler: JobScheduler) {
        *self.scheduler.lock().await = Some(scheduler);
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Validate and persist a job, then start it or arm its timer. Returns
    /// as soon as the job is stored.
    pub async fn create_job(&self, request: JobRequest) -> Result<JobRecord, OrchestratorError> {
        let address = request.device.trim().to_string();
        validate_address(&address)?;

        let device = self.store.get_device(&address).await?;
        if request.kind.needs_inventory() && device.is_none() {
            return Err(OrchestratorError::NotFound(format!("device {}", address)));
        }

        match (request.kind, request.action) {
            (JobKind::Maintenance, None) => {
                return Err(OrchestratorError::Validation(
                    "maintenance jobs need an action".to_string(),
                ));
            }
            (JobKind::Maintenance, Some(_)) | (_, None) => {}
            (kind, Some(action)) => {
                return Err(OrchestratorError::Validation(format!(
                    "{} jobs do not take action {}",
                    kind.as_str(),
                    action.as_str()
                )));
            }
        }

        let image = match (&device, request.kind.needs_image()) {
            (Some(device), true) => {
                Some(self.job_image(device, request.kind, request.image.as_deref()).await?)
            }
            _ => None,
        };

        if request.kind == JobKind::Upgrade
            && let Some(device) = &device
        {
            self.upgrade_gate(device).await?;
        }

        let (scheduled_at, timezone) = match request.schedule_at.as_deref() {
            Some(local) => {
                let zone = request
                    .timezone
                    .as_deref()
                    .unwrap_or(&self.settings.default_timezone);
                let (at, zone) = self.future_instant(local, zone)?;
                (Some(at), Some(zone))
            }
            None => (None, None),
        };

        let new_job = NewJob {
            kind: request.kind,
            device: address.clone(),
            target_version: image.as_deref().and_then(version_from_filename),
            image,
            action: request.action,
            scheduled_at,
            timezone,
        };
        let job = match self.store.insert_job(&new_job).await? {
            InsertOutcome::Created(job) => job,
            InsertOutcome::Conflict { job_id } => {
                return Err(OrchestratorError::Conflict {
                    device: address,
                    job_id,
                });
            }
        };

        info!(
            "Job {} ({}) created for {}",
            job.job_id,
            job.kind.as_str(),
            job.device
        );
        match scheduled_at {
            Some(at) => {
                self.log(
                    &job.job_id,
                    format!(
                        "{} scheduled for {} ({})",
                        job.kind.as_str(),
                        at.to_rfc3339(),
                        job.timezone.as_deref().unwrap_or("UTC")
                    ),
                )
                .await;
                self.arm_timer(&job.job_id, at).await;
            }
            None => {
                self.log(&job.job_id, format!("{} queued", job.kind.as_str()))
                    .await;
                self.dispatch(job.job_id.clone()).await;
            }
        }
        Ok(job)
    }

    /// The device's target image, checked against the request and the
    /// catalog.
    async fn job_image(
        &self,
        device: &DeviceRecord,
        kind: JobKind,
        requested: Option<&str>,
    ) -> Result<String, OrchestratorError> {
        let target = device.target_image.clone().ok_or_else(|| {
            OrchestratorError::Validation(format!(
                "device {} has no target image selected",
                device.address
            ))
        })?;
        if let Some(requested) = requested
            && requested != target
        {
            return Err(OrchestratorError::Validation(format!(
                "image {} is not the target image {} of {}",
                requested, target, device.address
            )));
        }
        if self.catalog.get(&target).await?.is_none() {
            return Err(OrchestratorError::NotFound(format!("image {}", target)));
        }
        if kind == JobKind::Copy && self.settings.image_base_url.is_none() {
            return Err(OrchestratorError::Validation(
                "no image server URL configured".to_string(),
            ));
        }
        Ok(target)
    }

    async fn upgrade_gate(&self, device: &DeviceRecord) -> Result<(), OrchestratorError> {
        match device.precheck_status {
            PrecheckStatus::NotRun => Err(OrchestratorError::PrecheckGate {
                device: device.address.clone(),
                failing: vec!["prechecks have not been run".to_string()],
            }),
            PrecheckStatus::Fail => Err(OrchestratorError::PrecheckGate {
                device: device.address.clone(),
                failing: self.failing_checks(&device.address).await?,
            }),
            PrecheckStatus::Pass | PrecheckStatus::Warning => Ok(()),
        }
    }

    /// `Name: message` of every failing check in the latest precheck run.
    async fn failing_checks(&self, address: &str) -> anyhow::Result<Vec<String>> {
        let failing: Vec<String> = self
            .store
            .get_precheck_results(address)
            .await?
            .into_iter()
            .filter(|r| r.result == CheckResult::Fail)
            .map(|r| format!("{}: {}", r.check_name, r.message))
            .collect();
        if failing.is_empty() {
            return Ok(vec!["precheck results are missing".to_string()]);
        }
        Ok(failing)
    }

    fn future_instant(
        &self,
        local: &str,
        timezone: &str,
    ) -> Result<(DateTime<Utc>, String), OrchestratorError> {
        let (at, zone) = resolve_schedule(local, timezone).map_err(OrchestratorError::Validation)?;
        if at <= Utc::now() {
            return Err(OrchestratorError::Validation(format!(
                "schedule time {} {} is in the past",
                local, zone
            )));
        }
        Ok((at, zone))
    }

    /// Submit one job of `kind` per address. Failures are reported per
    /// device and do not stop the rest of the batch.
    pub async fn submit_batch(
        &self,
        addresses: &[String],
        request: impl Fn(&str) -> JobRequest,
    ) -> Vec<BatchEntry> {
        let mut entries = Vec::with_capacity(addresses.len());
        for address in addresses {
            let entry = match self.create_job(request(address)).await {
                Ok(job) => BatchEntry {
                    device: job.device,
                    job_id: Some(job.job_id),
                    error: None,
                },
                Err(err) => BatchEntry {
                    device: address.clone(),
                    job_id: None,
                    error: Some(err.to_string()),
                },
            };
            entries.push(entry);
        }
        entries
    }

    pub async fn discover(&self, addresses: &[String]) -> Vec<BatchEntry> {
        self.submit_batch(addresses, |a| JobRequest::now(a, JobKind::Discovery))
            .await
    }

    pub async fn run_prechecks(&self, addresses: &[String]) -> Vec<BatchEntry> {
        self.submit_batch(addresses, |a| JobRequest::now(a, JobKind::Precheck))
            .await
    }

    pub async fn toggle_channel(&self, addresses: &[String], enable: bool) -> Vec<BatchEntry> {
        let action = if enable {
            MaintenanceAction::EnableChannel
        } else {
            MaintenanceAction::DisableChannel
        };
        self.submit_batch(addresses, |a| JobRequest::maintenance(a, action))
            .await
    }

    /// Select (or clear) the image a device should be upgraded to. Refused
    /// while the device has an active job.
    pub async fn set_target_image(
        &self,
        address: &str,
        image: Option<&str>,
    ) -> Result<DeviceRecord, OrchestratorError> {
        let device = self
            .store
            .get_device(address)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("device {}", address)))?;
        if let Some(job_id) = self.store.active_job_for(address).await? {
            return Err(OrchestratorError::Conflict {
                device: address.to_string(),
                job_id,
            });
        }

        if let Some(filename) = image {
            let artifact = self
                .catalog
                .get(filename)
                .await?
                .ok_or_else(|| OrchestratorError::NotFound(format!("image {}", filename)))?;
            if let (Some(needed), Some(built_for)) =
                (&device.profile.image_tag, &artifact.compatibility)
                && !needed.eq_ignore_ascii_case(built_for)
            {
                return Err(OrchestratorError::Validation(format!(
                    "image {} is built for {}, {} ({}) needs {}",
                    filename, built_for, address, device.model, needed
                )));
            }
        }

        self.store.set_target_image(address, image).await?;
        info!("Target image of {} set to {:?}", address, image);
        self.device(address).await
    }

    pub async fn cancel(&self, job_id: &str) -> Result<JobRecord, OrchestratorError> {
        let job = self.job(job_id).await?;
        if !can_transition(job.status, JobStatus::Cancelled) {
            return Err(OrchestratorError::InvalidTransition {
                job_id: job_id.to_string(),
                status: job.status,
                action: "cancelled",
            });
        }
        if !self.store.cancel_job(job_id).await? {
            // Started between the read and the update.
            let current = self.job(job_id).await?;
            return Err(OrchestratorError::InvalidTransition {
                job_id: job_id.to_string(),
                status: current.status,
                action: "cancelled",
            });
        }
        self.disarm_timer(job_id).await;
        self.log(job_id, "cancelled").await;
        info!("Job {} cancelled", job_id);
        self.job(job_id).await
    }

    pub async fn reschedule(
        &self,
        job_id: &str,
        local: &str,
        timezone: Option<&str>,
    ) -> Result<JobRecord, OrchestratorError> {
        let job = self.job(job_id).await?;
        if !can_transition(job.status, JobStatus::Scheduled) {
            return Err(OrchestratorError::InvalidTransition {
                job_id: job_id.to_string(),
                status: job.status,
                action: "rescheduled",
            });
        }
        let zone = timezone
            .or(job.timezone.as_deref())
            .unwrap_or(&self.settings.default_timezone)
            .to_string();
        let (at, zone) = self.future_instant(local, &zone)?;
        if !self.store.reschedule_job(job_id, at, &zone).await? {
            let current = self.job(job_id).await?;
            return Err(OrchestratorError::InvalidTransition {
                job_id: job_id.to_string(),
                status: current.status,
                action: "rescheduled",
            });
        }
        self.disarm_timer(job_id).await;
        self.arm_timer(job_id, at).await;
        self.log(
            job_id,
            format!("rescheduled for {} ({})", at.to_rfc3339(), zone),
        )
        .await;
        self.job(job_id).await
    }

    pub async fn job(&self, job_id: &str) -> Result<JobRecord, OrchestratorError> {
        self.store
            .get_job(job_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("job {}", job_id)))
    }

    pub async fn jobs(&self, limit: usize) -> Result<Vec<JobRecord>, OrchestratorError> {
        Ok(self.store.list_jobs(limit).await?)
    }

    pub async fn job_log(
        &self,
        job_id: &str,
        after: i64,
        limit: usize,
    ) -> Result<Vec<JobLogEntry>, OrchestratorError> {
        self.job(job_id).await?;
        Ok(self.store.job_log(job_id, after, limit).await?)
    }

    pub async fn devices(&self) -> Result<Vec<DeviceRecord>, OrchestratorError> {
        Ok(self.store.list_devices().await?)
    }

    pub async fn device(&self, address: &str) -> Result<DeviceRecord, OrchestratorError> {
        self.store
            .get_device(address)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("device {}", address)))
    }

    pub async fn prechecks(&self, address: &str) -> Result<Vec<PrecheckRecord>, OrchestratorError> {
        self.device(address).await?;
        Ok(self.store.get_precheck_results(address).await?)
    }

    pub async fn images(&self) -> Result<Vec<ImageArtifact>, OrchestratorError> {
        Ok(self.catalog.list().await?)
    }

    /// Forget every device, job and log. Refused while anything runs.
    pub async fn clear_inventory(&self) -> Result<(), OrchestratorError> {
        if self.store.has_running_jobs().await? {
            return Err(OrchestratorError::Validation(
                "cannot clear the inventory while jobs are running".to_string(),
            ));
        }
        let armed: Vec<String> = self.timers.lock().await.keys().cloned().collect();
        for job_id in armed {
            self.disarm_timer(&job_id).await;
        }
        self.store.clear_inventory().await?;
        info!("Inventory cleared");
        Ok(())
    }

    /// Bring persisted jobs back to life after a start: running jobs from a
    /// previous process fail, pending ones start, scheduled ones are re-armed.
    pub async fn recover(&self) -> anyhow::Result<()> {
        let interrupted = self.store.fail_interrupted_jobs().await?;
        if interrupted > 0 {
            warn!("{} job(s) were running at shutdown and are now failed", interrupted);
        }
        for job in self.store.pending_jobs().await? {
            self.dispatch(job.job_id).await;
        }
        for job in self.store.scheduled_jobs().await? {
            let at = job
                .scheduled_at
                .as_deref()
                .and_then(|at| DateTime::parse_from_rfc3339(at).ok());
            match at {
                Some(at) => self.arm_timer(&job.job_id, at.with_timezone(&Utc)).await,
                None => warn!("Job {} has an unreadable schedule time", job.job_id),
            }
        }
        Ok(())
    }

    /// Start every scheduled job whose time has come. Returns how many were
    /// handed to a worker.
    pub async fn dispatch_due(&self, now: DateTime<Utc>) -> anyhow::Result<usize> {
        let due = self.store.due_jobs(now).await?;
        let count = due.len();
        for job in due {
            self.dispatch(job.job_id).await;
        }
        Ok(count)
    }

    /// Periodic safety net for scheduled jobs whose timer was lost.
    pub async fn install_sweep(&self, scheduler: &JobScheduler, cron: &str) -> anyhow::Result<()> {
        let orchestrator = self.clone();
        let sweep = Job::new_async(cron, move |_uuid, mut _l| {
            let orchestrator = orchestrator.clone();
            Box::pin(async move {
                if let Err(e) = orchestrator.dispatch_due(Utc::now()).await {
                    error!("Schedule sweep failed: {}", e);
                }
            })
        })?;
        scheduler.add(sweep).await?;
        info!("Schedule sweep installed ({})", cron);
        Ok(())
    }

    async fn arm_timer(&self, job_id: &str, at: DateTime<Utc>) {
        let delay = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        if delay.is_zero() {
            self.dispatch(job_id.to_string()).await;
            return;
        }

        let scheduler = self.scheduler.lock().await;
        let Some(scheduler) = scheduler.as_ref() else {
            return;
        };
        let orchestrator = self.clone();
        let id = job_id.to_string();
        let timer = Job::new_one_shot_async(delay, move |_uuid, _l| {
            let orchestrator = orchestrator.clone();
            let id = id.clone();
            Box::pin(async move {
                orchestrator.dispatch(id).await;
            })
        });
        match timer {
            Ok(timer) => match scheduler.add(timer).await {
                Ok(uuid) => {
                    self.timers.lock().await.insert(job_id.to_string(), uuid);
                }
                Err(e) => warn!("Could not arm timer for job {}: {}", job_id, e),
            },
            Err(e) => warn!("Could not create timer for job {}: {}", job_id, e),
        }
    }

    async fn disarm_timer(&self, job_id: &str) {
        let Some(uuid) = self.timers.lock().await.remove(job_id) else {
            return;
        };
        if let Some(scheduler) = self.scheduler.lock().await.as_ref()
            && let Err(e) = scheduler.remove(&uuid).await
        {
            warn!("Could not remove timer of job {}: {}", job_id, e);
        }
    }

    async fn dispatch(&self, job_id: String) {
        if !self.inflight.lock().await.insert(job_id.clone()) {
            return;
        }
        let orchestrator = self.clone();
        tokio::spawn(async move {
            orchestrator.run_job(&job_id).await;
            orchestrator.inflight.lock().await.remove(&job_id);
        });
    }

    async fn run_job(&self, job_id: &str) {
        let Ok(_permit) = self.permits.clone().acquire_owned().await else {
            return;
        };
        match self.store.mark_job_running(job_id, Utc::now()).await {
            Ok(true) => {}
            // Cancelled, not yet due, or already taken.
            Ok(false) => return,
            Err(e) => {
                error!("Could not start job {}: {}", job_id, e);
                return;
            }
        }
        self.timers.lock().await.remove(job_id);

        let job = match self.store.get_job(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => return,
            Err(e) => {
                error!("Could not load job {}: {}", job_id, e);
                return;
            }
        };
        info!(
            "Job {} ({}) running on {}",
            job.job_id,
            job.kind.as_str(),
            job.device
        );
        self.log(job_id, format!("{} started", job.kind.as_str()))
            .await;

        let result = self.execute(&job).await;

        let reachability = match &result {
            Ok(_) => Some(Reachability::Online),
            Err(JobError::Transport(err)) if err.is_unreachable() => Some(Reachability::Offline),
            Err(_) => None,
        };
        if let Some(reachability) = reachability
            && let Err(e) = self.store.set_reachability(&job.device, reachability).await
        {
            warn!("Could not record reachability of {}: {}", job.device, e);
        }

        let finished = match &result {
            Ok(summary) => {
                self.log(job_id, format!("{} succeeded: {}", job.kind.as_str(), summary))
                    .await;
                info!("Job {} succeeded: {}", job_id, summary);
                self.store
                    .finish_job(job_id, JobStatus::Success, Some(summary), None)
                    .await
            }
            Err(err) => {
                let message = err.to_string();
                self.log(job_id, format!("{} failed: {}", job.kind.as_str(), message))
                    .await;
                warn!("Job {} failed: {}", job_id, message);
                self.store
                    .finish_job(job_id, JobStatus::Failed, None, Some(&message))
                    .await
            }
        };
        if let Err(e) = finished {
            error!("Could not record the result of job {}: {}", job_id, e);
        }
    }

    /// Append a line to the job log. A failed write is only traced.
    async fn log(&self, job_id: &str, message: impl Into<String>) {
        if let Err(e) = self.bus.publish(job_id, message).await {
            warn!("Could not write log of job {}: {}", job_id, e);
        }
    }

    /// Channel for streamed device output and the task forwarding it to the
    /// job log. The task ends once every sender is dropped.
    fn line_sink(&self, job_id: &str) -> (UnboundedSender<String>, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let bus = self.bus.clone();
        let job_id = job_id.to_string();
        let forwarder = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                let line = line.trim_end();
                if line.is_empty() {
                    continue;
                }
                if let Err(e) = bus.publish(&job_id, line).await {
                    warn!("Could not write log of job {}: {}", job_id, e);
                }
            }
        });
        (tx, forwarder)
    }
}

#[async_trait::async_trait]
impl LifecycleComponent for Orchestrator {
    async fn on_start(&mut self) -> anyhow::Result<()> {
        self.recover().await
    }

    async fn on_shutdown(&mut self) -> anyhow::Result<()> {
        let running = self.store.has_running_jobs().await.unwrap_or(false);
        if running {
            warn!("Shutting down with jobs still running; they will be failed on next start");
        }
        Ok(())
    }
}
