use tracing::{debug, warn};

use super::{JobError, JobKind, MaintenanceAction, Orchestrator};
use crate::core::images::image_url;
use crate::core::precheck::{PrecheckTarget, aggregate, gather_facts, member_space, run_prechecks, summary};
use crate::core::profile::classify;
use crate::core::store::{DeviceRecord, DiscoveredDevice, ImageStatus, JobRecord, PrecheckStatus};
use crate::core::transport::parse::{classify_install, classify_maintenance};
use crate::core::transport::{
    ChannelState, DeviceSession, InstallOutcome, PromptReply, TransportError,
};

impl Orchestrator {
    /// Run the worker for `job` over a fresh session, which is always closed.
    pub(super) async fn execute(&self, job: &JobRecord) -> Result<String, JobError> {
        let mut session =
            DeviceSession::new(&job.device, self.connector.clone(), self.transport.clone());
        let result = match job.kind {
            JobKind::Discovery => self.discover_device(job, &mut session).await,
            JobKind::Precheck => self.precheck_device(job, &mut session).await,
            JobKind::Copy => self.copy_image(job, &mut session).await,
            JobKind::Verify => self.verify_job(job, &mut session).await,
            JobKind::Upgrade => self.upgrade_device(job, &mut session).await,
            JobKind::Maintenance => self.maintain_device(job, &mut session).await,
        };
        debug!(
            "Closing session to {} after {} job {}",
            session.address(),
            job.kind.as_str(),
            job.job_id
        );
        session.close().await;
        result
    }

    /// Keep a failed optional read as a log line instead of failing the job.
    /// Authentication and reachability errors still end it.
    async fn optional<T>(
        &self,
        job: &JobRecord,
        what: &str,
        result: Result<T, TransportError>,
    ) -> Result<Option<T>, JobError> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.is_auth() || err.is_unreachable() => Err(err.into()),
            Err(err) => {
                self.log(&job.job_id, format!("{} unavailable: {}", what, err))
                    .await;
                Ok(None)
            }
        }
    }

    async fn discover_device(
        &self,
        job: &JobRecord,
        session: &mut DeviceSession,
    ) -> Result<String, JobError> {
        let facts = session.system_facts().await?;
        let profile = classify(&facts.model);
        self.log(
            &job.job_id,
            format!(
                "{} is a {} ({}) running {}",
                facts.hostname.as_deref().unwrap_or(&job.device),
                facts.model,
                profile.family,
                facts.version
            ),
        )
        .await;
        if !profile.supported {
            self.log(
                &job.job_id,
                format!("model {} is not a supported platform", facts.model),
            )
            .await;
        }

        let boot_variable = self
            .optional(job, "boot variable", session.boot_variable(profile.family).await)
            .await?;
        let boot_flags = self
            .optional(job, "boot flags", session.boot_flags(profile.family).await)
            .await?;
        let members = match member_space(session, &profile).await? {
            Ok(members) => members,
            Err(reason) => {
                self.log(&job.job_id, format!("free space unavailable: {}", reason))
                    .await;
                Vec::new()
            }
        };
        let channel_state = self
            .optional(
                job,
                "structured channel state",
                session.structured_channel_state().await,
            )
            .await?
            .unwrap_or(ChannelState::Unknown);

        let discovered = DiscoveredDevice {
            address: job.device.clone(),
            hostname: facts.hostname.clone(),
            serial: facts.serial.clone(),
            model: facts.model.clone(),
            profile,
            version: facts.version.clone(),
            boot_variable,
            ignore_startup_config: boot_flags.as_ref().map(|f| f.ignore_startup_config),
            config_register: boot_flags
                .and_then(|f| f.config_register)
                .or(facts.config_register.clone()),
            members,
            channel_state,
        };
        let record = self.store.upsert_discovered(&discovered).await?;
        Ok(format!(
            "{} {} running {}",
            record.profile.family,
            record.model,
            record.version.as_deref().unwrap_or("unknown")
        ))
    }

    async fn precheck_device(
        &self,
        job: &JobRecord,
        session: &mut DeviceSession,
    ) -> Result<String, JobError> {
        let device = self.inventory_device(job).await?;
        let target = device.target_image.as_deref();
        let facts = gather_facts(session, &device.profile, target).await?;
        if let Ok(members) = &facts.members {
            self.store.set_member_space(&job.device, members).await?;
        }

        let outcomes = run_prechecks(&facts, target.map(PrecheckTarget::new).as_ref());
        for outcome in &outcomes {
            self.log(
                &job.job_id,
                format!(
                    "{} {}: {}",
                    outcome.result.as_str(),
                    outcome.name,
                    outcome.message
                ),
            )
            .await;
        }
        let status = aggregate(&outcomes);
        let summary = summary(&outcomes);
        self.store
            .replace_precheck_results(&job.device, &outcomes, status, summary.as_deref())
            .await?;

        match facts.image_present {
            Some(Ok(true)) if device.image_status == ImageStatus::NotCopied => {
                self.store
                    .set_image_status(&job.device, ImageStatus::Copied)
                    .await?;
            }
            Some(Ok(false)) => {
                self.store
                    .set_image_status(&job.device, ImageStatus::NotCopied)
                    .await?;
            }
            _ => {}
        }

        Ok(format!("prechecks {}", status.as_str()))
    }

    async fn copy_image(
        &self,
        job: &JobRecord,
        session: &mut DeviceSession,
    ) -> Result<String, JobError> {
        let (device, filename) = self.job_target(job).await?;
        let base_url = self
            .settings
            .image_base_url
            .as_deref()
            .ok_or_else(|| JobError::Validation("no image server URL configured".to_string()))?;
        let filesystem = device.profile.filesystem.clone();
        let url = image_url(base_url, &filename);

        self.log(&job.job_id, format!("copying {} to {}", url, filesystem))
            .await;
        let (sink, forwarder) = self.line_sink(&job.job_id);
        let copied = session.copy_from_url(&url, &filesystem, Some(sink)).await;
        if let Err(e) = forwarder.await {
            warn!("Output forwarder of job {} ended abnormally: {}", job.job_id, e);
        }
        copied?;

        if !session.file_exists(&filesystem, &filename).await? {
            self.store
                .set_image_status(&job.device, ImageStatus::NotCopied)
                .await?;
            return Err(JobError::Device(format!(
                "{} not found on {} after copy",
                filename, filesystem
            )));
        }
        self.store
            .set_image_status(&job.device, ImageStatus::Copied)
            .await?;
        self.log(&job.job_id, "copy complete, verifying checksum")
            .await;
        self.verify_image(job, session, &device, &filename).await
    }

    async fn verify_job(
        &self,
        job: &JobRecord,
        session: &mut DeviceSession,
    ) -> Result<String, JobError> {
        let (device, filename) = self.job_target(job).await?;
        self.verify_image(job, session, &device, &filename).await
    }

    async fn verify_image(
        &self,
        job: &JobRecord,
        session: &mut DeviceSession,
        device: &DeviceRecord,
        filename: &str,
    ) -> Result<String, JobError> {
        let filesystem = &device.profile.filesystem;
        if !session.file_exists(filesystem, filename).await? {
            self.store
                .set_image_status(&job.device, ImageStatus::NotCopied)
                .await?;
            return Err(JobError::Device(format!(
                "{} is not present on {}",
                filename, filesystem
            )));
        }

        let artifact = self.catalog.get(filename).await?.ok_or_else(|| {
            JobError::Validation(format!("image {} is no longer in the catalog", filename))
        })?;
        let expected = artifact.md5.trim();
        if expected.is_empty() {
            return Err(JobError::Validation(format!(
                "no expected MD5 recorded for {}",
                filename
            )));
        }

        self.log(
            &job.job_id,
            format!("computing MD5 of {}{}", filesystem, filename),
        )
        .await;
        let actual = session.compute_md5(filesystem, filename).await?;
        if actual.eq_ignore_ascii_case(expected) {
            self.store
                .set_image_status(&job.device, ImageStatus::Verified)
                .await?;
            Ok(format!("{} verified (MD5 {})", filename, actual))
        } else {
            self.store
                .set_image_status(&job.device, ImageStatus::VerificationFailed)
                .await?;
            Err(JobError::Device(format!(
                "MD5 mismatch for {}: expected {}, device computed {}",
                filename, expected, actual
            )))
        }
    }

    async fn upgrade_device(
        &self,
        job: &JobRecord,
        session: &mut DeviceSession,
    ) -> Result<String, JobError> {
        let (device, filename) = self.job_target(job).await?;
        match device.precheck_status {
            PrecheckStatus::Fail => {
                return Err(JobError::StaleState {
                    failing: self.failing_checks(&job.device).await?,
                });
            }
            PrecheckStatus::NotRun => {
                return Err(JobError::StaleState {
                    failing: vec!["prechecks were reset since the job was created".to_string()],
                });
            }
            PrecheckStatus::Pass | PrecheckStatus::Warning => {}
        }

        let filesystem = device.profile.filesystem.clone();
        if !session.file_exists(&filesystem, &filename).await? {
            self.store
                .set_image_status(&job.device, ImageStatus::NotCopied)
                .await?;
            return Err(JobError::Device(format!(
                "{} is not present on {}",
                filename, filesystem
            )));
        }

        self.log(&job.job_id, "saving running configuration").await;
        session.save_config().await?;

        self.log(
            &job.job_id,
            format!("installing {}{}", filesystem, filename),
        )
        .await;
        let (sink, forwarder) = self.line_sink(&job.job_id);
        let installed = session
            .install_one_step(&filesystem, &filename, Some(sink))
            .await;
        if let Err(e) = forwarder.await {
            warn!("Output forwarder of job {} ended abnormally: {}", job.job_id, e);
        }

        match classify_install(&installed?) {
            InstallOutcome::Succeeded(confirmation) => {
                // The device reloads into a new release; old results no
                // longer describe it.
                self.store.reset_precheck_status(&job.device).await?;
                Ok(format!("{} installed, {}", filename, confirmation))
            }
            InstallOutcome::Failed(reason) => Err(JobError::Device(reason)),
        }
    }

    async fn maintain_device(
        &self,
        job: &JobRecord,
        session: &mut DeviceSession,
    ) -> Result<String, JobError> {
        let action = job.action.ok_or_else(|| {
            JobError::Validation("maintenance job has no action".to_string())
        })?;
        match action {
            MaintenanceAction::RemoveInactive => {
                self.install_maintenance(
                    job,
                    session,
                    "install remove inactive",
                    &[PromptReply::new("[y/n]", "y")],
                )
                .await
            }
            MaintenanceAction::Commit => {
                self.install_maintenance(job, session, "install commit", &[])
                    .await
            }
            MaintenanceAction::EnableChannel | MaintenanceAction::DisableChannel => {
                let enable = action == MaintenanceAction::EnableChannel;
                let state = session.toggle_feature(enable).await?;
                self.store.set_channel_state(&job.device, state).await?;
                Ok(format!("structured channel {}", state.as_str()))
            }
        }
    }

    async fn install_maintenance(
        &self,
        job: &JobRecord,
        session: &mut DeviceSession,
        command: &str,
        replies: &[PromptReply],
    ) -> Result<String, JobError> {
        self.log(&job.job_id, format!("running '{}'", command)).await;
        let timeout = session.settings().install_timeout;
        let (sink, forwarder) = self.line_sink(&job.job_id);
        let output = session
            .exec_interactive(command, replies, timeout, Some(sink))
            .await;
        if let Err(e) = forwarder.await {
            warn!("Output forwarder of job {} ended abnormally: {}", job.job_id, e);
        }
        match classify_maintenance(&output?) {
            InstallOutcome::Succeeded(_) => Ok(format!("'{}' completed", command)),
            InstallOutcome::Failed(reason) => Err(JobError::Device(reason)),
        }
    }

    async fn inventory_device(&self, job: &JobRecord) -> Result<DeviceRecord, JobError> {
        self.store.get_device(&job.device).await?.ok_or_else(|| {
            JobError::Validation(format!("device {} is no longer in the inventory", job.device))
        })
    }

    /// Device and image of an image job. The device's target must still be
    /// the image the job was created for.
    async fn job_target(&self, job: &JobRecord) -> Result<(DeviceRecord, String), JobError> {
        let device = self.inventory_device(job).await?;
        let Some(filename) = job.image.clone() else {
            return Err(JobError::Validation(format!(
                "{} job has no image",
                job.kind.as_str()
            )));
        };
        if device.target_image.as_deref() != Some(filename.as_str()) {
            return Err(JobError::StaleState {
                failing: vec![format!(
                    "target image changed from {} to {}",
                    filename,
                    device.target_image.as_deref().unwrap_or("none")
                )],
            });
        }
        Ok((device, filename))
    }
}
