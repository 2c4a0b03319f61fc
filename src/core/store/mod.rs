mod devices;
mod jobs;
mod prechecks;
pub mod types;

use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::info;

use crate::platform::{NativePlatform, Platform};

pub use types::{
    DeviceRecord, DiscoveredDevice, ImageStatus, InsertOutcome, JobLogEntry, JobRecord,
    MemberSpace, NewJob, PrecheckRecord, PrecheckStatus, Reachability,
};

const DB_FILE: &str = "fwpilot.db";

/// Durable inventory, precheck results, jobs and job logs.
///
/// One SQLite connection behind an async mutex. Every method takes the lock
/// for the duration of its statements, so multi-statement methods are atomic
/// with respect to each other.
#[derive(Clone)]
pub struct Store {
    db: Arc<Mutex<Connection>>,
}

// Enums stored as their snake_case names.
macro_rules! sql_text_enum {
    ($($ty:ty),* $(,)?) => {$(
        impl rusqlite::types::ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
                Ok(rusqlite::types::ToSqlOutput::from(self.as_str()))
            }
        }

        impl rusqlite::types::FromSql for $ty {
            fn column_result(
                value: rusqlite::types::ValueRef<'_>,
            ) -> rusqlite::types::FromSqlResult<Self> {
                let text = value.as_str()?;
                <$ty>::parse(text).ok_or_else(|| {
                    rusqlite::types::FromSqlError::Other(
                        format!("unknown {} value {:?}", stringify!($ty), text).into(),
                    )
                })
            }
        }
    )*};
}

sql_text_enum!(
    crate::core::orchestrator::JobKind,
    crate::core::orchestrator::JobStatus,
    crate::core::orchestrator::MaintenanceAction,
    crate::core::precheck::CheckResult,
    crate::core::profile::DeviceFamily,
    crate::core::transport::ChannelState,
    ImageStatus,
    PrecheckStatus,
    Reachability,
);

pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn now() -> String {
    timestamp(Utc::now())
}

fn init_schema(db: &Connection) -> rusqlite::Result<()> {
    db.execute_batch(
        "CREATE TABLE IF NOT EXISTS devices (
            address TEXT PRIMARY KEY,
            hostname TEXT,
            serial TEXT,
            model TEXT NOT NULL,
            family TEXT NOT NULL,
            filesystem TEXT NOT NULL,
            stack_capable INTEGER NOT NULL,
            supported INTEGER NOT NULL,
            image_tag TEXT,
            version TEXT,
            boot_variable TEXT,
            ignore_startup_config INTEGER,
            config_register TEXT,
            member_space_json TEXT NOT NULL DEFAULT '[]',
            target_image TEXT,
            image_status TEXT NOT NULL DEFAULT 'not_copied',
            precheck_status TEXT NOT NULL DEFAULT 'not_run',
            precheck_summary TEXT,
            channel_state TEXT NOT NULL DEFAULT 'unknown',
            reachability TEXT NOT NULL DEFAULT 'online',
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS prechecks (
            address TEXT NOT NULL,
            check_name TEXT NOT NULL,
            result TEXT NOT NULL,
            message TEXT NOT NULL,
            checked_at TEXT NOT NULL,
            PRIMARY KEY (address, check_name)
        );

        CREATE TABLE IF NOT EXISTS jobs (
            job_id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            device TEXT NOT NULL,
            image TEXT,
            target_version TEXT,
            action TEXT,
            status TEXT NOT NULL,
            scheduled_at TEXT,
            timezone TEXT,
            summary TEXT,
            error TEXT,
            created_at TEXT NOT NULL,
            started_at TEXT,
            finished_at TEXT
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_one_active_per_device
            ON jobs(device) WHERE status IN ('pending', 'scheduled', 'running');
        CREATE INDEX IF NOT EXISTS idx_jobs_status_scheduled ON jobs(status, scheduled_at);

        CREATE TABLE IF NOT EXISTS job_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id TEXT NOT NULL,
            message TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_job_logs_job_id_id ON job_logs(job_id, id);",
    )
}

impl Store {
    pub async fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        if !data_dir.exists() {
            fs::create_dir_all(&data_dir).await?;
        }
        NativePlatform::restrict_dir_permissions(&data_dir);

        let db_path = data_dir.join(DB_FILE);
        let db = Connection::open(&db_path)?;
        NativePlatform::restrict_file_permissions(&db_path);
        init_schema(&db)?;
        info!("Store opened at {}", db_path.display());

        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    /// Remove every device along with its jobs, logs and precheck results.
    pub async fn clear_inventory(&self) -> Result<()> {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        tx.execute("DELETE FROM job_logs", [])?;
        tx.execute("DELETE FROM jobs", [])?;
        tx.execute("DELETE FROM prechecks", [])?;
        tx.execute("DELETE FROM devices", [])?;
        tx.commit()?;
        Ok(())
    }
}

/// In-memory store for tests.
#[cfg(test)]
pub fn test_store() -> Store {
    let db = Connection::open_in_memory().expect("open in-memory db");
    init_schema(&db).expect("create schema");
    Store {
        db: Arc::new(Mutex::new(db)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::orchestrator::{JobKind, JobStatus};
    use crate::core::precheck::{CheckOutcome, CheckResult};
    use crate::core::profile::classify;
    use crate::core::transport::ChannelState;

    fn discovered(address: &str, model: &str, version: &str) -> DiscoveredDevice {
        DiscoveredDevice {
            address: address.to_string(),
            hostname: Some(format!("host-{}", address)),
            serial: Some("FOC1234".into()),
            model: model.to_string(),
            profile: classify(model),
            version: version.to_string(),
            boot_variable: Some("flash:packages.conf".into()),
            ignore_startup_config: Some(false),
            config_register: None,
            members: vec![MemberSpace {
                member: 1,
                filesystem: "flash-1:".into(),
                free_bytes: Some(4096 * 1024 * 1024),
                total_bytes: None,
            }],
            channel_state: ChannelState::Disabled,
        }
    }

    fn new_job(device: &str, kind: JobKind) -> NewJob {
        NewJob {
            kind,
            device: device.to_string(),
            image: None,
            target_version: None,
            action: None,
            scheduled_at: None,
            timezone: None,
        }
    }

    #[tokio::test]
    async fn open_creates_database_file() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("state");
        let store = Store::open(&data_dir).await.unwrap();
        assert!(data_dir.join(DB_FILE).exists());
        assert!(store.list_devices().await.unwrap().is_empty());

        // Reopening keeps existing rows.
        store
            .upsert_discovered(&discovered("10.0.0.1", "C9300-48P", "17.06.05"))
            .await
            .unwrap();
        drop(store);
        let reopened = Store::open(&data_dir).await.unwrap();
        assert_eq!(reopened.list_devices().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn discovery_roundtrip() {
        let store = test_store();
        let record = store
            .upsert_discovered(&discovered("10.0.0.1", "C9300-48P", "17.06.05"))
            .await
            .unwrap();
        assert_eq!(record.profile.filesystem, "flash:");
        assert_eq!(record.members.len(), 1);
        assert_eq!(record.image_status, ImageStatus::NotCopied);
        assert_eq!(record.precheck_status, PrecheckStatus::NotRun);
        assert_eq!(record.reachability, Reachability::Online);
        assert_eq!(record.channel_state, ChannelState::Disabled);
    }

    #[tokio::test]
    async fn rediscovery_keeps_operator_state_for_same_model() {
        let store = test_store();
        store
            .upsert_discovered(&discovered("10.0.0.1", "C9300-48P", "17.06.05"))
            .await
            .unwrap();
        store
            .set_target_image("10.0.0.1", Some("cat9k_iosxe.17.09.04a.SPA.bin"))
            .await
            .unwrap();
        store
            .set_image_status("10.0.0.1", ImageStatus::Verified)
            .await
            .unwrap();
        store
            .replace_precheck_results(
                "10.0.0.1",
                &[CheckOutcome::new("Disk Space", CheckResult::Pass, "ok")],
                PrecheckStatus::Pass,
                None,
            )
            .await
            .unwrap();

        let again = store
            .upsert_discovered(&discovered("10.0.0.1", "C9300-48P", "17.06.06"))
            .await
            .unwrap();
        assert_eq!(again.version.as_deref(), Some("17.06.06"));
        assert_eq!(again.target_image.as_deref(), Some("cat9k_iosxe.17.09.04a.SPA.bin"));
        assert_eq!(again.image_status, ImageStatus::Verified);
        assert_eq!(again.precheck_status, PrecheckStatus::Pass);

        // A different model is a different box: classification and gate reset.
        let swapped = store
            .upsert_discovered(&discovered("10.0.0.1", "ISR4331/K9", "17.06.06"))
            .await
            .unwrap();
        assert_eq!(swapped.profile.filesystem, "bootflash:");
        assert_eq!(swapped.precheck_status, PrecheckStatus::NotRun);
    }

    #[tokio::test]
    async fn changing_target_resets_image_and_precheck_status() {
        let store = test_store();
        store
            .upsert_discovered(&discovered("10.0.0.1", "C9300-48P", "17.06.05"))
            .await
            .unwrap();
        store.set_target_image("10.0.0.1", Some("a.bin")).await.unwrap();
        store
            .set_image_status("10.0.0.1", ImageStatus::Verified)
            .await
            .unwrap();
        store
            .replace_precheck_results("10.0.0.1", &[], PrecheckStatus::Pass, None)
            .await
            .unwrap();

        // Same target again is a no-op.
        store.set_target_image("10.0.0.1", Some("a.bin")).await.unwrap();
        let same = store.get_device("10.0.0.1").await.unwrap().unwrap();
        assert_eq!(same.image_status, ImageStatus::Verified);

        store.set_target_image("10.0.0.1", Some("b.bin")).await.unwrap();
        let changed = store.get_device("10.0.0.1").await.unwrap().unwrap();
        assert_eq!(changed.image_status, ImageStatus::NotCopied);
        assert_eq!(changed.precheck_status, PrecheckStatus::NotRun);
    }

    #[tokio::test]
    async fn precheck_runs_replace_previous_results() {
        let store = test_store();
        store
            .upsert_discovered(&discovered("10.0.0.1", "C9300-48P", "17.06.05"))
            .await
            .unwrap();
        store
            .replace_precheck_results(
                "10.0.0.1",
                &[
                    CheckOutcome::new("Disk Space", CheckResult::Fail, "flash-1: 900 MB free"),
                    CheckOutcome::new("NPE Image", CheckResult::Pass, "ok"),
                ],
                PrecheckStatus::Fail,
                Some("Disk Space: flash-1: 900 MB free"),
            )
            .await
            .unwrap();
        store
            .replace_precheck_results(
                "10.0.0.1",
                &[CheckOutcome::new("Disk Space", CheckResult::Pass, "ok")],
                PrecheckStatus::Pass,
                None,
            )
            .await
            .unwrap();

        let results = store.get_precheck_results("10.0.0.1").await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].result, CheckResult::Pass);
        let device = store.get_device("10.0.0.1").await.unwrap().unwrap();
        assert_eq!(device.precheck_status, PrecheckStatus::Pass);
        assert_eq!(device.precheck_summary, None);
    }

    #[tokio::test]
    async fn one_active_job_per_device() {
        let store = test_store();
        let first = match store
            .insert_job(&new_job("10.0.0.1", JobKind::Precheck))
            .await
            .unwrap()
        {
            InsertOutcome::Created(job) => job,
            other => panic!("expected created, got {:?}", other),
        };
        assert_eq!(first.status, JobStatus::Pending);

        match store
            .insert_job(&new_job("10.0.0.1", JobKind::Upgrade))
            .await
            .unwrap()
        {
            InsertOutcome::Conflict { job_id } => assert_eq!(job_id, first.job_id),
            other => panic!("expected conflict, got {:?}", other),
        }

        // Other devices are unaffected.
        assert!(matches!(
            store
                .insert_job(&new_job("10.0.0.2", JobKind::Upgrade))
                .await
                .unwrap(),
            InsertOutcome::Created(_)
        ));

        // Once finished, the device is free again.
        assert!(store.mark_job_running(&first.job_id, Utc::now()).await.unwrap());
        assert!(
            store
                .finish_job(&first.job_id, JobStatus::Success, Some("done"), None)
                .await
                .unwrap()
        );
        assert!(matches!(
            store
                .insert_job(&new_job("10.0.0.1", JobKind::Upgrade))
                .await
                .unwrap(),
            InsertOutcome::Created(_)
        ));
    }

    #[tokio::test]
    async fn conditional_transitions() {
        let store = test_store();
        let InsertOutcome::Created(job) = store
            .insert_job(&new_job("10.0.0.1", JobKind::Verify))
            .await
            .unwrap()
        else {
            panic!("job not created");
        };

        assert!(store.cancel_job(&job.job_id).await.unwrap());
        // A cancelled job never starts and never finishes.
        assert!(!store.mark_job_running(&job.job_id, Utc::now()).await.unwrap());
        assert!(
            !store
                .finish_job(&job.job_id, JobStatus::Success, None, None)
                .await
                .unwrap()
        );
        assert!(!store.cancel_job(&job.job_id).await.unwrap());
        let stored = store.get_job(&job.job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Cancelled);
        assert!(stored.finished_at.is_some());
    }

    #[tokio::test]
    async fn scheduled_jobs_only_start_when_due() {
        let store = test_store();
        let at = Utc::now() + chrono::Duration::hours(2);
        let mut request = new_job("10.0.0.1", JobKind::Upgrade);
        request.scheduled_at = Some(at);
        request.timezone = Some("Europe/Berlin".into());
        let InsertOutcome::Created(job) = store.insert_job(&request).await.unwrap() else {
            panic!("job not created");
        };
        assert_eq!(job.status, JobStatus::Scheduled);
        assert_eq!(job.timezone.as_deref(), Some("Europe/Berlin"));

        assert!(!store.mark_job_running(&job.job_id, Utc::now()).await.unwrap());
        assert!(store.due_jobs(Utc::now()).await.unwrap().is_empty());

        let later = at + chrono::Duration::seconds(1);
        assert_eq!(store.due_jobs(later).await.unwrap().len(), 1);
        assert!(store.mark_job_running(&job.job_id, later).await.unwrap());
        // Only one dispatcher wins.
        assert!(!store.mark_job_running(&job.job_id, later).await.unwrap());
    }

    #[tokio::test]
    async fn reschedule_moves_pending_and_scheduled_jobs() {
        let store = test_store();
        let InsertOutcome::Created(job) = store
            .insert_job(&new_job("10.0.0.1", JobKind::Copy))
            .await
            .unwrap()
        else {
            panic!("job not created");
        };
        let at = Utc::now() + chrono::Duration::minutes(30);
        assert!(store.reschedule_job(&job.job_id, at, "UTC").await.unwrap());
        let moved = store.get_job(&job.job_id).await.unwrap().unwrap();
        assert_eq!(moved.status, JobStatus::Scheduled);
        assert_eq!(moved.scheduled_at, Some(timestamp(at)));

        store.mark_job_running(&job.job_id, at).await.unwrap();
        assert!(!store.reschedule_job(&job.job_id, at, "UTC").await.unwrap());
    }

    #[tokio::test]
    async fn interrupted_jobs_fail_on_recovery() {
        let store = test_store();
        let InsertOutcome::Created(job) = store
            .insert_job(&new_job("10.0.0.1", JobKind::Upgrade))
            .await
            .unwrap()
        else {
            panic!("job not created");
        };
        store.mark_job_running(&job.job_id, Utc::now()).await.unwrap();
        assert_eq!(store.fail_interrupted_jobs().await.unwrap(), 1);
        let failed = store.get_job(&job.job_id).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.error.unwrap().contains("restart"));
    }

    #[tokio::test]
    async fn job_log_is_ordered_and_incremental() {
        let store = test_store();
        let a = store.append_job_log("job-a", "first").await.unwrap();
        let _ = store.append_job_log("job-b", "other").await.unwrap();
        let b = store.append_job_log("job-a", "second").await.unwrap();
        assert!(b.seq > a.seq);

        let all = store.job_log("job-a", 0, 100).await.unwrap();
        let messages: Vec<_> = all.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["first", "second"]);

        let tail = store.job_log("job-a", a.seq, 100).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].message, "second");
    }

    #[tokio::test]
    async fn clear_inventory_removes_everything() {
        let store = test_store();
        store
            .upsert_discovered(&discovered("10.0.0.1", "C9300-48P", "17.06.05"))
            .await
            .unwrap();
        store
            .insert_job(&new_job("10.0.0.1", JobKind::Precheck))
            .await
            .unwrap();
        store.append_job_log("x", "line").await.unwrap();
        store.clear_inventory().await.unwrap();
        assert!(store.list_devices().await.unwrap().is_empty());
        assert!(store.list_jobs(10).await.unwrap().is_empty());
        assert!(store.job_log("x", 0, 10).await.unwrap().is_empty());
    }
}
