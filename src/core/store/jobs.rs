use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, params};

use super::types::{InsertOutcome, JobLogEntry, JobRecord, NewJob};
use super::{Store, now, timestamp};
use crate::core::orchestrator::JobStatus;

const JOB_COLUMNS: &str = "job_id, kind, device, image, target_version, action, status, \
     scheduled_at, timezone, summary, error, created_at, started_at, finished_at";

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<JobRecord> {
    Ok(JobRecord {
        job_id: row.get(0)?,
        kind: row.get(1)?,
        device: row.get(2)?,
        image: row.get(3)?,
        target_version: row.get(4)?,
        action: row.get(5)?,
        status: row.get(6)?,
        scheduled_at: row.get(7)?,
        timezone: row.get(8)?,
        summary: row.get(9)?,
        error: row.get(10)?,
        created_at: row.get(11)?,
        started_at: row.get(12)?,
        finished_at: row.get(13)?,
    })
}

fn active_job_id(db: &Connection, device: &str) -> rusqlite::Result<Option<String>> {
    db.query_row(
        "SELECT job_id FROM jobs
         WHERE device = ?1 AND status IN ('pending', 'scheduled', 'running') LIMIT 1",
        params![device],
        |row| row.get(0),
    )
    .optional()
}

fn select_jobs(db: &Connection, filter: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<JobRecord>> {
    let mut stmt = db.prepare(&format!("SELECT {} FROM jobs {}", JOB_COLUMNS, filter))?;
    let rows = stmt.query_map(args, job_from_row)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

impl Store {
    /// Create a job unless the device already has an active one. The check
    /// and the insert run under one lock; the partial unique index catches
    /// anything that slips past.
    pub async fn insert_job(&self, job: &NewJob) -> Result<InsertOutcome> {
        let db = self.db.lock().await;
        if let Some(job_id) = active_job_id(&db, &job.device)? {
            return Ok(InsertOutcome::Conflict { job_id });
        }

        let job_id = uuid::Uuid::new_v4().to_string();
        let status = if job.scheduled_at.is_some() {
            JobStatus::Scheduled
        } else {
            JobStatus::Pending
        };
        let inserted = db.execute(
            "INSERT INTO jobs (job_id, kind, device, image, target_version, action, status,
                 scheduled_at, timezone, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                job_id,
                job.kind,
                job.device,
                job.image,
                job.target_version,
                job.action,
                status,
                job.scheduled_at.map(timestamp),
                job.timezone,
                now(),
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                let job_id = active_job_id(&db, &job.device)?.unwrap_or_default();
                return Ok(InsertOutcome::Conflict { job_id });
            }
            Err(err) => return Err(err.into()),
        }

        let record = db.query_row(
            &format!("SELECT {} FROM jobs WHERE job_id = ?1", JOB_COLUMNS),
            params![job_id],
            job_from_row,
        )?;
        Ok(InsertOutcome::Created(record))
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>> {
        let db = self.db.lock().await;
        let record = db
            .query_row(
                &format!("SELECT {} FROM jobs WHERE job_id = ?1", JOB_COLUMNS),
                params![job_id],
                job_from_row,
            )
            .optional()?;
        Ok(record)
    }

    pub async fn list_jobs(&self, limit: usize) -> Result<Vec<JobRecord>> {
        let db = self.db.lock().await;
        select_jobs(
            &db,
            "ORDER BY created_at DESC, rowid DESC LIMIT ?1",
            &[&(limit as i64)],
        )
    }

    pub async fn active_job_for(&self, device: &str) -> Result<Option<String>> {
        let db = self.db.lock().await;
        Ok(active_job_id(&db, device)?)
    }

    pub async fn has_running_jobs(&self) -> Result<bool> {
        let db = self.db.lock().await;
        let count: i64 = db.query_row(
            "SELECT COUNT(*) FROM jobs WHERE status = 'running'",
            [],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Pending jobs, oldest first.
    pub async fn pending_jobs(&self) -> Result<Vec<JobRecord>> {
        let db = self.db.lock().await;
        select_jobs(&db, "WHERE status = 'pending' ORDER BY created_at ASC", &[])
    }

    pub async fn scheduled_jobs(&self) -> Result<Vec<JobRecord>> {
        let db = self.db.lock().await;
        select_jobs(
            &db,
            "WHERE status = 'scheduled' ORDER BY scheduled_at ASC",
            &[],
        )
    }

    /// Scheduled jobs whose trigger time is at or before `now`.
    pub async fn due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<JobRecord>> {
        let db = self.db.lock().await;
        select_jobs(
            &db,
            "WHERE status = 'scheduled' AND scheduled_at <= ?1 ORDER BY scheduled_at ASC",
            &[&timestamp(now)],
        )
    }

    /// Atomically move a job to `running`. Pending jobs start at once,
    /// scheduled ones only when due. Returns false if another dispatcher won
    /// or the job was cancelled.
    pub async fn mark_job_running(&self, job_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let at = timestamp(now);
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE jobs SET status = 'running', started_at = ?2
             WHERE job_id = ?1
               AND (status = 'pending' OR (status = 'scheduled' AND scheduled_at <= ?2))",
            params![job_id, at],
        )?;
        Ok(rows > 0)
    }

    /// Write the terminal status of a running job.
    pub async fn finish_job(
        &self,
        job_id: &str,
        status: JobStatus,
        summary: Option<&str>,
        error: Option<&str>,
    ) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE jobs SET status = ?2, summary = ?3, error = ?4, finished_at = ?5
             WHERE job_id = ?1 AND status = 'running'",
            params![job_id, status, summary, error, now()],
        )?;
        Ok(rows > 0)
    }

    pub async fn cancel_job(&self, job_id: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE jobs SET status = 'cancelled', finished_at = ?2
             WHERE job_id = ?1 AND status IN ('pending', 'scheduled')",
            params![job_id, now()],
        )?;
        Ok(rows > 0)
    }

    pub async fn reschedule_job(
        &self,
        job_id: &str,
        at: DateTime<Utc>,
        timezone: &str,
    ) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE jobs SET status = 'scheduled', scheduled_at = ?2, timezone = ?3
             WHERE job_id = ?1 AND status IN ('pending', 'scheduled')",
            params![job_id, timestamp(at), timezone],
        )?;
        Ok(rows > 0)
    }

    /// Jobs still marked running from a previous process can never finish.
    pub async fn fail_interrupted_jobs(&self) -> Result<usize> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE jobs SET status = 'failed', error = 'interrupted by service restart', finished_at = ?1
             WHERE status = 'running'",
            params![now()],
        )?;
        Ok(rows)
    }

    pub async fn append_job_log(&self, job_id: &str, message: &str) -> Result<JobLogEntry> {
        let created_at = now();
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO job_logs (job_id, message, created_at) VALUES (?1, ?2, ?3)",
            params![job_id, message, created_at],
        )?;
        Ok(JobLogEntry {
            seq: db.last_insert_rowid(),
            job_id: job_id.to_string(),
            message: message.to_string(),
            created_at,
        })
    }

    /// Log lines of a job with `seq` greater than `after`.
    pub async fn job_log(&self, job_id: &str, after: i64, limit: usize) -> Result<Vec<JobLogEntry>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT id, job_id, message, created_at FROM job_logs
             WHERE job_id = ?1 AND id > ?2 ORDER BY id ASC LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![job_id, after, limit as i64], |row| {
            Ok(JobLogEntry {
                seq: row.get(0)?,
                job_id: row.get(1)?,
                message: row.get(2)?,
                created_at: row.get(3)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}
