use anyhow::Result;
use rusqlite::params;

use super::types::{PrecheckRecord, PrecheckStatus};
use super::{Store, now};
use crate::core::precheck::CheckOutcome;

impl Store {
    /// Store a complete precheck run. The previous result set of the device
    /// is dropped and the aggregate written in the same transaction.
    pub async fn replace_precheck_results(
        &self,
        address: &str,
        outcomes: &[CheckOutcome],
        aggregate: PrecheckStatus,
        summary: Option<&str>,
    ) -> Result<()> {
        let checked_at = now();
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        tx.execute("DELETE FROM prechecks WHERE address = ?1", params![address])?;
        {
            let mut insert = tx.prepare(
                "INSERT OR REPLACE INTO prechecks (address, check_name, result, message, checked_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for outcome in outcomes {
                insert.execute(params![
                    address,
                    outcome.name,
                    outcome.result,
                    outcome.message,
                    checked_at
                ])?;
            }
        }
        tx.execute(
            "UPDATE devices SET precheck_status = ?2, precheck_summary = ?3, updated_at = ?4
             WHERE address = ?1",
            params![address, aggregate, summary, checked_at],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub async fn get_precheck_results(&self, address: &str) -> Result<Vec<PrecheckRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT address, check_name, result, message, checked_at
             FROM prechecks WHERE address = ?1 ORDER BY rowid ASC",
        )?;
        let rows = stmt.query_map(params![address], |row| {
            Ok(PrecheckRecord {
                address: row.get(0)?,
                check_name: row.get(1)?,
                result: row.get(2)?,
                message: row.get(3)?,
                checked_at: row.get(4)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}
