use anyhow::Result;
use rusqlite::{Row, params};

use super::types::{DeviceRecord, DiscoveredDevice, ImageStatus, MemberSpace, Reachability};
use super::{Store, now};
use crate::core::profile::DeviceProfile;
use crate::core::transport::ChannelState;

const DEVICE_COLUMNS: &str = "address, hostname, serial, model, family, filesystem, stack_capable, \
     supported, image_tag, version, boot_variable, ignore_startup_config, config_register, \
     member_space_json, target_image, image_status, precheck_status, precheck_summary, \
     channel_state, reachability, updated_at";

fn device_from_row(row: &Row<'_>) -> rusqlite::Result<DeviceRecord> {
    let members_json: String = row.get(13)?;
    // A corrupt snapshot only loses the space figures, not the device.
    let members: Vec<MemberSpace> = serde_json::from_str(&members_json).unwrap_or_default();
    Ok(DeviceRecord {
        address: row.get(0)?,
        hostname: row.get(1)?,
        serial: row.get(2)?,
        model: row.get(3)?,
        profile: DeviceProfile {
            family: row.get(4)?,
            filesystem: row.get(5)?,
            stack_capable: row.get(6)?,
            supported: row.get(7)?,
            image_tag: row.get(8)?,
        },
        version: row.get(9)?,
        boot_variable: row.get(10)?,
        ignore_startup_config: row.get(11)?,
        config_register: row.get(12)?,
        members,
        target_image: row.get(14)?,
        image_status: row.get(15)?,
        precheck_status: row.get(16)?,
        precheck_summary: row.get(17)?,
        channel_state: row.get(18)?,
        reachability: row.get(19)?,
        updated_at: row.get(20)?,
    })
}

impl Store {
    /// Insert or refresh a device from discovery.
    ///
    /// Classification sticks while the model is unchanged. Target image,
    /// image status and precheck status also survive a rediscovery of the
    /// same model; a new model resets the precheck gate.
    pub async fn upsert_discovered(&self, device: &DiscoveredDevice) -> Result<DeviceRecord> {
        let members_json = serde_json::to_string(&device.members)?;
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO devices (address, hostname, serial, model, family, filesystem, stack_capable,
                 supported, image_tag, version, boot_variable, ignore_startup_config, config_register,
                 member_space_json, channel_state, reachability, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, 'online', ?16)
             ON CONFLICT(address) DO UPDATE SET
                 hostname = excluded.hostname,
                 serial = excluded.serial,
                 family = CASE WHEN devices.model = excluded.model THEN devices.family ELSE excluded.family END,
                 filesystem = CASE WHEN devices.model = excluded.model THEN devices.filesystem ELSE excluded.filesystem END,
                 stack_capable = CASE WHEN devices.model = excluded.model THEN devices.stack_capable ELSE excluded.stack_capable END,
                 supported = CASE WHEN devices.model = excluded.model THEN devices.supported ELSE excluded.supported END,
                 image_tag = CASE WHEN devices.model = excluded.model THEN devices.image_tag ELSE excluded.image_tag END,
                 precheck_status = CASE WHEN devices.model = excluded.model THEN devices.precheck_status ELSE 'not_run' END,
                 precheck_summary = CASE WHEN devices.model = excluded.model THEN devices.precheck_summary ELSE NULL END,
                 model = excluded.model,
                 version = excluded.version,
                 boot_variable = excluded.boot_variable,
                 ignore_startup_config = excluded.ignore_startup_config,
                 config_register = excluded.config_register,
                 member_space_json = excluded.member_space_json,
                 channel_state = excluded.channel_state,
                 reachability = 'online',
                 updated_at = excluded.updated_at",
            params![
                device.address,
                device.hostname,
                device.serial,
                device.model,
                device.profile.family,
                device.profile.filesystem,
                device.profile.stack_capable,
                device.profile.supported,
                device.profile.image_tag,
                device.version,
                device.boot_variable,
                device.ignore_startup_config,
                device.config_register,
                members_json,
                device.channel_state,
                now(),
            ],
        )?;
        let record = db.query_row(
            &format!("SELECT {} FROM devices WHERE address = ?1", DEVICE_COLUMNS),
            params![device.address],
            device_from_row,
        )?;
        Ok(record)
    }

    pub async fn get_device(&self, address: &str) -> Result<Option<DeviceRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM devices WHERE address = ?1 LIMIT 1",
            DEVICE_COLUMNS
        ))?;
        let mut rows = stmt.query(params![address])?;
        if let Some(row) = rows.next()? {
            Ok(Some(device_from_row(row)?))
        } else {
            Ok(None)
        }
    }

    pub async fn list_devices(&self) -> Result<Vec<DeviceRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM devices ORDER BY address ASC",
            DEVICE_COLUMNS
        ))?;
        let rows = stmt.query_map([], device_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Point the device at a new image. Picking a different image invalidates
    /// the transfer status and the precheck gate; re-selecting the current one
    /// changes nothing.
    pub async fn set_target_image(&self, address: &str, image: Option<&str>) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE devices SET
                 image_status = CASE WHEN target_image IS ?2 THEN image_status ELSE 'not_copied' END,
                 precheck_status = CASE WHEN target_image IS ?2 THEN precheck_status ELSE 'not_run' END,
                 precheck_summary = CASE WHEN target_image IS ?2 THEN precheck_summary ELSE NULL END,
                 target_image = ?2,
                 updated_at = ?3
             WHERE address = ?1",
            params![address, image, now()],
        )?;
        Ok(rows > 0)
    }

    pub async fn set_image_status(&self, address: &str, status: ImageStatus) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE devices SET image_status = ?2, updated_at = ?3 WHERE address = ?1",
            params![address, status, now()],
        )?;
        Ok(rows > 0)
    }

    pub async fn set_channel_state(&self, address: &str, state: ChannelState) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE devices SET channel_state = ?2, updated_at = ?3 WHERE address = ?1",
            params![address, state, now()],
        )?;
        Ok(rows > 0)
    }

    pub async fn set_reachability(&self, address: &str, reachability: Reachability) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE devices SET reachability = ?2, updated_at = ?3 WHERE address = ?1",
            params![address, reachability, now()],
        )?;
        Ok(rows > 0)
    }

    /// Record the free space seen by the latest precheck.
    pub async fn set_member_space(&self, address: &str, members: &[MemberSpace]) -> Result<bool> {
        let json = serde_json::to_string(members)?;
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE devices SET member_space_json = ?2, updated_at = ?3 WHERE address = ?1",
            params![address, json, now()],
        )?;
        Ok(rows > 0)
    }

    /// Force the precheck gate closed, e.g. after the device was upgraded.
    pub async fn reset_precheck_status(&self, address: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE devices SET precheck_status = 'not_run', precheck_summary = NULL, updated_at = ?2
             WHERE address = ?1",
            params![address, now()],
        )?;
        Ok(rows > 0)
    }
}
