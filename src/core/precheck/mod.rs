//! Pre-flight safety checks for an upgrade.
//!
//! Facts are gathered from the device first (`gather_facts`), each one
//! independently, and the rules below are then pure functions over those
//! facts. Every rule always runs; a missing fact degrades only its own rule.

mod facts;
mod version;

pub use facts::{DeviceFacts, gather_facts, member_space};
pub use version::Version;

use serde::{Deserialize, Serialize};

use crate::core::store::PrecheckStatus;
use crate::core::transport::InstallState;

pub const VERSION_CHECK: &str = "Version Comparison";
pub const BOOT_VARIABLE_CHECK: &str = "Boot Variable Integrity";
pub const DISK_SPACE_CHECK: &str = "Disk Space";
pub const BOOT_FLAG_CHECK: &str = "Boot Flag Hazard";
pub const NPE_CHECK: &str = "NPE Image";
pub const IMAGE_PRESENCE_CHECK: &str = "Image Presence";
pub const COMMIT_CHECK: &str = "Commit Status";

const MB: u64 = 1024 * 1024;
pub const DISK_FAIL_MB: u64 = 1024;
pub const DISK_WARN_MB: u64 = 2048;

const NO_TARGET: &str = "skipped, no target selected";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CheckResult {
    Pass,
    Warn,
    Fail,
    Skipped,
}

impl CheckResult {
    pub fn as_str(self) -> &'static str {
        match self {
            CheckResult::Pass => "PASS",
            CheckResult::Warn => "WARN",
            CheckResult::Fail => "FAIL",
            CheckResult::Skipped => "SKIPPED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PASS" => Some(CheckResult::Pass),
            "WARN" => Some(CheckResult::Warn),
            "FAIL" => Some(CheckResult::Fail),
            "SKIPPED" => Some(CheckResult::Skipped),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckOutcome {
    pub name: String,
    pub result: CheckResult,
    pub message: String,
}

impl CheckOutcome {
    pub fn new(name: &str, result: CheckResult, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            result,
            message: message.into(),
        }
    }
}

/// Image the device would be upgraded to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrecheckTarget {
    pub filename: String,
    pub version: Option<String>,
}

impl PrecheckTarget {
    pub fn new(filename: &str) -> Self {
        Self {
            filename: filename.to_string(),
            version: crate::core::images::version_from_filename(filename),
        }
    }
}

pub fn run_prechecks(facts: &DeviceFacts, target: Option<&PrecheckTarget>) -> Vec<CheckOutcome> {
    vec![
        check_version(facts, target),
        check_boot_variable(facts),
        check_disk_space(facts),
        check_boot_flags(facts),
        check_npe(target),
        check_image_presence(facts, target),
        check_commit(facts),
    ]
}

fn check_version(facts: &DeviceFacts, target: Option<&PrecheckTarget>) -> CheckOutcome {
    let Some(target) = target else {
        return CheckOutcome::new(VERSION_CHECK, CheckResult::Skipped, NO_TARGET);
    };
    let current = match &facts.version {
        Ok(version) => version,
        Err(err) => {
            return CheckOutcome::new(
                VERSION_CHECK,
                CheckResult::Warn,
                format!("current version unreadable: {}", err),
            );
        }
    };
    let Some(target_version) = &target.version else {
        return CheckOutcome::new(
            VERSION_CHECK,
            CheckResult::Warn,
            format!("no version found in image name {}", target.filename),
        );
    };
    let (Some(from), Some(to)) = (Version::parse(current), Version::parse(target_version)) else {
        return CheckOutcome::new(
            VERSION_CHECK,
            CheckResult::Warn,
            format!("cannot compare versions {} and {}", current, target_version),
        );
    };

    if from == to {
        let message = if from.rebuild != to.rebuild {
            format!(
                "device already runs {} (target {} differs only by rebuild letter)",
                current, to
            )
        } else {
            format!("device already runs {}", current)
        };
        CheckOutcome::new(VERSION_CHECK, CheckResult::Fail, message)
    } else if from.major != to.major {
        CheckOutcome::new(
            VERSION_CHECK,
            CheckResult::Warn,
            format!("major version jump {} -> {}", from, to),
        )
    } else if to < from {
        CheckOutcome::new(
            VERSION_CHECK,
            CheckResult::Warn,
            format!("downgrade {} -> {}", from, to),
        )
    } else {
        CheckOutcome::new(
            VERSION_CHECK,
            CheckResult::Pass,
            format!("upgrade {} -> {}", from, to),
        )
    }
}

fn check_boot_variable(facts: &DeviceFacts) -> CheckOutcome {
    match &facts.boot_variable {
        Ok(boot) if boot.to_ascii_lowercase().contains("packages.conf") => CheckOutcome::new(
            BOOT_VARIABLE_CHECK,
            CheckResult::Pass,
            format!("boots from {}", boot),
        ),
        Ok(boot) if boot.trim().is_empty() => CheckOutcome::new(
            BOOT_VARIABLE_CHECK,
            CheckResult::Fail,
            "boot variable is empty",
        ),
        Ok(boot) => CheckOutcome::new(
            BOOT_VARIABLE_CHECK,
            CheckResult::Fail,
            format!("boot variable does not reference packages.conf: {}", boot),
        ),
        Err(err) => CheckOutcome::new(
            BOOT_VARIABLE_CHECK,
            CheckResult::Fail,
            format!("boot variable unreadable: {}", err),
        ),
    }
}

fn check_disk_space(facts: &DeviceFacts) -> CheckOutcome {
    let members = match &facts.members {
        Ok(members) if !members.is_empty() => members,
        Ok(_) => {
            return CheckOutcome::new(DISK_SPACE_CHECK, CheckResult::Fail, "no filesystems reported");
        }
        Err(err) => {
            return CheckOutcome::new(
                DISK_SPACE_CHECK,
                CheckResult::Fail,
                format!("free space undeterminable: {}", err),
            );
        }
    };

    let mut failing = Vec::new();
    let mut warning = Vec::new();
    for member in members {
        match member.free_bytes {
            None => failing.push(format!("{} free space undeterminable", member.filesystem)),
            Some(free) if free < DISK_FAIL_MB * MB => failing.push(format!(
                "{} has {} MB free, needs {} MB",
                member.filesystem,
                free / MB,
                DISK_FAIL_MB
            )),
            Some(free) if free < DISK_WARN_MB * MB => warning.push(format!(
                "{} has {} MB free",
                member.filesystem,
                free / MB
            )),
            Some(_) => {}
        }
    }

    if !failing.is_empty() {
        CheckOutcome::new(DISK_SPACE_CHECK, CheckResult::Fail, failing.join(", "))
    } else if !warning.is_empty() {
        CheckOutcome::new(
            DISK_SPACE_CHECK,
            CheckResult::Warn,
            format!("{} (below {} MB)", warning.join(", "), DISK_WARN_MB),
        )
    } else {
        CheckOutcome::new(
            DISK_SPACE_CHECK,
            CheckResult::Pass,
            format!("{} filesystem(s) with at least {} MB free", members.len(), DISK_WARN_MB),
        )
    }
}

fn check_boot_flags(facts: &DeviceFacts) -> CheckOutcome {
    match &facts.boot_flags {
        Ok(flags) if flags.ignore_startup_config => {
            let source = match &flags.config_register {
                Some(register) => format!("configuration register {}", register),
                None => "SWITCH_IGNORE_STARTUP_CFG=1".to_string(),
            };
            CheckOutcome::new(
                BOOT_FLAG_CHECK,
                CheckResult::Fail,
                format!("startup configuration would be ignored on reload ({})", source),
            )
        }
        Ok(_) => CheckOutcome::new(BOOT_FLAG_CHECK, CheckResult::Pass, "startup configuration honoured"),
        Err(err) => CheckOutcome::new(
            BOOT_FLAG_CHECK,
            CheckResult::Warn,
            format!("boot flags unreadable: {}", err),
        ),
    }
}

fn check_npe(target: Option<&PrecheckTarget>) -> CheckOutcome {
    let Some(target) = target else {
        return CheckOutcome::new(NPE_CHECK, CheckResult::Skipped, NO_TARGET);
    };
    if target.filename.to_ascii_lowercase().contains("npe") {
        CheckOutcome::new(
            NPE_CHECK,
            CheckResult::Warn,
            format!("{} is a no-payload-encryption image", target.filename),
        )
    } else {
        CheckOutcome::new(NPE_CHECK, CheckResult::Pass, "standard image")
    }
}

fn check_image_presence(facts: &DeviceFacts, target: Option<&PrecheckTarget>) -> CheckOutcome {
    let Some(target) = target else {
        return CheckOutcome::new(IMAGE_PRESENCE_CHECK, CheckResult::Skipped, NO_TARGET);
    };
    match &facts.image_present {
        Some(Ok(true)) => CheckOutcome::new(
            IMAGE_PRESENCE_CHECK,
            CheckResult::Pass,
            format!("{} present on {}", target.filename, facts.filesystem),
        ),
        Some(Ok(false)) => CheckOutcome::new(
            IMAGE_PRESENCE_CHECK,
            CheckResult::Fail,
            format!("{} not found on {}", target.filename, facts.filesystem),
        ),
        Some(Err(err)) => CheckOutcome::new(
            IMAGE_PRESENCE_CHECK,
            CheckResult::Fail,
            format!("could not list {}: {}", facts.filesystem, err),
        ),
        None => CheckOutcome::new(
            IMAGE_PRESENCE_CHECK,
            CheckResult::Fail,
            format!("{} was not looked up", target.filename),
        ),
    }
}

fn check_commit(facts: &DeviceFacts) -> CheckOutcome {
    if facts.bundle_mode {
        return CheckOutcome::new(
            COMMIT_CHECK,
            CheckResult::Skipped,
            "device boots in bundle mode",
        );
    }
    match &facts.install_state {
        Ok(InstallState::Committed) => {
            CheckOutcome::new(COMMIT_CHECK, CheckResult::Pass, "running image is committed")
        }
        Ok(InstallState::Uncommitted) => CheckOutcome::new(
            COMMIT_CHECK,
            CheckResult::Warn,
            "running image is not committed",
        ),
        Ok(InstallState::Unknown) => CheckOutcome::new(
            COMMIT_CHECK,
            CheckResult::Warn,
            "install state undeterminable",
        ),
        Err(err) => CheckOutcome::new(
            COMMIT_CHECK,
            CheckResult::Warn,
            format!("install summary unreadable: {}", err),
        ),
    }
}

/// FAIL beats WARN beats PASS. Skipped checks do not count.
pub fn aggregate(outcomes: &[CheckOutcome]) -> PrecheckStatus {
    if outcomes.iter().any(|o| o.result == CheckResult::Fail) {
        PrecheckStatus::Fail
    } else if outcomes.iter().any(|o| o.result == CheckResult::Warn) {
        PrecheckStatus::Warning
    } else {
        PrecheckStatus::Pass
    }
}

/// One-line summary of failing then warning checks, `None` if all passed.
pub fn summary(outcomes: &[CheckOutcome]) -> Option<String> {
    let mut parts: Vec<String> = Vec::new();
    for wanted in [CheckResult::Fail, CheckResult::Warn] {
        for outcome in outcomes.iter().filter(|o| o.result == wanted) {
            parts.push(format!(
                "{} {}: {}",
                outcome.result.as_str(),
                outcome.name,
                outcome.message
            ));
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::MemberSpace;
    use crate::core::transport::BootFlags;

    fn member(n: u32, free_mb: Option<u64>) -> MemberSpace {
        MemberSpace {
            member: n,
            filesystem: format!("flash-{}:", n),
            free_bytes: free_mb.map(|mb| mb * MB),
            total_bytes: None,
        }
    }

    fn healthy(version: &str) -> DeviceFacts {
        DeviceFacts {
            filesystem: "flash:".into(),
            version: Ok(version.to_string()),
            bundle_mode: false,
            boot_variable: Ok("flash:packages.conf".into()),
            members: Ok(vec![member(1, Some(4000)), member(2, Some(5000))]),
            boot_flags: Ok(BootFlags {
                ignore_startup_config: false,
                config_register: None,
            }),
            install_state: Ok(InstallState::Committed),
            image_present: Some(Ok(true)),
        }
    }

    fn find<'a>(outcomes: &'a [CheckOutcome], name: &str) -> &'a CheckOutcome {
        outcomes
            .iter()
            .find(|o| o.name == name)
            .unwrap_or_else(|| panic!("missing check {}", name))
    }

    fn target(filename: &str) -> PrecheckTarget {
        PrecheckTarget::new(filename)
    }

    #[test]
    fn healthy_device_passes_everything() {
        let outcomes = run_prechecks(
            &healthy("17.06.05"),
            Some(&target("cat9k_iosxe.17.09.04a.SPA.bin")),
        );
        assert_eq!(outcomes.len(), 7);
        assert!(
            outcomes.iter().all(|o| o.result == CheckResult::Pass),
            "{:?}",
            outcomes
        );
        assert_eq!(aggregate(&outcomes), PrecheckStatus::Pass);
        assert_eq!(summary(&outcomes), None);
    }

    #[test]
    fn identical_versions_fail() {
        let outcomes = run_prechecks(
            &healthy("17.9.4"),
            Some(&target("cat9k_iosxe.17.09.04.SPA.bin")),
        );
        assert_eq!(find(&outcomes, VERSION_CHECK).result, CheckResult::Fail);
        assert_eq!(aggregate(&outcomes), PrecheckStatus::Fail);
    }

    #[test]
    fn router_image_at_running_version_fails() {
        let router_target = target("isr4300-universalk9.17.09.04.SPA.bin");
        assert_eq!(router_target.version.as_deref(), Some("17.09.04"));
        let outcomes = run_prechecks(&healthy("17.09.04"), Some(&router_target));
        let check = find(&outcomes, VERSION_CHECK);
        assert_eq!(check.result, CheckResult::Fail, "{}", check.message);
        assert_eq!(aggregate(&outcomes), PrecheckStatus::Fail);
    }

    #[test]
    fn rebuild_letter_alone_is_the_same_release() {
        let outcomes = run_prechecks(
            &healthy("17.09.04"),
            Some(&target("cat9k_iosxe.17.09.04a.SPA.bin")),
        );
        let check = find(&outcomes, VERSION_CHECK);
        assert_eq!(check.result, CheckResult::Fail);
        assert!(check.message.contains("rebuild letter"), "{}", check.message);
        assert_eq!(aggregate(&outcomes), PrecheckStatus::Fail);
    }

    #[test]
    fn major_jump_and_downgrade_warn() {
        let jump = run_prechecks(
            &healthy("16.12.05"),
            Some(&target("cat9k_iosxe.17.09.04.SPA.bin")),
        );
        let check = find(&jump, VERSION_CHECK);
        assert_eq!(check.result, CheckResult::Warn);
        assert!(check.message.contains("major"));

        let down = run_prechecks(
            &healthy("17.09.04"),
            Some(&target("cat9k_iosxe.17.06.05.SPA.bin")),
        );
        let check = find(&down, VERSION_CHECK);
        assert_eq!(check.result, CheckResult::Warn);
        assert!(check.message.contains("downgrade"));
    }

    #[test]
    fn unparseable_version_warns() {
        let outcomes = run_prechecks(&healthy("17.09.04"), Some(&target("weird-image.bin")));
        assert_eq!(find(&outcomes, VERSION_CHECK).result, CheckResult::Warn);

        let mut facts = healthy("garbage");
        facts.version = Ok("garbage".into());
        let outcomes = run_prechecks(&facts, Some(&target("cat9k.17.09.04.bin")));
        assert_eq!(find(&outcomes, VERSION_CHECK).result, CheckResult::Warn);
    }

    #[test]
    fn disk_thresholds() {
        let mut facts = healthy("17.06.05");
        facts.members = Ok(vec![member(1, Some(4000)), member(2, Some(1500))]);
        let outcomes = run_prechecks(&facts, None);
        let disk = find(&outcomes, DISK_SPACE_CHECK);
        assert_eq!(disk.result, CheckResult::Warn);
        assert!(disk.message.contains("flash-2:"));

        facts.members = Ok(vec![member(1, Some(1023)), member(2, Some(1500))]);
        let disk = find(&run_prechecks(&facts, None), DISK_SPACE_CHECK).clone();
        assert_eq!(disk.result, CheckResult::Fail);
        assert!(disk.message.contains("flash-1:"));

        facts.members = Ok(vec![member(1, Some(1024)), member(2, Some(2048))]);
        let disk = find(&run_prechecks(&facts, None), DISK_SPACE_CHECK).clone();
        assert_eq!(disk.result, CheckResult::Warn);

        facts.members = Ok(vec![member(1, Some(4000)), member(2, None)]);
        let disk = find(&run_prechecks(&facts, None), DISK_SPACE_CHECK).clone();
        assert_eq!(disk.result, CheckResult::Fail);
        assert!(disk.message.contains("undeterminable"));
    }

    #[test]
    fn boot_flag_hazard_fails() {
        let mut facts = healthy("17.06.05");
        facts.boot_flags = Ok(BootFlags {
            ignore_startup_config: true,
            config_register: Some("0x2142".into()),
        });
        let outcomes = run_prechecks(&facts, None);
        let check = find(&outcomes, BOOT_FLAG_CHECK);
        assert_eq!(check.result, CheckResult::Fail);
        assert!(check.message.contains("0x2142"));

        facts.boot_flags = Err("timed out".into());
        assert_eq!(
            find(&run_prechecks(&facts, None), BOOT_FLAG_CHECK).result,
            CheckResult::Warn
        );
    }

    #[test]
    fn boot_variable_must_reference_packages_conf() {
        let mut facts = healthy("17.06.05");
        facts.boot_variable = Ok("flash:cat9k_iosxe.17.06.05.SPA.bin".into());
        assert_eq!(
            find(&run_prechecks(&facts, None), BOOT_VARIABLE_CHECK).result,
            CheckResult::Fail
        );
        facts.boot_variable = Err("channel unavailable".into());
        assert_eq!(
            find(&run_prechecks(&facts, None), BOOT_VARIABLE_CHECK).result,
            CheckResult::Fail
        );
    }

    #[test]
    fn npe_images_warn_case_insensitively() {
        let outcomes = run_prechecks(
            &healthy("17.06.05"),
            Some(&target("cat9k_iosxe_NPE.17.09.04.SPA.bin")),
        );
        assert_eq!(find(&outcomes, NPE_CHECK).result, CheckResult::Warn);
    }

    #[test]
    fn target_dependent_checks_skip_without_target() {
        let outcomes = run_prechecks(&healthy("17.06.05"), None);
        for name in [VERSION_CHECK, NPE_CHECK, IMAGE_PRESENCE_CHECK] {
            let check = find(&outcomes, name);
            assert_eq!(check.result, CheckResult::Skipped, "{}", name);
            assert_eq!(check.message, NO_TARGET);
        }
        // Skipped checks are neutral.
        assert_eq!(aggregate(&outcomes), PrecheckStatus::Pass);
    }

    #[test]
    fn commit_status() {
        let mut facts = healthy("17.06.05");
        facts.install_state = Ok(InstallState::Uncommitted);
        assert_eq!(
            find(&run_prechecks(&facts, None), COMMIT_CHECK).result,
            CheckResult::Warn
        );
        facts.bundle_mode = true;
        assert_eq!(
            find(&run_prechecks(&facts, None), COMMIT_CHECK).result,
            CheckResult::Skipped
        );
    }

    #[test]
    fn missing_image_fails_presence() {
        let mut facts = healthy("17.06.05");
        facts.image_present = Some(Ok(false));
        let outcomes = run_prechecks(&facts, Some(&target("cat9k.17.09.04.bin")));
        assert_eq!(find(&outcomes, IMAGE_PRESENCE_CHECK).result, CheckResult::Fail);
    }

    #[test]
    fn summary_lists_failures_before_warnings() {
        let outcomes = vec![
            CheckOutcome::new(NPE_CHECK, CheckResult::Warn, "npe"),
            CheckOutcome::new(DISK_SPACE_CHECK, CheckResult::Fail, "flash-1: low"),
            CheckOutcome::new(COMMIT_CHECK, CheckResult::Pass, "ok"),
        ];
        assert_eq!(
            summary(&outcomes).as_deref(),
            Some("FAIL Disk Space: flash-1: low; WARN NPE Image: npe")
        );
        assert_eq!(aggregate(&outcomes), PrecheckStatus::Fail);
    }
}
