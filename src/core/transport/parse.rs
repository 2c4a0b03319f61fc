//! Parsers that turn device output into typed facts.
//!
//! Each logical read has a structured (YANG JSON) parser and a command-output
//! parser producing the same type, so the session can fall back between them.

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

use super::{FilesystemUsage, InstallOutcome, InstallState, SystemFacts};

pub const HARDWARE_PATH: &str =
    "Cisco-IOS-XE-device-hardware-oper:device-hardware-data/device-hardware";
pub const HOSTNAME_PATH: &str = "Cisco-IOS-XE-native:native/hostname";
pub const BOOT_PATH: &str = "Cisco-IOS-XE-native:native/boot/system";
pub const STACK_PATH: &str = "Cisco-IOS-XE-stack-oper:stack-oper-data/stack-node";
pub const FILESYSTEM_PATH: &str =
    "Cisco-IOS-XE-platform-software-oper:cisco-platform-software/q-filesystem";

static VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Version ([^\s,]+)").expect("valid regex"));
static HOSTNAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^(\S+)\s+uptime is").expect("valid regex"));
static MODEL_NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^Model [Nn]umber\s*:\s*(\S+)").expect("valid regex"));
static CHASSIS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^cisco\s+(\S+)\s+\(").expect("valid regex"));
static SERIAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)(?:System [Ss]erial [Nn]umber\s*:\s*|Processor board ID\s+)(\S+)")
        .expect("valid regex")
});
static CONFREG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Configuration register is (0x[0-9A-Fa-f]+)").expect("valid regex")
});
static IMAGE_FILE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"System image file is "([^"]+)""#).expect("valid regex"));
static BOOT_VAR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*(?:BOOT variable|BOOT path-list)[ \t]*[=:][ \t]*(.*?)[ \t]*$")
        .expect("valid regex")
});
static DIR_TOTAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+) bytes total \((\d+) bytes free\)").expect("valid regex")
});
static DIR_FREE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+) bytes free").expect("valid regex"));
static ROMVAR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"SWITCH_IGNORE_STARTUP_CFG\s*=\s*(\d)").expect("valid regex")
});
static SWITCH_MEMBER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?mi)^\s*\*?\s*(\d+)\s+(?:active|standby|member)\s").expect("valid regex")
});
static MD5_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([0-9a-fA-F]{32})\b").expect("valid regex"));
static STACK_FS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^flash-(\d+):$").expect("valid regex"));

/// Output that a command was rejected by the device parser.
pub fn is_rejected(output: &str) -> bool {
    let lower = output.to_ascii_lowercase();
    lower.contains("% invalid input") || lower.contains("% incomplete command")
}

pub fn parse_show_version(output: &str) -> Option<SystemFacts> {
    let version = VERSION_RE.captures(output)?.get(1)?.as_str().to_string();
    let model = MODEL_NUMBER_RE
        .captures(output)
        .or_else(|| CHASSIS_RE.captures(output))?
        .get(1)?
        .as_str()
        .to_string();
    Some(SystemFacts {
        hostname: capture(&HOSTNAME_RE, output),
        model,
        serial: capture(&SERIAL_RE, output),
        version,
        config_register: capture(&CONFREG_RE, output),
        system_image: capture(&IMAGE_FILE_RE, output),
    })
}

fn capture(re: &Regex, text: &str) -> Option<String> {
    re.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

pub fn parse_structured_hardware(value: &Value) -> Option<SystemFacts> {
    let hardware = value.get("Cisco-IOS-XE-device-hardware-oper:device-hardware")?;
    let chassis = hardware
        .get("device-inventory")?
        .as_array()?
        .iter()
        .find(|item| item.get("hw-type").and_then(Value::as_str) == Some("hw-type-chassis"))?;
    let model = chassis.get("part-number")?.as_str()?.trim().to_string();
    if model.is_empty() {
        return None;
    }
    let software = hardware
        .get("device-system-data")?
        .get("software-version")?
        .as_str()?;
    let version = capture(&VERSION_RE, software).unwrap_or_else(|| software.trim().to_string());
    Some(SystemFacts {
        hostname: None,
        model,
        serial: chassis
            .get("serial-number")
            .and_then(Value::as_str)
            .map(str::to_string),
        version,
        config_register: None,
        system_image: None,
    })
}

pub fn parse_structured_hostname(value: &Value) -> Option<String> {
    value
        .get("Cisco-IOS-XE-native:hostname")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Boot entries from `show boot` / `show bootvar`, joined with `;`.
pub fn parse_boot_variable(output: &str) -> Option<String> {
    if is_rejected(output) {
        return None;
    }
    let entries: Vec<&str> = BOOT_VAR_RE
        .captures_iter(output)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().trim_end_matches(';'))
        .collect();
    if entries.is_empty() {
        return None;
    }
    Some(entries.join(";"))
}

pub fn parse_structured_boot(value: &Value) -> Option<String> {
    let mut leaves = Vec::new();
    collect_strings(value, &mut leaves);
    if leaves.is_empty() {
        None
    } else {
        Some(leaves.join(";"))
    }
}

fn collect_strings(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => out.push(s.clone()),
        Value::Array(items) => items.iter().for_each(|v| collect_strings(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_strings(v, out)),
        _ => {}
    }
}

pub fn parse_dir_usage(output: &str) -> Option<FilesystemUsage> {
    if let Some(caps) = DIR_TOTAL_RE.captures(output) {
        return Some(FilesystemUsage {
            total_bytes: caps.get(1)?.as_str().parse().ok(),
            free_bytes: caps.get(2)?.as_str().parse().ok()?,
        });
    }
    let free = DIR_FREE_RE.captures(output)?.get(1)?.as_str().parse().ok()?;
    Some(FilesystemUsage {
        total_bytes: None,
        free_bytes: free,
    })
}

fn json_u64(value: Option<&Value>) -> Option<u64> {
    match value? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Usage of `filesystem` from the platform-software model. Sizes there are
/// in kilobytes; stack members report `flash:` under their chassis number.
pub fn parse_structured_filesystem(value: &Value, filesystem: &str) -> Option<FilesystemUsage> {
    let entries = value
        .get("Cisco-IOS-XE-platform-software-oper:q-filesystem")?
        .as_array()?;
    let member = STACK_FS_RE
        .captures(filesystem)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<i64>().ok());

    for entry in entries {
        if let Some(member) = member
            && entry.get("chassis").and_then(Value::as_i64) != Some(member)
        {
            continue;
        }
        let Some(partitions) = entry.get("partitions").and_then(Value::as_array) else {
            continue;
        };
        for partition in partitions {
            let name = partition.get("name").and_then(Value::as_str).unwrap_or("");
            let matches = name == filesystem || (member.is_some() && name == "flash:");
            if !matches {
                continue;
            }
            let total_kb = json_u64(partition.get("total-size"))?;
            let used_kb = json_u64(partition.get("used-size"))?;
            return Some(FilesystemUsage {
                total_bytes: Some(total_kb * 1024),
                free_bytes: total_kb.saturating_sub(used_kb) * 1024,
            });
        }
    }
    None
}

/// Whether a `dir <fs><file>` listing shows the file.
pub fn parse_file_listed(output: &str, filename: &str) -> bool {
    let lower = output.to_ascii_lowercase();
    const MISSING: [&str; 5] = [
        "error opening",
        "no such file",
        "not found",
        "invalid input",
        "% bad device",
    ];
    if MISSING.iter().any(|marker| lower.contains(marker)) {
        return false;
    }
    output.lines().any(|line| {
        let trimmed = line.trim();
        trimmed.contains(filename)
            && !trimmed.starts_with("dir ")
            && !trimmed.starts_with("Directory of")
            && !trimmed.ends_with('#')
    })
}

/// `Some(true)` when the ROM variable asks the switch to ignore its startup
/// configuration. An absent variable means the flag is clear.
pub fn parse_romvar(output: &str) -> Option<bool> {
    if is_rejected(output) {
        return None;
    }
    match ROMVAR_RE.captures(output).and_then(|c| c.get(1)) {
        Some(value) => Some(value.as_str() == "1"),
        None => Some(false),
    }
}

pub fn parse_config_register(output: &str) -> Option<String> {
    capture(&CONFREG_RE, output)
}

/// Bit 6 of the configuration register makes the router skip NVRAM.
pub fn config_register_ignores_startup(register: &str) -> Option<bool> {
    let digits = register
        .trim()
        .trim_start_matches("0x")
        .trim_start_matches("0X");
    u32::from_str_radix(digits, 16)
        .ok()
        .map(|value| value & 0x0040 != 0)
}

pub fn parse_switch_members(output: &str) -> Option<Vec<u32>> {
    if is_rejected(output) {
        return None;
    }
    let mut members: Vec<u32> = SWITCH_MEMBER_RE
        .captures_iter(output)
        .filter_map(|c| c.get(1)?.as_str().parse().ok())
        .collect();
    members.sort_unstable();
    members.dedup();
    Some(members)
}

pub fn parse_structured_stack(value: &Value) -> Option<Vec<u32>> {
    let nodes = value
        .get("Cisco-IOS-XE-stack-oper:stack-node")?
        .as_array()?;
    let mut members: Vec<u32> = nodes
        .iter()
        .filter_map(|node| json_u64(node.get("chassis-number")))
        .filter_map(|n| u32::try_from(n).ok())
        .collect();
    members.sort_unstable();
    members.dedup();
    Some(members)
}

/// State of the running image from `show install summary`. Lines tagged
/// `IMG` carry the state in the second column: `C` committed, `U`
/// activated but not committed.
pub fn parse_install_summary(output: &str) -> InstallState {
    let mut committed = false;
    let mut uncommitted = false;
    for line in output.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 3 || parts[0] != "IMG" {
            continue;
        }
        if parts[1].contains('U') {
            uncommitted = true;
        } else if parts[1].contains('C') {
            committed = true;
        }
    }
    if uncommitted {
        InstallState::Uncommitted
    } else if committed {
        InstallState::Committed
    } else {
        InstallState::Unknown
    }
}

pub fn parse_md5(output: &str) -> Option<String> {
    let line = output
        .lines()
        .find(|l| l.contains('=') && MD5_RE.is_match(l))
        .or_else(|| output.lines().find(|l| MD5_RE.is_match(l)))?;
    capture(&MD5_RE, line).map(|h| h.to_ascii_lowercase())
}

pub fn parse_feature_enabled(output: &str, feature: &str) -> bool {
    output.lines().any(|line| line.trim() == feature)
}

const INSTALL_FAILURE_MARKERS: [&str; 5] = [
    "%error",
    "failed",
    "failure",
    "error:",
    "system configuration has been modified",
];

const INSTALL_SUCCESS_MARKERS: [&str; 7] = [
    "success: install_add_activate_commit",
    "install add file activated commit",
    "install_add_activate_commit: end",
    "reloading",
    "system is going down",
    "reload requested",
    "going to be restarted",
];

/// Decide the result of the one-step install from its output. Failure
/// markers win over success markers, and output with neither is a failure.
pub fn classify_install(output: &str) -> InstallOutcome {
    let lower = output.to_ascii_lowercase();
    if let Some(marker) = INSTALL_FAILURE_MARKERS.iter().find(|m| lower.contains(*m)) {
        let line = output
            .lines()
            .find(|l| l.to_ascii_lowercase().contains(marker))
            .unwrap_or(*marker)
            .trim();
        return InstallOutcome::Failed(format!("install reported failure: {}", line));
    }
    match INSTALL_SUCCESS_MARKERS.iter().find(|m| lower.contains(*m)) {
        Some(marker) => InstallOutcome::Succeeded(format!("install confirmed ({})", marker)),
        None => InstallOutcome::Failed(
            "install output contained no success confirmation".to_string(),
        ),
    }
}

/// Result of a maintenance `install` command such as `install commit`.
pub fn classify_maintenance(output: &str) -> InstallOutcome {
    let lower = output.to_ascii_lowercase();
    if is_rejected(output) || INSTALL_FAILURE_MARKERS.iter().any(|m| lower.contains(m)) {
        let line = output
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("")
            .trim();
        InstallOutcome::Failed(format!("device reported failure: {}", line))
    } else {
        InstallOutcome::Succeeded("completed".to_string())
    }
}
