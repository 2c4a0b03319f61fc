//! Scripted devices for tests.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

use super::parse;
use super::{CommandChannel, Connector, PromptReply, StructuredChannel, TransportError};
use crate::core::profile::DeviceFamily;

const MB: u64 = 1024 * 1024;

pub(crate) struct FakeDevice {
    pub address: String,
    family: DeviceFamily,
    hostname: String,
    model: String,
    version: String,
    config_register: String,
    boot_variable: String,
    ignore_startup: bool,
    members_free_mb: Vec<u64>,
    install_summary: String,
    install_output: String,
    install_delay: Duration,
    copy_md5: String,
    structured: bool,
    auth_rejected: bool,
    timeouts: HashSet<String>,
    connect_failures: AtomicUsize,
    feature_enabled: AtomicBool,
    files: Mutex<HashMap<String, String>>,
    log: Mutex<Vec<String>>,
}

impl FakeDevice {
    pub fn switch(address: &str, model: &str, version: &str, members_free_mb: &[u64]) -> Self {
        Self::new(address, DeviceFamily::Switch, model, version, members_free_mb.to_vec())
    }

    pub fn router(address: &str, model: &str, version: &str, free_mb: u64) -> Self {
        Self::new(address, DeviceFamily::Router, model, version, vec![free_mb])
    }

    fn new(
        address: &str,
        family: DeviceFamily,
        model: &str,
        version: &str,
        members_free_mb: Vec<u64>,
    ) -> Self {
        Self {
            address: address.to_string(),
            family,
            hostname: format!("fake-{}", address.replace('.', "-")),
            model: model.to_string(),
            version: version.to_string(),
            config_register: "0x2102".to_string(),
            boot_variable: format!("{}packages.conf", family.filesystem()),
            ignore_startup: false,
            members_free_mb,
            install_summary: format!("IMG   C    {}.0.1\n", version),
            install_output: "install_add_activate_commit: START\nSUCCESS: install_add_activate_commit\n".to_string(),
            install_delay: Duration::ZERO,
            copy_md5: "d41d8cd98f00b204e9800998ecf8427e".to_string(),
            structured: false,
            auth_rejected: false,
            timeouts: HashSet::new(),
            connect_failures: AtomicUsize::new(0),
            feature_enabled: AtomicBool::new(false),
            files: Mutex::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn enable_structured(&mut self) {
        self.structured = true;
        self.feature_enabled.store(true, Ordering::SeqCst);
    }

    pub fn reject_auth(&mut self) {
        self.auth_rejected = true;
    }

    pub fn time_out_on(&mut self, command: &str) {
        self.timeouts.insert(command.to_string());
    }

    pub fn fail_next_connects(&self, count: usize) {
        self.connect_failures.store(count, Ordering::SeqCst);
    }

    pub fn set_config_register(&mut self, register: &str) {
        self.config_register = register.to_string();
    }

    pub fn set_boot_variable(&mut self, boot: &str) {
        self.boot_variable = boot.to_string();
    }

    pub fn set_ignore_startup(&mut self, ignore: bool) {
        self.ignore_startup = ignore;
    }

    pub fn set_install_summary(&mut self, summary: &str) {
        self.install_summary = summary.to_string();
    }

    pub fn set_install_output(&mut self, output: &str) {
        self.install_output = output.to_string();
    }

    pub fn set_install_delay(&mut self, delay: Duration) {
        self.install_delay = delay;
    }

    /// Digest the device computes for any file copied onto it.
    pub fn set_copy_md5(&mut self, md5: &str) {
        self.copy_md5 = md5.to_string();
    }

    pub fn add_file(&self, filename: &str, md5: &str) {
        if let Ok(mut files) = self.files.lock() {
            files.insert(filename.to_string(), md5.to_string());
        }
    }

    pub fn has_file(&self, filename: &str) -> bool {
        self.files
            .lock()
            .map(|files| files.contains_key(filename))
            .unwrap_or(false)
    }

    pub fn commands_run(&self) -> Vec<String> {
        self.log.lock().map(|l| l.clone()).unwrap_or_default()
    }

    fn record(&self, entry: String) {
        if let Ok(mut log) = self.log.lock() {
            log.push(entry);
        }
    }

    fn member_filesystems(&self) -> Vec<(String, u64)> {
        let mut out = Vec::new();
        let fs = self.family.filesystem();
        if let Some(first) = self.members_free_mb.first() {
            out.push((fs.to_string(), *first));
        }
        if self.family == DeviceFamily::Switch {
            for (i, free) in self.members_free_mb.iter().enumerate() {
                out.push((format!("flash-{}:", i + 1), *free));
            }
        }
        out
    }

    fn show_version(&self) -> String {
        let mut out = format!(
            "Cisco IOS XE Software, Version {}\n{} uptime is 3 weeks, 2 days\nSystem image file is \"{}packages.conf\"\ncisco {} (X86) processor with 1392780K bytes of memory.\nProcessor board ID FOC{}\n",
            self.version,
            self.hostname,
            self.family.filesystem(),
            self.model,
            self.address.replace('.', ""),
        );
        if self.family == DeviceFamily::Switch {
            out.push_str(&format!("Model Number                       : {}\n", self.model));
        }
        out.push_str(&format!("Configuration register is {}\n", self.config_register));
        out
    }

    fn respond(&self, command: &str) -> String {
        let fs = self.family.filesystem();
        match command {
            "show version" => return self.show_version(),
            "show boot" | "show bootvar" => {
                return format!("BOOT variable = {};\nManual Boot = no\n", self.boot_variable);
            }
            "show romvar" => {
                return format!(
                    "MANUAL_BOOT=no\nSWITCH_IGNORE_STARTUP_CFG={}\n",
                    if self.ignore_startup { 1 } else { 0 }
                );
            }
            "show switch" => {
                let mut out =
                    String::from("Switch#   Role    Mac Address     Priority Version  State\n");
                for n in 1..=self.members_free_mb.len() {
                    let (marker, role) = if n == 1 { ('*', "Active") } else { (' ', "Member") };
                    out.push_str(&format!(
                        "{}{}       {}   f4bd.9e56.3e8{}     1      V01     Ready\n",
                        marker, n, role, n
                    ));
                }
                return out;
            }
            "show install summary" => return self.install_summary.clone(),
            "write memory" => return "Building configuration...\n[OK]\n".to_string(),
            "install remove inactive" => {
                return "install_remove: START\nSUCCESS: install_remove\n".to_string();
            }
            "install commit" => return "install_commit: START\nSUCCESS: install_commit\n".to_string(),
            _ => {}
        }
        if let Some(feature) = command.strip_prefix("show running-config | include ") {
            return if self.feature_enabled.load(Ordering::SeqCst) {
                format!("{}\n", feature)
            } else {
                String::new()
            };
        }
        if let Some(path) = command.strip_prefix("dir ") {
            for (member_fs, free) in self.member_filesystems() {
                if path == member_fs {
                    return format!(
                        "Directory of {}/\n\n11353194496 bytes total ({} bytes free)\n",
                        member_fs,
                        free * MB
                    );
                }
            }
            if let Some(file) = path.strip_prefix(fs) {
                return if self.has_file(file) {
                    format!("Directory of {}\n\n  21  -rw-  1234  Jan 1 2024  {}\n", path, file)
                } else {
                    format!("%Error opening {} (No such file or directory)\n", path)
                };
            }
            return format!("%Error opening {} (No such device)\n", path);
        }
        if let Some(rest) = command.strip_prefix("verify /md5 ") {
            let file = rest.strip_prefix(fs).unwrap_or(rest);
            let files = self.files.lock().map(|f| f.clone()).unwrap_or_default();
            return match files.get(file) {
                Some(md5) => format!(".....Done!\nverify /md5 ({}) = {}\n", rest, md5),
                None => format!("%Error verifying {}\n", rest),
            };
        }
        if let Some(rest) = command.strip_prefix("copy ") {
            let url = rest.split_whitespace().next().unwrap_or("");
            let file = url.rsplit('/').next().unwrap_or("").to_string();
            self.add_file(&file, &self.copy_md5);
            return format!("Accessing {}...\nLoading {} !!!!!!!!\n[OK - 1234 bytes]\n", url, file);
        }
        format!("% Invalid input detected at '^' marker.\n{}\n", command)
    }

    fn structured_get(&self, path: &str) -> Option<Value> {
        match path {
            parse::HARDWARE_PATH => Some(json!({
                "Cisco-IOS-XE-device-hardware-oper:device-hardware": {
                    "device-inventory": [
                        {"hw-type": "hw-type-chassis", "part-number": self.model, "serial-number": "FOCSTRUCT"}
                    ],
                    "device-system-data": {
                        "software-version": format!("Cisco IOS XE Software, Version {}", self.version)
                    }
                }
            })),
            parse::HOSTNAME_PATH => Some(json!({"Cisco-IOS-XE-native:hostname": self.hostname})),
            parse::BOOT_PATH => Some(json!({"Cisco-IOS-XE-native:system": {"bootfile": {
                "filename-list-ordered-by-user": [{"filename": self.boot_variable}]
            }}})),
            parse::STACK_PATH => {
                let nodes: Vec<Value> = (1..=self.members_free_mb.len())
                    .map(|n| json!({"chassis-number": n}))
                    .collect();
                Some(json!({"Cisco-IOS-XE-stack-oper:stack-node": nodes}))
            }
            parse::FILESYSTEM_PATH => {
                let total_kb: u64 = 11_000_000;
                let entries: Vec<Value> = self
                    .members_free_mb
                    .iter()
                    .enumerate()
                    .map(|(i, free)| {
                        json!({"chassis": i + 1, "partitions": [{
                            "name": self.family.filesystem(),
                            "total-size": total_kb.to_string(),
                            "used-size": total_kb.saturating_sub(free * 1024).to_string()
                        }]})
                    })
                    .collect();
                Some(json!({"Cisco-IOS-XE-platform-software-oper:q-filesystem": entries}))
            }
            _ => None,
        }
    }
}

#[derive(Default)]
pub(crate) struct FakeConnector {
    devices: Mutex<HashMap<String, Arc<FakeDevice>>>,
    structured_opens: Mutex<HashMap<String, usize>>,
    command_opens: Mutex<HashMap<String, usize>>,
    installs_running: Arc<AtomicUsize>,
    installs_peak: Arc<AtomicUsize>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, device: FakeDevice) -> Arc<FakeDevice> {
        let device = Arc::new(device);
        if let Ok(mut devices) = self.devices.lock() {
            devices.insert(device.address.clone(), device.clone());
        }
        device
    }

    pub fn device(&self, address: &str) -> Arc<FakeDevice> {
        self.devices
            .lock()
            .ok()
            .and_then(|d| d.get(address).cloned())
            .expect("fake device registered")
    }

    pub fn structured_opens(&self, address: &str) -> usize {
        count(&self.structured_opens, address)
    }

    pub fn command_opens(&self, address: &str) -> usize {
        count(&self.command_opens, address)
    }

    /// Highest number of installs that ran at the same moment.
    pub fn peak_concurrent_installs(&self) -> usize {
        self.installs_peak.load(Ordering::SeqCst)
    }

    fn lookup(&self, address: &str) -> Result<Arc<FakeDevice>, TransportError> {
        self.devices
            .lock()
            .ok()
            .and_then(|d| d.get(address).cloned())
            .ok_or_else(|| TransportError::connect(address, "no route to host"))
    }
}

fn count(map: &Mutex<HashMap<String, usize>>, address: &str) -> usize {
    map.lock()
        .ok()
        .and_then(|m| m.get(address).copied())
        .unwrap_or(0)
}

fn bump(map: &Mutex<HashMap<String, usize>>, address: &str) {
    if let Ok(mut m) = map.lock() {
        *m.entry(address.to_string()).or_insert(0) += 1;
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn open_structured(
        &self,
        address: &str,
    ) -> Result<Box<dyn StructuredChannel>, TransportError> {
        let device = self.lookup(address)?;
        if device.auth_rejected {
            return Err(TransportError::Auth {
                address: address.to_string(),
            });
        }
        if !device.structured {
            return Err(TransportError::unavailable(address, "connection refused on 443"));
        }
        bump(&self.structured_opens, address);
        Ok(Box::new(FakeStructured { device }))
    }

    async fn open_command(&self, address: &str) -> Result<Box<dyn CommandChannel>, TransportError> {
        let device = self.lookup(address)?;
        if device.auth_rejected {
            return Err(TransportError::Auth {
                address: address.to_string(),
            });
        }
        let pending = device.connect_failures.load(Ordering::SeqCst);
        if pending > 0 {
            device.connect_failures.store(pending - 1, Ordering::SeqCst);
            return Err(TransportError::connect(address, "connection reset"));
        }
        bump(&self.command_opens, address);
        Ok(Box::new(FakeCommand {
            device,
            running: self.installs_running.clone(),
            peak: self.installs_peak.clone(),
        }))
    }
}

struct FakeStructured {
    device: Arc<FakeDevice>,
}

#[async_trait]
impl StructuredChannel for FakeStructured {
    async fn get(&self, path: &str) -> Result<Value, TransportError> {
        self.device
            .structured_get(path)
            .ok_or_else(|| TransportError::protocol(&self.device.address, "404 Not Found"))
    }
}

struct FakeCommand {
    device: Arc<FakeDevice>,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl FakeCommand {
    async fn run(
        &self,
        command: &str,
        timeout: Duration,
        sink: Option<UnboundedSender<String>>,
    ) -> Result<String, TransportError> {
        self.device.record(command.to_string());
        if self.device.timeouts.contains(command) {
            return Err(TransportError::timeout(&self.device.address, command, timeout));
        }
        let output = if command.starts_with("install add file") {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.device.install_delay).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            self.device.install_output.clone()
        } else {
            self.device.respond(command)
        };
        if let Some(sink) = sink {
            for line in output.lines() {
                let _ = sink.send(line.to_string());
            }
        }
        Ok(output)
    }
}

#[async_trait]
impl CommandChannel for FakeCommand {
    async fn exec(&mut self, command: &str, timeout: Duration) -> Result<String, TransportError> {
        self.run(command, timeout, None).await
    }

    async fn exec_interactive(
        &mut self,
        command: &str,
        _replies: &[PromptReply],
        timeout: Duration,
        sink: Option<UnboundedSender<String>>,
    ) -> Result<String, TransportError> {
        self.run(command, timeout, sink).await
    }

    async fn configure(
        &mut self,
        lines: &[String],
        _timeout: Duration,
    ) -> Result<String, TransportError> {
        for line in lines {
            self.device.record(format!("conf: {}", line));
            if line.starts_with("no ") {
                self.device.feature_enabled.store(false, Ordering::SeqCst);
            } else {
                self.device.feature_enabled.store(true, Ordering::SeqCst);
            }
        }
        Ok(String::new())
    }

    async fn close(&mut self) {}
}
