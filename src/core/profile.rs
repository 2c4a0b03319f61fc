//! Device classification by model identifier.
//!
//! A device belongs to one of two families. The family decides which
//! filesystem holds images and whether the chassis can be a stack of
//! several members. Classification happens once at discovery and the result
//! is stored on the device record.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceFamily {
    Switch,
    Router,
}

impl DeviceFamily {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceFamily::Switch => "switch",
            DeviceFamily::Router => "router",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "switch" => Some(DeviceFamily::Switch),
            "router" => Some(DeviceFamily::Router),
            _ => None,
        }
    }

    pub fn filesystem(self) -> &'static str {
        match self {
            DeviceFamily::Switch => "flash:",
            DeviceFamily::Router => "bootflash:",
        }
    }

    pub fn stack_capable(self) -> bool {
        matches!(self, DeviceFamily::Switch)
    }
}

impl std::fmt::Display for DeviceFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub family: DeviceFamily,
    pub filesystem: String,
    pub stack_capable: bool,
    /// False when the model matched no known pattern.
    pub supported: bool,
    /// Image family this hardware boots, e.g. `cat9k`.
    pub image_tag: Option<String>,
}

impl DeviceProfile {
    pub fn for_family(family: DeviceFamily, supported: bool, image_tag: Option<String>) -> Self {
        Self {
            family,
            filesystem: family.filesystem().to_string(),
            stack_capable: family.stack_capable(),
            supported,
            image_tag,
        }
    }

    /// Filesystem of one stack member. Member numbers start at 1.
    pub fn member_filesystem(&self, member: u32) -> String {
        if self.stack_capable {
            format!("flash-{}:", member)
        } else {
            self.filesystem.clone()
        }
    }
}

struct ModelPattern {
    prefix: &'static str,
    family: DeviceFamily,
    image_tag: &'static str,
}

// First match wins, so narrower prefixes come first.
const MODEL_TABLE: &[ModelPattern] = &[
    ModelPattern { prefix: "C9200", family: DeviceFamily::Switch, image_tag: "cat9k_lite" },
    ModelPattern { prefix: "C9300", family: DeviceFamily::Switch, image_tag: "cat9k" },
    ModelPattern { prefix: "C9400", family: DeviceFamily::Switch, image_tag: "cat9k" },
    ModelPattern { prefix: "C9500", family: DeviceFamily::Switch, image_tag: "cat9k" },
    ModelPattern { prefix: "C9600", family: DeviceFamily::Switch, image_tag: "cat9k" },
    ModelPattern { prefix: "C3850", family: DeviceFamily::Switch, image_tag: "cat3k_caa" },
    ModelPattern { prefix: "C3650", family: DeviceFamily::Switch, image_tag: "cat3k_caa" },
    ModelPattern { prefix: "ISR42", family: DeviceFamily::Router, image_tag: "isr4200" },
    ModelPattern { prefix: "ISR43", family: DeviceFamily::Router, image_tag: "isr4300" },
    ModelPattern { prefix: "ISR44", family: DeviceFamily::Router, image_tag: "isr4400" },
    ModelPattern { prefix: "ISR1", family: DeviceFamily::Router, image_tag: "c1100" },
    ModelPattern { prefix: "C11", family: DeviceFamily::Router, image_tag: "c1100" },
    ModelPattern { prefix: "ASR1", family: DeviceFamily::Router, image_tag: "asr1000" },
    ModelPattern { prefix: "C8000V", family: DeviceFamily::Router, image_tag: "c8000v" },
    ModelPattern { prefix: "C8500", family: DeviceFamily::Router, image_tag: "c8000aep" },
    ModelPattern { prefix: "C8200", family: DeviceFamily::Router, image_tag: "c8000be" },
    ModelPattern { prefix: "C8300", family: DeviceFamily::Router, image_tag: "c8000be" },
];

fn normalize(model: &str) -> String {
    let upper = model.trim().to_ascii_uppercase();
    match upper.strip_prefix("WS-") {
        Some(rest) => rest.to_string(),
        None => upper,
    }
}

/// Classify a model identifier. Never fails: unknown models get the router
/// layout with `supported` cleared.
pub fn classify(model: &str) -> DeviceProfile {
    let normalized = normalize(model);
    MODEL_TABLE
        .iter()
        .find(|pattern| normalized.starts_with(pattern.prefix))
        .map(|pattern| {
            DeviceProfile::for_family(pattern.family, true, Some(pattern.image_tag.to_string()))
        })
        .unwrap_or_else(|| DeviceProfile::for_family(DeviceFamily::Router, false, None))
}
