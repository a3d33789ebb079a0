use std::fmt;

use serde::{Deserialize, Serialize};

/// Build flavour of the native inference executable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutableVariant {
    Cuda,
    Metal,
    Vulkan,
    Cpu,
}

impl ExecutableVariant {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutableVariant::Cuda => "cuda",
            ExecutableVariant::Metal => "metal",
            ExecutableVariant::Vulkan => "vulkan",
            ExecutableVariant::Cpu => "cpu",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "cuda" => Some(ExecutableVariant::Cuda),
            "metal" => Some(ExecutableVariant::Metal),
            "vulkan" => Some(ExecutableVariant::Vulkan),
            "cpu" => Some(ExecutableVariant::Cpu),
            _ => None,
        }
    }
}

impl fmt::Display for ExecutableVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
