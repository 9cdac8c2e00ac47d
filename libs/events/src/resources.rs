//! Resource requirement types.

use serde::{Deserialize, Serialize};

use crate::EventError;

/// Kind of device a slot offers or a request needs.
///
/// GPU slots may carry a class tag (`gpu:a100`). An untagged GPU request
/// accepts any GPU; a tagged one accepts only that class.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DeviceKind {
    Cpu,
    Gpu(Option<String>),
}

impl DeviceKind {
    /// Untagged GPU.
    pub fn gpu() -> Self {
        Self::Gpu(None)
    }

    /// GPU with a class tag.
    pub fn gpu_class(class: impl Into<String>) -> Self {
        Self::Gpu(Some(class.into()))
    }

    /// Whether a slot of this kind can serve a request for `requested`.
    pub fn satisfies(&self, requested: &DeviceKind) -> bool {
        match (self, requested) {
            (DeviceKind::Cpu, DeviceKind::Cpu) => true,
            (DeviceKind::Gpu(_), DeviceKind::Gpu(None)) => true,
            (DeviceKind::Gpu(Some(have)), DeviceKind::Gpu(Some(want))) => have == want,
            _ => false,
        }
    }

    /// Whether this slot kind is exactly the requested kind.
    pub fn is_exact(&self, requested: &DeviceKind) -> bool {
        self == requested
    }

    pub fn is_gpu(&self) -> bool {
        matches!(self, DeviceKind::Gpu(_))
    }

    /// The family this kind belongs to, ignoring GPU class tags.
    pub fn family(&self) -> DeviceKind {
        match self {
            DeviceKind::Cpu => DeviceKind::Cpu,
            DeviceKind::Gpu(_) => DeviceKind::Gpu(None),
        }
    }

    pub fn parse(s: &str) -> Result<Self, EventError> {
        match s.trim() {
            "cpu" => Ok(DeviceKind::Cpu),
            "gpu" => Ok(DeviceKind::Gpu(None)),
            other => match other.strip_prefix("gpu:") {
                Some(class) if !class.is_empty() => Ok(DeviceKind::Gpu(Some(class.to_string()))),
                _ => Err(EventError::InvalidDeviceKind(s.to_string())),
            },
        }
    }
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceKind::Cpu => write!(f, "cpu"),
            DeviceKind::Gpu(None) => write!(f, "gpu"),
            DeviceKind::Gpu(Some(class)) => write!(f, "gpu:{class}"),
        }
    }
}

impl std::str::FromStr for DeviceKind {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for DeviceKind {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DeviceKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Whether a request's slots must sit on a single agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Colocation {
    /// All slots on one agent.
    #[default]
    SingleAgent,
    /// Slots may span agents.
    Spread,
}

/// Resource requirement of a task request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub slots: u32,
    pub device: DeviceKind,
    #[serde(default)]
    pub colocation: Colocation,
}

impl ResourceSpec {
    pub fn new(slots: u32, device: DeviceKind, colocation: Colocation) -> Self {
        Self {
            slots,
            device,
            colocation,
        }
    }

    pub fn gpus(slots: u32) -> Self {
        Self::new(slots, DeviceKind::gpu(), Colocation::SingleAgent)
    }

    pub fn cpus(slots: u32) -> Self {
        Self::new(slots, DeviceKind::Cpu, Colocation::SingleAgent)
    }

    pub fn spread(mut self) -> Self {
        self.colocation = Colocation::Spread;
        self
    }
}

/// Kind of workload a task request runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Trial,
    Notebook,
    Shell,
    #[default]
    Command,
    LogServer,
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskType::Trial => "trial",
            TaskType::Notebook => "notebook",
            TaskType::Shell => "shell",
            TaskType::Command => "command",
            TaskType::LogServer => "log_server",
        };
        f.write_str(s)
    }
}
