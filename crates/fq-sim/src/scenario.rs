use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;

use fq_sched::DeviceId;
use fq_sched::IoOp;
use fq_sched::SchedulerConfig;
use fq_sched::WorkloadId;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScenarioError {
    #[error("failed to read scenario `{path}`")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse scenario")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid scenario: {0}")]
    Invalid(String),
}

/// A simulation run: scheduler tunables, disks, and the workloads hitting them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scenario {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default = "default_duration_ms")]
    pub duration_ms: u64,
    pub devices: Vec<DeviceSpec>,
    pub workloads: Vec<WorkloadSpec>,
}

/// A disk that serves one request at a time in a fixed time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSpec {
    pub id: DeviceId,
    pub service_time_us: u64,
}

/// A workload issuing requests at a steady rate against one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSpec {
    pub id: WorkloadId,
    #[serde(default)]
    pub priority: i32,
    pub device: DeviceId,
    pub requests_per_sec: u64,
    #[serde(default = "default_request_size")]
    pub request_size: u32,
    #[serde(default = "default_op")]
    pub op: IoOp,
}

fn default_duration_ms() -> u64 {
    5_000
}

fn default_request_size() -> u32 {
    4096
}

fn default_op() -> IoOp {
    IoOp::Read
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Self, ScenarioError> {
        let content = std::fs::read_to_string(path).map_err(|source| ScenarioError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let scenario = Self::parse(&content)?;
        Ok(scenario)
    }

    pub fn parse(content: &str) -> Result<Self, ScenarioError> {
        let scenario: Scenario = serde_yaml::from_str(content)?;
        scenario.validate()?;
        Ok(scenario)
    }

    pub fn validate(&self) -> Result<(), ScenarioError> {
        self.scheduler
            .validate()
            .map_err(|report| ScenarioError::Invalid(report.current_context().to_string()))?;
        if self.duration_ms == 0 {
            return Err(ScenarioError::Invalid("durationMs must be greater than 0".into()));
        }
        if self.devices.is_empty() {
            return Err(ScenarioError::Invalid("at least one device is required".into()));
        }

        let mut devices = HashSet::new();
        for device in &self.devices {
            if !devices.insert(device.id) {
                return Err(ScenarioError::Invalid(format!(
                    "device {} is declared twice",
                    device.id
                )));
            }
            if device.service_time_us == 0 {
                return Err(ScenarioError::Invalid(format!(
                    "device {} needs a non-zero serviceTimeUs",
                    device.id
                )));
            }
        }

        let mut workloads = HashSet::new();
        for workload in &self.workloads {
            if !devices.contains(&workload.device) {
                return Err(ScenarioError::Invalid(format!(
                    "workload {} targets unknown device {}",
                    workload.id, workload.device
                )));
            }
            if !workloads.insert((workload.id, workload.device)) {
                return Err(ScenarioError::Invalid(format!(
                    "workload {} targets device {} twice",
                    workload.id, workload.device
                )));
            }
            if workload.requests_per_sec == 0 {
                return Err(ScenarioError::Invalid(format!(
                    "workload {} needs a non-zero requestsPerSec",
                    workload.id
                )));
            }
        }
        Ok(())
    }
}
