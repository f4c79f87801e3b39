use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum OutcomeStatus {
    SkippedExisting,
    Succeeded,
    Failed,
}

/// Result of one download attempt. Only logged and returned, never persisted.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadOutcome {
    pub name: String,
    pub destination_path: PathBuf,
    pub bytes_transferred: u64,
    pub elapsed: Duration,
    pub status: OutcomeStatus,
}

impl DownloadOutcome {
    pub fn skipped(name: impl Into<String>, destination_path: PathBuf) -> Self {
        Self {
            name: name.into(),
            destination_path,
            bytes_transferred: 0,
            elapsed: Duration::ZERO,
            status: OutcomeStatus::SkippedExisting,
        }
    }

    pub fn succeeded(
        name: impl Into<String>,
        destination_path: PathBuf,
        bytes_transferred: u64,
        elapsed: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            destination_path,
            bytes_transferred,
            elapsed,
            status: OutcomeStatus::Succeeded,
        }
    }

    pub fn failed(name: impl Into<String>, destination_path: PathBuf, elapsed: Duration) -> Self {
        Self {
            name: name.into(),
            destination_path,
            bytes_transferred: 0,
            elapsed,
            status: OutcomeStatus::Failed,
        }
    }

    pub fn log(&self) {
        let destination = self.destination_path.display();
        match self.status {
            OutcomeStatus::SkippedExisting => {
                info!(name = %self.name, %destination, "weight exists; skipping")
            }
            OutcomeStatus::Succeeded => info!(
                name = %self.name,
                %destination,
                bytes = self.bytes_transferred,
                elapsed_ms = self.elapsed.as_millis() as u64,
                "weight ready"
            ),
            OutcomeStatus::Failed => error!(
                name = %self.name,
                %destination,
                elapsed_ms = self.elapsed.as_millis() as u64,
                "weight download failed"
            ),
        }
    }
}

/// Everything one provisioning call did, in processing order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProvisionReport {
    pub outcomes: Vec<DownloadOutcome>,
    pub unknown: Vec<String>,
}

impl ProvisionReport {
    pub fn count(&self, status: OutcomeStatus) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.status == status)
            .count()
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.outcomes
            .iter()
            .map(|outcome| outcome.bytes_transferred)
            .sum()
    }
}
