// Copyright 2026 Fanout Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use fanout_common::{RecordId, TerminalOutcome};
use serde::{Deserialize, Serialize};

/// Latency statistics over every attempt, in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencyDistribution {
    pub samples: u64,
    pub min_us: u64,
    pub max_us: u64,
    pub mean_us: u64,
    pub p50_us: u64,
    pub p90_us: u64,
    pub p99_us: u64,
}

/// Terminal outcome of one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordOutcome {
    pub id: RecordId,
    pub sequence: u64,
    #[serde(flatten)]
    pub outcome: TerminalOutcome,
}

/// Result of a run.
///
/// `total == succeeded + failed + cancelled` always holds. `failed` is
/// `fatal + exhausted`; `fatal` includes records `rejected` at the source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutcomeSummary {
    /// Records that reached a terminal outcome
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub fatal: u64,
    /// Malformed at the source, never invoked
    pub rejected: u64,
    /// Gave up after the attempt budget ran out
    pub exhausted: u64,
    pub cancelled: u64,
    /// Records that needed more than one attempt
    pub retried: u64,
    /// Attempts beyond the first, summed over all records
    pub retries: u64,
    pub attempts: u64,
    pub throttled_attempts: u64,
    pub transient_attempts: u64,
    pub fatal_attempts: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency: Option<LatencyDistribution>,
    pub elapsed_ms: u64,
    /// The run was aborted or hit its deadline
    pub run_cancelled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_error: Option<String>,
    /// Per-record outcomes ordered by sequence, when retention is enabled
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub records: Vec<RecordOutcome>,
}

impl OutcomeSummary {
    /// Every terminal record is counted exactly once.
    pub fn is_balanced(&self) -> bool {
        self.total == self.succeeded + self.failed + self.cancelled
            && self.failed == self.fatal + self.exhausted
    }

    pub fn all_succeeded(&self) -> bool {
        self.succeeded == self.total && self.source_error.is_none()
    }
}

/// Live view of a run in progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    /// Records pulled from the source
    pub admitted: u64,
    /// Admitted records not yet terminal
    pub in_flight: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub attempts: u64,
    pub elapsed_ms: u64,
}
