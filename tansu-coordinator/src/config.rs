// Copyright ⓒ 2024-2025 Peter Morgan <peter.james.morgan@gmail.com>
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::time::Duration;

use clap::Parser;

const SESSION_TIMEOUT_MS: u64 = 45_000;
const REBALANCE_TIMEOUT_MS: u64 = 300_000;
const REJOIN_GRACE_TIMEOUT_MS: u64 = 30_000;
const HEARTBEAT_INTERVAL_MS: u64 = 5_000;
const SWEEP_INTERVAL_MS: u64 = 1_000;
const ASSIGNOR: &str = "sticky";
const ASSIGNOR_RETRY_BACKOFF_MS: u64 = 100;
const ASSIGNOR_RETRY_BACKOFF_MAX_MS: u64 = 10_000;
const GROUP_CHANNEL_CAPACITY: usize = 64;

/// Coordinator settings, flattened into a broker command line or parsed on
/// their own.
#[derive(Clone, Debug, Eq, Hash, Ord, Parser, PartialEq, PartialOrd)]
#[command(name = "tansu-coordinator", version, about, long_about = None)]
pub struct Config {
    /// Default session timeout for members that do not supply one
    #[arg(long, env = "GROUP_SESSION_TIMEOUT_MS", default_value_t = SESSION_TIMEOUT_MS)]
    pub session_timeout_ms: u64,

    /// Time a member has to acknowledge a revoke before it is fenced
    #[arg(long, env = "GROUP_REBALANCE_TIMEOUT_MS", default_value_t = REBALANCE_TIMEOUT_MS)]
    pub rebalance_timeout_ms: u64,

    /// How long a departed static member keeps its assignment
    #[arg(long, env = "GROUP_REJOIN_GRACE_TIMEOUT_MS", default_value_t = REJOIN_GRACE_TIMEOUT_MS)]
    pub rejoin_grace_timeout_ms: u64,

    /// Heartbeat interval advertised to members
    #[arg(long, env = "GROUP_HEARTBEAT_INTERVAL_MS", default_value_t = HEARTBEAT_INTERVAL_MS)]
    pub heartbeat_interval_ms: u64,

    /// Interval between session expiry sweeps
    #[arg(long, env = "GROUP_SWEEP_INTERVAL_MS", default_value_t = SWEEP_INTERVAL_MS)]
    pub sweep_interval_ms: u64,

    /// Server side assignor used by new groups: range or sticky
    #[arg(long, env = "GROUP_ASSIGNOR", default_value = ASSIGNOR)]
    pub assignor: String,

    /// Initial delay before a failed assignment is retried
    #[arg(
        long,
        env = "GROUP_ASSIGNOR_RETRY_BACKOFF_MS",
        default_value_t = ASSIGNOR_RETRY_BACKOFF_MS
    )]
    pub assignor_retry_backoff_ms: u64,

    /// Upper bound of the assignment retry delay
    #[arg(
        long,
        env = "GROUP_ASSIGNOR_RETRY_BACKOFF_MAX_MS",
        default_value_t = ASSIGNOR_RETRY_BACKOFF_MAX_MS
    )]
    pub assignor_retry_backoff_max_ms: u64,

    /// Pending requests buffered per group
    #[arg(long, env = "GROUP_CHANNEL_CAPACITY", default_value_t = GROUP_CHANNEL_CAPACITY)]
    pub group_channel_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            session_timeout_ms: SESSION_TIMEOUT_MS,
            rebalance_timeout_ms: REBALANCE_TIMEOUT_MS,
            rejoin_grace_timeout_ms: REJOIN_GRACE_TIMEOUT_MS,
            heartbeat_interval_ms: HEARTBEAT_INTERVAL_MS,
            sweep_interval_ms: SWEEP_INTERVAL_MS,
            assignor: ASSIGNOR.to_owned(),
            assignor_retry_backoff_ms: ASSIGNOR_RETRY_BACKOFF_MS,
            assignor_retry_backoff_max_ms: ASSIGNOR_RETRY_BACKOFF_MAX_MS,
            group_channel_capacity: GROUP_CHANNEL_CAPACITY,
        }
    }
}

impl Config {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn rebalance_timeout(&self) -> Duration {
        Duration::from_millis(self.rebalance_timeout_ms)
    }

    pub fn rejoin_grace_timeout(&self) -> Duration {
        Duration::from_millis(self.rejoin_grace_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn assignor_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.assignor_retry_backoff_ms)
    }

    pub fn assignor_retry_backoff_max(&self) -> Duration {
        Duration::from_millis(self.assignor_retry_backoff_max_ms)
    }

    /// Retry delay after `attempts` consecutive assignment failures.
    pub fn retry_backoff(&self, attempts: u32) -> Duration {
        self.assignor_retry_backoff()
            .saturating_mul(2u32.saturating_pow(attempts.saturating_sub(1)))
            .min(self.assignor_retry_backoff_max())
    }
}
