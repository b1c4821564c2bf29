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

use std::time::{Duration, SystemTime};

use tracing::debug;

use super::{Member, Presence};

/// The consequence of a missed deadline.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Expiry {
    /// A static member lost its session, keeping its assignment until `until`.
    Depart { member_id: String, until: SystemTime },

    /// A dynamic member lost its session, or a departed member was not
    /// replaced in time.
    Remove { member_id: String },

    /// A member did not acknowledge a revoke within its rebalance timeout.
    Fence { member_id: String },
}

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SessionMonitor {
    rejoin_grace_timeout: Duration,
}

impl SessionMonitor {
    pub fn new(rejoin_grace_timeout: Duration) -> Self {
        Self {
            rejoin_grace_timeout,
        }
    }

    pub fn heartbeat(&self, member: &mut Member, now: SystemTime) {
        member.touch(now);
    }

    /// Members that have missed a deadline at `now`, in member id order.
    pub fn expired<'a>(
        &self,
        members: impl Iterator<Item = &'a Member>,
        now: SystemTime,
    ) -> Vec<Expiry> {
        members
            .filter_map(|member| self.check(member, now))
            .inspect(|expiry| debug!(?expiry))
            .collect()
    }

    fn check(&self, member: &Member, now: SystemTime) -> Option<Expiry> {
        let member_id = member.member_id().to_owned();

        match member.presence() {
            Presence::Departed { until } => (now >= until).then_some(Expiry::Remove { member_id }),

            Presence::Live => {
                let elapsed = now
                    .duration_since(member.last_heartbeat_at())
                    .unwrap_or_default();

                if elapsed > member.session_timeout() {
                    if member.is_static() {
                        now.checked_add(self.rejoin_grace_timeout)
                            .map(|until| Expiry::Depart { member_id, until })
                    } else {
                        Some(Expiry::Remove { member_id })
                    }
                } else if member
                    .revoke_deadline()
                    .is_some_and(|deadline| now >= deadline)
                {
                    Some(Expiry::Fence { member_id })
                } else {
                    None
                }
            }
        }
    }
}
