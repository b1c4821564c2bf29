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

use tracing::debug;

use super::{AssignmentSpec, Assignor, MemberAssignment};
use crate::{Result, Topition};

/// Contiguous ranges of each topic's partitions, in member id order.
///
/// With `n` partitions and `m` subscribers every subscriber receives `n / m`
/// partitions and the first `n % m` one more. The previous assignment is
/// ignored.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Range;

impl Assignor for Range {
    fn name(&self) -> &'static str {
        "range"
    }

    fn assign(&self, spec: &AssignmentSpec<'_>) -> Result<MemberAssignment> {
        let mut assignment = MemberAssignment::new();

        for (topic, partitions) in spec.metadata.topics() {
            let subscribers = spec.subscribers(topic);

            if subscribers.is_empty() {
                continue;
            }

            let members = i32::try_from(subscribers.len()).unwrap_or(i32::MAX);
            let quota = partitions / members;
            let extra = partitions % members;

            let mut start = 0;

            for (index, member_id) in (0..).zip(subscribers) {
                let length = quota + i32::from(index < extra);

                debug!(topic, member_id, start, length);

                assignment
                    .entry(member_id.to_owned())
                    .or_default()
                    .extend(
                        (start..start + length).map(|partition| Topition::new(topic, partition)),
                    );

                start += length;
            }
        }

        Ok(assignment)
    }
}
