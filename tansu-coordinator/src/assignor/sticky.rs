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

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use super::{AssignmentSpec, Assignor, MemberAssignment};
use crate::{Result, Topition};

/// Balances each topic while moving as few partitions as possible.
///
/// A partition stays with its previous owner while that owner still
/// subscribes to the topic. Subscribers end up within one partition of each
/// other, the extra partitions going to the members already holding the
/// most, so only the excess above each member's quota and partitions without
/// a subscribed owner change hands. Remaining ties are broken by the load
/// accumulated over previously assigned topics and then by member id.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Sticky;

impl Assignor for Sticky {
    fn name(&self) -> &'static str {
        "sticky"
    }

    fn assign(&self, spec: &AssignmentSpec<'_>) -> Result<MemberAssignment> {
        let mut assignment: MemberAssignment = spec
            .subscriptions
            .keys()
            .map(|member_id| (member_id.clone(), BTreeSet::new()))
            .collect();

        let mut load: BTreeMap<&str, usize> = BTreeMap::new();

        for (topic, partitions) in spec.metadata.topics() {
            let subscribers = spec.subscribers(topic);

            if subscribers.is_empty() {
                continue;
            }

            let mut held: BTreeMap<&str, Vec<i32>> = subscribers
                .iter()
                .map(|member_id| (*member_id, Vec::new()))
                .collect();

            for partition in 0..partitions {
                if let Some(owner) = spec.previous.get(&Topition::new(topic, partition))
                    && let Some(partitions) = held.get_mut(owner.as_str())
                {
                    partitions.push(partition);
                }
            }

            let quota = usize::try_from(partitions).unwrap_or_default() / subscribers.len();
            let extra = usize::try_from(partitions).unwrap_or_default() % subscribers.len();

            let mut ordered = subscribers.clone();
            ordered.sort_by(|a, b| {
                held[b]
                    .len()
                    .cmp(&held[a].len())
                    .then_with(|| {
                        load.get(a)
                            .copied()
                            .unwrap_or_default()
                            .cmp(&load.get(b).copied().unwrap_or_default())
                    })
                    .then_with(|| a.cmp(b))
            });

            let targets: BTreeMap<&str, usize> = ordered
                .iter()
                .enumerate()
                .map(|(index, member_id)| (*member_id, quota + usize::from(index < extra)))
                .collect();

            let mut pool: BTreeSet<i32> = (0..partitions).collect();

            for (member_id, partitions) in held.iter_mut() {
                partitions.truncate(targets[member_id]);

                for partition in partitions.iter() {
                    _ = pool.remove(partition);
                }
            }

            for member_id in &subscribers {
                let partitions = held.entry(*member_id).or_default();

                while partitions.len() < targets[member_id] {
                    let Some(partition) = pool.pop_first() else {
                        break;
                    };

                    partitions.push(partition);
                }
            }

            for (member_id, partitions) in held {
                debug!(topic, member_id, ?partitions);

                *load.entry(member_id).or_default() += partitions.len();

                assignment
                    .entry(member_id.to_owned())
                    .or_default()
                    .extend(
                        partitions
                            .into_iter()
                            .map(|partition| Topition::new(topic, partition)),
                    );
            }
        }

        Ok(assignment)
    }
}
