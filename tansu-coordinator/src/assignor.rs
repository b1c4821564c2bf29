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

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Debug,
    sync::Arc,
};

use tracing::debug;

use crate::{Error, Result, Topition, metadata::MetadataImage};

mod range;
mod sticky;

pub use range::Range;
pub use sticky::Sticky;

/// Subscribed topics keyed by member id.
pub type Subscriptions = BTreeMap<String, BTreeSet<String>>;

/// Owner of each partition.
pub type TargetAssignment = BTreeMap<Topition, String>;

/// Partitions of each member, as produced by an [`Assignor`].
pub type MemberAssignment = BTreeMap<String, BTreeSet<Topition>>;

#[derive(Clone, Copy, Debug)]
pub struct AssignmentSpec<'a> {
    pub subscriptions: &'a Subscriptions,
    pub metadata: &'a MetadataImage,
    pub previous: &'a TargetAssignment,
}

impl AssignmentSpec<'_> {
    /// Members subscribing to `topic`, ordered by member id.
    pub fn subscribers(&self, topic: &str) -> Vec<&str> {
        self.subscriptions
            .iter()
            .filter(|(_, topics)| topics.contains(topic))
            .map(|(member_id, _)| member_id.as_str())
            .collect()
    }
}

/// A server side assignment strategy.
///
/// Implementations must be deterministic: identical inputs give an identical
/// assignment, otherwise a retried computation could move partitions for no
/// reason. Every partition of a topic with at least one subscriber is given to
/// exactly one of its subscribers.
pub trait Assignor: Debug + Send + Sync {
    fn name(&self) -> &'static str;

    fn assign(&self, spec: &AssignmentSpec<'_>) -> Result<MemberAssignment>;
}

/// Looks up an assignor by name.
pub fn assignor(name: &str) -> Result<Arc<dyn Assignor>> {
    match name {
        "range" => Ok(Arc::new(Range)),
        "sticky" | "uniform" => Ok(Arc::new(Sticky)),
        otherwise => Err(Error::UnknownAssignor(otherwise.to_owned())),
    }
}

/// Checks an assignment against the assignor contract, returning the owner of
/// each partition.
pub fn validate(
    spec: &AssignmentSpec<'_>,
    assignment: &MemberAssignment,
) -> Result<TargetAssignment> {
    let mut target = TargetAssignment::new();

    for (member_id, topitions) in assignment {
        let Some(subscribed) = spec.subscriptions.get(member_id) else {
            return Err(Error::InvalidAssignment(format!(
                "{member_id} is not a member"
            )));
        };

        for topition in topitions {
            if !subscribed.contains(topition.topic()) {
                return Err(Error::InvalidAssignment(format!(
                    "{topition} given to {member_id} which is not subscribed to {}",
                    topition.topic()
                )));
            }

            if !spec.metadata.contains(topition) {
                return Err(Error::InvalidAssignment(format!(
                    "{topition} given to {member_id} does not exist"
                )));
            }

            if let Some(owner) = target.insert(topition.clone(), member_id.clone()) {
                return Err(Error::InvalidAssignment(format!(
                    "{topition} given to both {owner} and {member_id}"
                )));
            }
        }
    }

    for (topic, _) in spec.metadata.topics() {
        if spec.subscribers(topic).is_empty() {
            continue;
        }

        if let Some(missing) = spec
            .metadata
            .topitions(topic)
            .find(|topition| !target.contains_key(topition))
        {
            return Err(Error::InvalidAssignment(format!("{missing} is unassigned")));
        }
    }

    debug!(partitions = target.len(), members = assignment.len());

    Ok(target)
}

/// Inverts a target assignment to the partitions held by each member.
pub fn by_member(target: &TargetAssignment) -> MemberAssignment {
    target
        .iter()
        .fold(MemberAssignment::new(), |mut acc, (topition, member_id)| {
            _ = acc
                .entry(member_id.clone())
                .or_default()
                .insert(topition.clone());
            acc
        })
}

/// Number of partitions whose owner differs between two target assignments.
pub fn movement(previous: &TargetAssignment, current: &TargetAssignment) -> usize {
    current
        .iter()
        .filter(|(topition, owner)| {
            previous
                .get(*topition)
                .is_some_and(|previous| previous != *owner)
        })
        .count()
}
