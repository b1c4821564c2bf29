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

//! A single consumer group, reconciling its members towards a target
//! assignment.
//!
//! Every membership, subscription, metadata or assignor change bumps the
//! group epoch. A target assignment is then computed for that epoch and each
//! member is moved towards its share of it: partitions are revoked from their
//! previous owner and only granted once that owner has acknowledged the
//! revoke. A member's epoch catches up with the target epoch once it holds
//! exactly its share, with nothing outstanding.
//!
//! Members speaking the classic protocol cannot be revoked from partition by
//! partition. When a new target moves any of their partitions, every classic
//! member revokes all it holds and no classic member is granted anything
//! until all of them have done so.

mod member;
mod registry;
mod session;

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, LazyLock},
    time::{Duration, SystemTime},
};

use opentelemetry::{KeyValue, metrics::Counter};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    Error, METER, Protocol, Result, Topition,
    assignor::{self, AssignmentSpec, Assignor, TargetAssignment},
    config::Config,
    metadata::{MetadataImage, TopicChange, TopicMetadata},
};

use super::{HeartbeatRequest, HeartbeatResponse, JoinRequest, JoinResponse};

pub use member::{Member, Presence};
pub use registry::{Registry, Upsert};
pub use session::{Expiry, SessionMonitor};

static GROUP_EPOCH_BUMPS: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("tansu_coordinator_group_epoch_bumps")
        .with_description("consumer group epoch bumps")
        .build()
});

static ASSIGNOR_FAILURES: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("tansu_coordinator_assignor_failures")
        .with_description("consumer group target assignment failures")
        .build()
});

static MEMBER_EXPIRIES: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("tansu_coordinator_member_expiries")
        .with_description("consumer group members that missed a deadline")
        .build()
});

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
enum Trigger {
    Assignor,
    Expiry,
    Join,
    Leave,
    Metadata,
    RebalanceTimeout,
    Subscription,
}

impl Trigger {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Assignor => "assignor",
            Self::Expiry => "expiry",
            Self::Join => "join",
            Self::Leave => "leave",
            Self::Metadata => "metadata",
            Self::RebalanceTimeout => "rebalance_timeout",
            Self::Subscription => "subscription",
        }
    }
}

#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub enum GroupState {
    /// No member has a session.
    #[default]
    Empty,

    /// The target assignment is behind the group epoch.
    Assigning,

    /// Some member has yet to reach the target assignment epoch.
    Reconciling,

    Stable,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct MemberDescription {
    pub group_id: String,
    pub member_id: String,
    pub group_instance_id: Option<String>,
    pub host: Option<String>,
    pub client_id: Option<String>,
    pub protocol: Protocol,
    pub subscribed_topics: BTreeSet<String>,
    pub num_partitions: usize,
    pub current_assignment: BTreeSet<Topition>,
    pub pending_revoke: BTreeSet<Topition>,
    pub pending_grant: BTreeSet<Topition>,
    pub target_assignment: BTreeSet<Topition>,
    pub member_epoch: i32,
    pub target_epoch: i32,
    pub upgraded: bool,
    pub departed: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct GroupDescription {
    pub group_id: String,
    pub group_epoch: i32,
    pub target_assignment_epoch: i32,
    pub state: GroupState,
    pub assignor: String,
    pub upgraded: bool,
    pub members: Vec<MemberDescription>,
}

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
struct Retry {
    attempts: u32,
    not_before: SystemTime,
}

/// Classic members revoking everything before any of them is granted.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
struct EagerRound {
    epoch: i32,
    awaiting: BTreeSet<String>,
}

#[derive(Clone, Debug)]
pub struct Group<M> {
    group_id: String,
    group_epoch: i32,
    target_assignment_epoch: i32,
    target: TargetAssignment,
    image: MetadataImage,
    members: Registry,
    session: SessionMonitor,
    assignor: Arc<dyn Assignor>,
    config: Config,
    metadata: M,
    retry: Option<Retry>,
    eager: Option<EagerRound>,
}

impl<M> Group<M>
where
    M: TopicMetadata,
{
    pub fn new(group_id: impl Into<String>, config: Config, metadata: M) -> Result<Self> {
        let assignor = assignor::assignor(&config.assignor)?;

        Ok(Self {
            group_id: group_id.into(),
            group_epoch: 0,
            target_assignment_epoch: 0,
            target: TargetAssignment::new(),
            image: MetadataImage::default(),
            members: Registry::new(),
            session: SessionMonitor::new(config.rejoin_grace_timeout()),
            assignor,
            config,
            metadata,
            retry: None,
            eager: None,
        })
    }

    pub fn with_assignor(self, assignor: Arc<dyn Assignor>) -> Self {
        Self { assignor, ..self }
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn group_epoch(&self) -> i32 {
        self.group_epoch
    }

    pub fn target_assignment_epoch(&self) -> i32 {
        self.target_assignment_epoch
    }

    pub fn target(&self) -> &TargetAssignment {
        &self.target
    }

    pub fn members(&self) -> &Registry {
        &self.members
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn state(&self) -> GroupState {
        if self.members.list_live().next().is_none() {
            GroupState::Empty
        } else if self.target_assignment_epoch < self.group_epoch {
            GroupState::Assigning
        } else if self
            .members
            .list_live()
            .all(|member| member.member_epoch() == self.target_assignment_epoch)
        {
            GroupState::Stable
        } else {
            GroupState::Reconciling
        }
    }

    /// Whether every member with a session speaks the incremental protocol.
    pub fn is_upgraded(&self) -> bool {
        self.members
            .list_live()
            .all(|member| member.protocol().is_upgraded())
    }

    fn heartbeat_interval_ms(&self) -> u64 {
        self.config.heartbeat_interval_ms
    }

    fn new_member_id(join: &JoinRequest) -> String {
        format!(
            "{}-{}",
            join.client_id.as_deref().unwrap_or("consumer"),
            Uuid::new_v4()
        )
    }

    pub fn join(&mut self, now: SystemTime, join: &JoinRequest) -> Result<JoinResponse> {
        if join
            .subscribed_topics
            .iter()
            .any(|topic| topic.trim().is_empty())
        {
            return Err(Error::InvalidSubscription(format!(
                "empty topic name in {:?}",
                join.subscribed_topics
            )));
        }

        let member_id = join
            .member_id
            .as_deref()
            .filter(|member_id| !member_id.is_empty())
            .map(ToOwned::to_owned)
            .or_else(|| {
                // a live session for the instance is replaced under a new member id
                join.group_instance_id
                    .as_deref()
                    .and_then(|group_instance_id| self.members.find_by_instance(group_instance_id))
                    .filter(|member| member.is_departed())
                    .map(|member| member.member_id().to_owned())
            })
            .unwrap_or_else(|| Self::new_member_id(join));

        let session_timeout = join
            .session_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.config.session_timeout());

        let rebalance_timeout = join
            .rebalance_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.config.rebalance_timeout());

        let upsert = self
            .members
            .upsert(&member_id, join, session_timeout, rebalance_timeout, now)?;

        info!(
            group_id = %self.group_id,
            %member_id,
            group_instance_id = ?join.group_instance_id,
            protocol = ?join.protocol,
            ?upsert
        );

        if let Upsert::Replaced {
            previous_member_id, ..
        } = &upsert
        {
            self.rename(previous_member_id, &member_id);
        }

        if upsert == Upsert::Created {
            self.bump(Trigger::Join)
        } else if upsert.subscription_changed() {
            self.bump(Trigger::Subscription)
        }

        self.assign(now);
        self.reconcile(now);

        // a client joining from epoch zero is not consuming anything yet, while
        // one rejoining with its epoch keeps consuming until it acknowledges
        if join.member_epoch == 0
            && let Some(member) = self.members.get_mut(&member_id)
        {
            let revoked = member.pending_revoke().clone();

            if !revoked.is_empty() {
                member.release(&revoked);
                self.reconcile(now);
            }
        }

        let member = self
            .members
            .get(&member_id)
            .ok_or_else(|| Error::UnknownMember(member_id.clone()))?;

        Ok(JoinResponse {
            member_id: member_id.clone(),
            member_epoch: member.member_epoch(),
            assigned_partitions: member.held(),
            heartbeat_interval_ms: self.heartbeat_interval_ms(),
        })
    }

    pub fn heartbeat(
        &mut self,
        now: SystemTime,
        heartbeat: &HeartbeatRequest,
    ) -> Result<HeartbeatResponse> {
        let member_id = heartbeat.member_id.as_str();

        let Some(member) = self
            .members
            .get_mut(member_id)
            .filter(|member| !member.is_departed())
        else {
            return Err(self.missing(member_id));
        };

        if !member.accepts_epoch(heartbeat.member_epoch) {
            return Err(Error::StaleMemberEpoch {
                member_id: member_id.to_owned(),
                current: member.member_epoch(),
                received: heartbeat.member_epoch,
            });
        }

        self.session.heartbeat(member, now);

        let released = member.acknowledge(
            &heartbeat.acknowledged_revokes,
            &heartbeat.acknowledged_grants,
        );

        debug!(
            group_id = %self.group_id,
            member_id,
            member_epoch = heartbeat.member_epoch,
            ?released,
            granted = ?heartbeat.acknowledged_grants
        );

        self.assign(now);
        self.reconcile(now);

        let member = self
            .members
            .get(member_id)
            .ok_or_else(|| Error::UnknownMember(member_id.to_owned()))?;

        Ok(HeartbeatResponse {
            member_epoch: member.member_epoch(),
            revoke: member.pending_revoke().clone(),
            grant: member.pending_grant().clone(),
            heartbeat_interval_ms: self.heartbeat_interval_ms(),
        })
    }

    /// A static member leaves its assignment in place for the rejoin grace
    /// period, any other member is removed.
    pub fn leave(&mut self, now: SystemTime, member_id: &str) -> Result<()> {
        let rejoin_grace_timeout = self.config.rejoin_grace_timeout();

        let Some(member) = self.members.get_mut(member_id) else {
            return Err(self.missing(member_id));
        };

        if member.is_static() {
            if !member.is_departed() {
                member.depart(now.checked_add(rejoin_grace_timeout).unwrap_or(now));
            }
        } else {
            _ = self.members.remove(member_id);
            self.forget(member_id);
            self.bump(Trigger::Leave);
        }

        info!(group_id = %self.group_id, member_id, group_epoch = self.group_epoch);

        self.assign(now);
        self.reconcile(now);

        Ok(())
    }

    /// Expires members that have missed a deadline, and retries a failed
    /// target assignment.
    pub fn tick(&mut self, now: SystemTime) {
        for expiry in self.session.expired(self.members.members(), now) {
            warn!(group_id = %self.group_id, ?expiry);

            match expiry {
                Expiry::Depart { member_id, until } => {
                    MEMBER_EXPIRIES.add(1, &[KeyValue::new("outcome", "depart")]);

                    if let Some(member) = self.members.get_mut(&member_id) {
                        member.depart(until);
                    }
                }

                Expiry::Remove { member_id } => {
                    MEMBER_EXPIRIES.add(1, &[KeyValue::new("outcome", "remove")]);

                    _ = self.members.remove(&member_id);
                    self.forget(&member_id);
                    self.bump(Trigger::Expiry);
                }

                Expiry::Fence { member_id } => {
                    MEMBER_EXPIRIES.add(1, &[KeyValue::new("outcome", "fence")]);

                    _ = self.members.remove(&member_id);
                    self.members.fence(&member_id, now);
                    self.forget(&member_id);
                    self.bump(Trigger::RebalanceTimeout);
                }
            }
        }

        self.members.prune_fenced(
            now.checked_sub(self.config.rejoin_grace_timeout())
                .unwrap_or(SystemTime::UNIX_EPOCH),
        );

        self.assign(now);
        self.reconcile(now);
    }

    /// Reacts to a change in topic metadata, `None` when changes were missed
    /// and the subscribed topics must be compared in full.
    pub fn metadata_changed(&mut self, now: SystemTime, change: Option<&TopicChange>) {
        let subscribed = self.members.subscribed_topics();

        let relevant = match change {
            Some(change) => {
                subscribed.contains(&change.topic)
                    && self.image.partition_count(&change.topic) != change.partitions
            }

            None => self
                .metadata
                .image(&subscribed)
                .inspect_err(|err| warn!(group_id = %self.group_id, ?err))
                .map_or(true, |image| image != self.image),
        };

        debug!(group_id = %self.group_id, ?change, relevant);

        if relevant {
            self.bump(Trigger::Metadata);
            self.assign(now);
            self.reconcile(now);
        }
    }

    pub fn configure_assignor(&mut self, now: SystemTime, name: &str) -> Result<()> {
        self.assignor = assignor::assignor(name)?;

        info!(group_id = %self.group_id, assignor = name);

        self.bump(Trigger::Assignor);
        self.assign(now);
        self.reconcile(now);

        Ok(())
    }

    pub fn describe(&self) -> GroupDescription {
        let views = assignor::by_member(&self.target);

        GroupDescription {
            group_id: self.group_id.clone(),
            group_epoch: self.group_epoch,
            target_assignment_epoch: self.target_assignment_epoch,
            state: self.state(),
            assignor: self.assignor.name().to_owned(),
            upgraded: self.is_upgraded(),
            members: self
                .members
                .members()
                .map(|member| MemberDescription {
                    group_id: self.group_id.clone(),
                    member_id: member.member_id().to_owned(),
                    group_instance_id: member.group_instance_id().map(ToOwned::to_owned),
                    host: member.host().map(ToOwned::to_owned),
                    client_id: member.client_id().map(ToOwned::to_owned),
                    protocol: member.protocol(),
                    subscribed_topics: member.subscribed_topics().clone(),
                    num_partitions: member.current_assignment().len(),
                    current_assignment: member.current_assignment().clone(),
                    pending_revoke: member.pending_revoke().clone(),
                    pending_grant: member.pending_grant().clone(),
                    target_assignment: views
                        .get(member.member_id())
                        .cloned()
                        .unwrap_or_default(),
                    member_epoch: member.member_epoch(),
                    target_epoch: self.target_assignment_epoch,
                    upgraded: member.protocol().is_upgraded(),
                    departed: member.is_departed(),
                })
                .collect(),
        }
    }

    fn missing(&self, member_id: &str) -> Error {
        if self.members.is_fenced(member_id) {
            Error::FencedMember {
                member_id: member_id.to_owned(),
                group_instance_id: None,
            }
        } else {
            Error::UnknownMember(member_id.to_owned())
        }
    }

    fn bump(&mut self, trigger: Trigger) {
        self.group_epoch += 1;

        // a new epoch supersedes any failed computation
        self.retry = None;

        GROUP_EPOCH_BUMPS.add(1, &[KeyValue::new("trigger", trigger.as_str())]);

        info!(
            group_id = %self.group_id,
            group_epoch = self.group_epoch,
            trigger = trigger.as_str()
        );
    }

    fn rename(&mut self, previous_member_id: &str, member_id: &str) {
        for owner in self.target.values_mut() {
            if *owner == previous_member_id {
                member_id.clone_into(owner);
            }
        }

        if let Some(round) = self.eager.as_mut() {
            if round.awaiting.remove(previous_member_id) {
                _ = round.awaiting.insert(member_id.to_owned());
            }
        }
    }

    fn forget(&mut self, member_id: &str) {
        if let Some(round) = self.eager.as_mut() {
            _ = round.awaiting.remove(member_id);
        }
    }

    fn compute(&self) -> Result<(TargetAssignment, MetadataImage)> {
        let subscriptions = self.members.subscriptions();
        let image = self.metadata.image(&self.members.subscribed_topics())?;

        let spec = AssignmentSpec {
            subscriptions: &subscriptions,
            metadata: &image,
            previous: &self.target,
        };

        let assignment = self.assignor.assign(&spec)?;
        assignor::validate(&spec, &assignment).map(|target| (target, image))
    }

    /// Computes a target assignment for the group epoch, unless it is
    /// current or a failed attempt is backing off.
    fn assign(&mut self, now: SystemTime) {
        if self.target_assignment_epoch >= self.group_epoch {
            return;
        }

        if self.retry.is_some_and(|retry| now < retry.not_before) {
            return;
        }

        match self.compute() {
            Ok((target, image)) => self.install(now, target, image),

            Err(error) => {
                let attempts = self.retry.map_or(1, |retry| retry.attempts + 1);
                let backoff = self.config.retry_backoff(attempts);

                ASSIGNOR_FAILURES.add(1, &[KeyValue::new("assignor", self.assignor.name())]);

                warn!(
                    group_id = %self.group_id,
                    group_epoch = self.group_epoch,
                    attempts,
                    ?backoff,
                    ?error
                );

                self.retry = Some(Retry {
                    attempts,
                    not_before: now.checked_add(backoff).unwrap_or(now),
                });
            }
        }
    }

    fn install(&mut self, now: SystemTime, target: TargetAssignment, image: MetadataImage) {
        info!(
            group_id = %self.group_id,
            target_assignment_epoch = self.group_epoch,
            partitions = target.len(),
            moved = assignor::movement(&self.target, &target)
        );

        self.target = target;
        self.image = image;
        self.target_assignment_epoch = self.group_epoch;
        self.retry = None;

        for member_id in self.members.member_ids() {
            let Some(member) = self.members.get_mut(&member_id) else {
                continue;
            };

            let lost = member
                .held()
                .into_iter()
                .filter(|topition| !self.image.contains(topition))
                .collect::<BTreeSet<_>>();

            if lost.is_empty() {
                continue;
            }

            debug!(group_id = %self.group_id, %member_id, ?lost);

            if member.is_departed() {
                member.release(&lost);
            } else {
                member.lose(&lost, now);
            }
        }

        let views = assignor::by_member(&self.target);
        let empty = BTreeSet::new();

        let rebalancing = self.members.list_live().any(|member| {
            member.protocol() == Protocol::Classic
                && member.held() != *views.get(member.member_id()).unwrap_or(&empty)
        });

        self.eager = if rebalancing {
            let awaiting = self
                .members
                .list_live()
                .filter(|member| {
                    member.protocol() == Protocol::Classic && !member.held().is_empty()
                })
                .map(|member| member.member_id().to_owned())
                .collect::<BTreeSet<_>>();

            if awaiting.is_empty() {
                None
            } else {
                info!(group_id = %self.group_id, epoch = self.target_assignment_epoch, ?awaiting);

                Some(EagerRound {
                    epoch: self.target_assignment_epoch,
                    awaiting,
                })
            }
        } else {
            None
        };
    }

    /// Moves every member towards its share of the target assignment.
    fn reconcile(&mut self, now: SystemTime) {
        if let Some(round) = self.eager.as_mut() {
            round.awaiting.retain(|member_id| {
                self.members
                    .get(member_id)
                    .is_some_and(|member| !member.is_departed() && !member.held().is_empty())
            });

            if round.awaiting.is_empty() {
                info!(group_id = %self.group_id, epoch = round.epoch, "classic members revoked");
                self.eager = None;
            }
        }

        let views = assignor::by_member(&self.target);
        let empty = BTreeSet::new();

        let mut owners = self
            .members
            .members()
            .flat_map(|member| {
                member
                    .held()
                    .into_iter()
                    .map(|topition| (topition, member.member_id().to_owned()))
            })
            .collect::<BTreeMap<_, _>>();

        for member_id in self.members.member_ids() {
            let view = views.get(&member_id).unwrap_or(&empty);

            let Some(member) = self.members.get_mut(&member_id) else {
                continue;
            };

            if member.is_departed() {
                let released = member
                    .held()
                    .difference(view)
                    .cloned()
                    .collect::<BTreeSet<_>>();

                if !released.is_empty() {
                    debug!(group_id = %self.group_id, %member_id, ?released);

                    member.release(&released);

                    for topition in &released {
                        _ = owners.remove(topition);
                    }
                }

                continue;
            }

            let classic = member.protocol() == Protocol::Classic;
            let held = member.held();

            let mut revoke = if classic
                && self
                    .eager
                    .as_ref()
                    .is_some_and(|round| round.awaiting.contains(&member_id))
            {
                held.clone()
            } else {
                held.difference(view).cloned().collect::<BTreeSet<_>>()
            };

            // partitions that no longer exist stay revoked until acknowledged
            revoke.extend(member.pending_revoke().difference(&held).cloned());

            member.revoke(revoke, now);

            if !(classic && self.eager.is_some()) {
                let grants = view
                    .iter()
                    .filter(|topition| !held.contains(*topition) && !owners.contains_key(*topition))
                    .cloned()
                    .collect::<Vec<_>>();

                if !grants.is_empty() {
                    debug!(group_id = %self.group_id, %member_id, ?grants);

                    for topition in &grants {
                        _ = owners.insert(topition.clone(), member_id.clone());
                    }

                    member.grant(grants);
                }
            }

            if member.is_reconciled_with(view) {
                member.advance(self.target_assignment_epoch);
            }
        }
    }
}
