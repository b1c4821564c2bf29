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
    collections::BTreeSet,
    time::{Duration, SystemTime},
};

use serde::Serialize;
use tracing::debug;

use crate::{Protocol, Topition};

/// Whether a member still has a session.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub enum Presence {
    #[default]
    Live,

    /// A static member without a session, keeping its assignment until `until`.
    Departed { until: SystemTime },
}

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Member {
    member_id: String,
    group_instance_id: Option<String>,
    client_id: Option<String>,
    host: Option<String>,
    subscribed_topics: BTreeSet<String>,
    protocol: Protocol,
    member_epoch: i32,
    previous_member_epoch: i32,
    current_assignment: BTreeSet<Topition>,
    pending_revoke: BTreeSet<Topition>,
    pending_grant: BTreeSet<Topition>,
    session_timeout: Duration,
    rebalance_timeout: Duration,
    last_heartbeat_at: SystemTime,
    revoke_deadline: Option<SystemTime>,
    presence: Presence,
}

impl Member {
    pub(crate) fn new(member_id: impl Into<String>, now: SystemTime) -> Self {
        Self {
            member_id: member_id.into(),
            group_instance_id: None,
            client_id: None,
            host: None,
            subscribed_topics: BTreeSet::new(),
            protocol: Protocol::default(),
            member_epoch: 0,
            previous_member_epoch: 0,
            current_assignment: BTreeSet::new(),
            pending_revoke: BTreeSet::new(),
            pending_grant: BTreeSet::new(),
            session_timeout: Duration::ZERO,
            rebalance_timeout: Duration::ZERO,
            last_heartbeat_at: now,
            revoke_deadline: None,
            presence: Presence::Live,
        }
    }

    pub fn member_id(&self) -> &str {
        &self.member_id
    }

    pub fn group_instance_id(&self) -> Option<&str> {
        self.group_instance_id.as_deref()
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn subscribed_topics(&self) -> &BTreeSet<String> {
        &self.subscribed_topics
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn member_epoch(&self) -> i32 {
        self.member_epoch
    }

    pub fn current_assignment(&self) -> &BTreeSet<Topition> {
        &self.current_assignment
    }

    /// Partitions the member has been told to stop consuming.
    pub fn pending_revoke(&self) -> &BTreeSet<Topition> {
        &self.pending_revoke
    }

    /// Partitions the member has been told to start consuming.
    pub fn pending_grant(&self) -> &BTreeSet<Topition> {
        &self.pending_grant
    }

    pub fn session_timeout(&self) -> Duration {
        self.session_timeout
    }

    pub fn rebalance_timeout(&self) -> Duration {
        self.rebalance_timeout
    }

    pub fn last_heartbeat_at(&self) -> SystemTime {
        self.last_heartbeat_at
    }

    pub fn revoke_deadline(&self) -> Option<SystemTime> {
        self.revoke_deadline
    }

    pub fn presence(&self) -> Presence {
        self.presence
    }

    pub fn is_static(&self) -> bool {
        self.group_instance_id.is_some()
    }

    pub fn is_departed(&self) -> bool {
        matches!(self.presence, Presence::Departed { .. })
    }

    /// Partitions this member may be consuming: confirmed plus granted.
    pub fn held(&self) -> BTreeSet<Topition> {
        self.current_assignment
            .union(&self.pending_grant)
            .cloned()
            .collect()
    }

    pub fn is_reconciled_with(&self, target: &BTreeSet<Topition>) -> bool {
        self.pending_revoke.is_empty()
            && self.pending_grant.is_empty()
            && &self.current_assignment == target
    }

    /// A request may carry the current epoch, or the one before it when the
    /// response carrying the latest epoch was lost.
    pub fn accepts_epoch(&self, received: i32) -> bool {
        received == self.member_epoch || received == self.previous_member_epoch
    }

    pub(crate) fn with_member_id(mut self, member_id: impl Into<String>) -> Self {
        self.member_id = member_id.into();
        self
    }

    pub(crate) fn with_group_instance_id(mut self, group_instance_id: Option<String>) -> Self {
        self.group_instance_id = group_instance_id;
        self
    }

    pub(crate) fn with_client_id(mut self, client_id: Option<String>) -> Self {
        self.client_id = client_id;
        self
    }

    pub(crate) fn with_host(mut self, host: Option<String>) -> Self {
        self.host = host;
        self
    }

    pub(crate) fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub(crate) fn with_session_timeout(mut self, session_timeout: Duration) -> Self {
        self.session_timeout = session_timeout;
        self
    }

    pub(crate) fn with_rebalance_timeout(mut self, rebalance_timeout: Duration) -> Self {
        self.rebalance_timeout = rebalance_timeout;
        self
    }

    /// Replaces the subscription, returning whether it changed.
    pub(crate) fn subscribe(&mut self, topics: BTreeSet<String>) -> bool {
        if self.subscribed_topics == topics {
            false
        } else {
            self.subscribed_topics = topics;
            true
        }
    }

    pub(crate) fn touch(&mut self, now: SystemTime) {
        self.last_heartbeat_at = now;
        self.presence = Presence::Live;
    }

    pub(crate) fn depart(&mut self, until: SystemTime) {
        debug!(member_id = %self.member_id, ?until, revoking = ?self.pending_revoke);

        // without a session nothing is being consumed, outstanding revokes are complete
        for topition in std::mem::take(&mut self.pending_revoke) {
            _ = self.current_assignment.remove(&topition);
            _ = self.pending_grant.remove(&topition);
        }

        self.revoke_deadline = None;
        self.presence = Presence::Departed { until };
    }

    /// Forgets everything held, the client released it all when it rejoined.
    pub(crate) fn reset(&mut self) {
        debug!(
            member_id = %self.member_id,
            current = ?self.current_assignment,
            granted = ?self.pending_grant
        );

        self.current_assignment.clear();
        self.pending_grant.clear();
        self.pending_revoke.clear();
        self.revoke_deadline = None;
        self.member_epoch = 0;
        self.previous_member_epoch = 0;
    }

    pub(crate) fn advance(&mut self, epoch: i32) {
        if self.member_epoch != epoch {
            debug!(member_id = %self.member_id, from = self.member_epoch, to = epoch);

            self.previous_member_epoch = self.member_epoch;
            self.member_epoch = epoch;
        }
    }

    /// Applies acknowledgements, returning the partitions released by revokes.
    pub(crate) fn acknowledge(
        &mut self,
        revoked: &BTreeSet<Topition>,
        granted: &BTreeSet<Topition>,
    ) -> BTreeSet<Topition> {
        let mut released = BTreeSet::new();

        for topition in revoked {
            if self.pending_revoke.remove(topition) {
                _ = self.current_assignment.remove(topition);
                _ = self.pending_grant.remove(topition);
                _ = released.insert(topition.clone());
            } else {
                debug!(member_id = %self.member_id, ignored_revoke = %topition);
            }
        }

        for topition in granted {
            if self.pending_grant.remove(topition) {
                _ = self.current_assignment.insert(topition.clone());
            } else {
                debug!(member_id = %self.member_id, ignored_grant = %topition);
            }
        }

        if self.pending_revoke.is_empty() {
            self.revoke_deadline = None;
        }

        released
    }

    /// Sets the outstanding revokes, starting the revoke deadline when there
    /// were none before.
    pub(crate) fn revoke(&mut self, revoke: BTreeSet<Topition>, now: SystemTime) {
        if revoke.is_empty() {
            self.revoke_deadline = None;
        } else if self.revoke_deadline.is_none() || self.pending_revoke.is_empty() {
            self.revoke_deadline = now.checked_add(self.rebalance_timeout);
        }

        self.pending_revoke = revoke;
    }

    pub(crate) fn grant(&mut self, topitions: impl IntoIterator<Item = Topition>) {
        self.pending_grant.extend(topitions);
    }

    /// Drops partitions without handshake, used when no session can
    /// acknowledge or when the partitions no longer exist.
    pub(crate) fn release(&mut self, topitions: &BTreeSet<Topition>) {
        for topition in topitions {
            _ = self.current_assignment.remove(topition);
            _ = self.pending_grant.remove(topition);
            _ = self.pending_revoke.remove(topition);
        }

        if self.pending_revoke.is_empty() {
            self.revoke_deadline = None;
        }
    }

    /// Partitions that are held but will not be acknowledged, reported to the
    /// member as revoked.
    pub(crate) fn lose(&mut self, topitions: &BTreeSet<Topition>, now: SystemTime) {
        for topition in topitions {
            _ = self.current_assignment.remove(topition);
            _ = self.pending_grant.remove(topition);
        }

        let mut revoke = self.pending_revoke.clone();
        revoke.extend(topitions.iter().cloned());
        self.revoke(revoke, now);
    }

    pub(crate) fn resume(&mut self, now: SystemTime) {
        debug!(
            member_id = %self.member_id,
            epoch = self.member_epoch,
            current = ?self.current_assignment
        );
        self.touch(now);
    }
}
