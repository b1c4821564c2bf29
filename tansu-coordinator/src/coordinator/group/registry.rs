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
    time::{Duration, SystemTime},
};

use tracing::{debug, info};

use crate::{Error, Result, assignor::Subscriptions, coordinator::JoinRequest};

use super::Member;

/// How a join changed the registry.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Upsert {
    Created,

    /// An existing member started a new session.
    Rejoined { subscription_changed: bool },

    /// A static member took over the session of `previous_member_id`,
    /// keeping its assignment.
    Replaced {
        previous_member_id: String,
        subscription_changed: bool,
    },
}

impl Upsert {
    pub fn subscription_changed(&self) -> bool {
        match self {
            Self::Created => true,
            Self::Rejoined {
                subscription_changed,
            }
            | Self::Replaced {
                subscription_changed,
                ..
            } => *subscription_changed,
        }
    }
}

#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Registry {
    members: BTreeMap<String, Member>,
    fenced: BTreeMap<String, SystemTime>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates or updates the member with `member_id` from a join.
    pub fn upsert(
        &mut self,
        member_id: &str,
        join: &JoinRequest,
        session_timeout: Duration,
        rebalance_timeout: Duration,
        now: SystemTime,
    ) -> Result<Upsert> {
        if self.is_fenced(member_id) {
            return Err(Error::FencedMember {
                member_id: member_id.to_owned(),
                group_instance_id: join.group_instance_id.clone(),
            });
        }

        let replacing = join
            .group_instance_id
            .as_deref()
            .and_then(|group_instance_id| self.find_by_instance(group_instance_id))
            .filter(|existing| existing.member_id() != member_id)
            .map(|existing| (existing.member_id().to_owned(), existing.is_departed()));

        let upsert = if let Some((previous_member_id, departed)) = replacing {
            if !departed && join.member_epoch != 0 {
                return Err(Error::FencedMember {
                    member_id: member_id.to_owned(),
                    group_instance_id: join.group_instance_id.clone(),
                });
            }

            let Some(mut previous) = self.members.remove(&previous_member_id) else {
                return Err(Error::UnknownMember(previous_member_id));
            };

            if !departed {
                // the previous session is still live, its process has been replaced
                previous.depart(now);
                self.fence(&previous_member_id, now);
            }

            info!(
                member_id,
                %previous_member_id,
                group_instance_id = ?join.group_instance_id,
                departed
            );

            let member = previous.with_member_id(member_id);
            _ = self.members.insert(member_id.to_owned(), member);

            let subscription_changed =
                self.apply(member_id, join, session_timeout, rebalance_timeout, now)?;

            Upsert::Replaced {
                previous_member_id,
                subscription_changed,
            }
        } else if let Some(member) = self.members.get_mut(member_id) {
            if join.member_epoch != 0 && !member.accepts_epoch(join.member_epoch) {
                return Err(Error::StaleMemberEpoch {
                    member_id: member_id.to_owned(),
                    current: member.member_epoch(),
                    received: join.member_epoch,
                });
            }

            if member.is_departed() {
                member.resume(now);
            } else if !member.is_static() && join.member_epoch == 0 {
                member.reset();
            }

            let subscription_changed =
                self.apply(member_id, join, session_timeout, rebalance_timeout, now)?;

            Upsert::Rejoined {
                subscription_changed,
            }
        } else {
            debug!(member_id, group_instance_id = ?join.group_instance_id);

            _ = self
                .members
                .insert(member_id.to_owned(), Member::new(member_id, now));

            _ = self.apply(member_id, join, session_timeout, rebalance_timeout, now)?;

            Upsert::Created
        };

        Ok(upsert)
    }

    fn apply(
        &mut self,
        member_id: &str,
        join: &JoinRequest,
        session_timeout: Duration,
        rebalance_timeout: Duration,
        now: SystemTime,
    ) -> Result<bool> {
        let member = self
            .members
            .remove(member_id)
            .ok_or_else(|| Error::UnknownMember(member_id.to_owned()))?;

        let mut member = member
            .with_group_instance_id(join.group_instance_id.clone())
            .with_client_id(join.client_id.clone())
            .with_host(join.host.clone())
            .with_protocol(join.protocol)
            .with_session_timeout(session_timeout)
            .with_rebalance_timeout(rebalance_timeout);

        member.touch(now);
        let changed = member.subscribe(join.subscribed_topics.clone());

        _ = self.members.insert(member_id.to_owned(), member);

        Ok(changed)
    }

    pub fn remove(&mut self, member_id: &str) -> Option<Member> {
        self.members.remove(member_id)
    }

    pub fn get(&self, member_id: &str) -> Option<&Member> {
        self.members.get(member_id)
    }

    pub fn get_mut(&mut self, member_id: &str) -> Option<&mut Member> {
        self.members.get_mut(member_id)
    }

    /// Members with a session, ordered by member id.
    pub fn list_live(&self) -> impl Iterator<Item = &Member> {
        self.members.values().filter(|member| !member.is_departed())
    }

    /// Every member, including departed static members.
    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    pub fn member_ids(&self) -> Vec<String> {
        self.members.keys().cloned().collect()
    }

    pub fn find_by_instance(&self, group_instance_id: &str) -> Option<&Member> {
        self.members
            .values()
            .find(|member| member.group_instance_id() == Some(group_instance_id))
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn subscriptions(&self) -> Subscriptions {
        self.members
            .iter()
            .map(|(member_id, member)| (member_id.clone(), member.subscribed_topics().clone()))
            .collect()
    }

    pub fn subscribed_topics(&self) -> BTreeSet<String> {
        self.members
            .values()
            .flat_map(|member| member.subscribed_topics().iter().cloned())
            .collect()
    }

    pub fn fence(&mut self, member_id: &str, now: SystemTime) {
        _ = self.fenced.insert(member_id.to_owned(), now);
    }

    pub fn is_fenced(&self, member_id: &str) -> bool {
        self.fenced.contains_key(member_id)
    }

    /// Forgets members fenced before `before`.
    pub fn prune_fenced(&mut self, before: SystemTime) {
        self.fenced.retain(|member_id, fenced_at| {
            let retain = *fenced_at >= before;
            if !retain {
                debug!(%member_id, ?fenced_at);
            }
            retain
        });
    }
}
