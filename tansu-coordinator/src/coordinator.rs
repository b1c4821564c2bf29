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

//! The group coordinator: join, heartbeat, leave and describe.

mod controller;
pub mod group;

use std::{collections::BTreeSet, fmt::Debug};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{Protocol, Result, Topition};

pub use controller::Controller;
pub use group::{Group, GroupDescription, GroupState, MemberDescription};

#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct JoinRequest {
    pub group_id: String,

    /// Absent on the first join of a session, unless a static member is
    /// resuming the id it had before.
    pub member_id: Option<String>,

    /// Zero for a new session, otherwise the epoch last seen by the member.
    pub member_epoch: i32,

    pub group_instance_id: Option<String>,
    pub client_id: Option<String>,
    pub host: Option<String>,
    pub subscribed_topics: BTreeSet<String>,
    pub protocol: Protocol,
    pub session_timeout_ms: Option<u64>,
    pub rebalance_timeout_ms: Option<u64>,
}

impl JoinRequest {
    pub fn new<I, T>(group_id: impl Into<String>, topics: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            group_id: group_id.into(),
            subscribed_topics: topics.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn member_id(self, member_id: impl Into<String>) -> Self {
        Self {
            member_id: Some(member_id.into()),
            ..self
        }
    }

    pub fn member_epoch(self, member_epoch: i32) -> Self {
        Self {
            member_epoch,
            ..self
        }
    }

    pub fn group_instance_id(self, group_instance_id: impl Into<String>) -> Self {
        Self {
            group_instance_id: Some(group_instance_id.into()),
            ..self
        }
    }

    pub fn client_id(self, client_id: impl Into<String>) -> Self {
        Self {
            client_id: Some(client_id.into()),
            ..self
        }
    }

    pub fn protocol(self, protocol: Protocol) -> Self {
        Self { protocol, ..self }
    }

    pub fn session_timeout_ms(self, session_timeout_ms: u64) -> Self {
        Self {
            session_timeout_ms: Some(session_timeout_ms),
            ..self
        }
    }

    pub fn rebalance_timeout_ms(self, rebalance_timeout_ms: u64) -> Self {
        Self {
            rebalance_timeout_ms: Some(rebalance_timeout_ms),
            ..self
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct JoinResponse {
    pub member_id: String,
    pub member_epoch: i32,
    pub assigned_partitions: BTreeSet<Topition>,
    pub heartbeat_interval_ms: u64,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct HeartbeatRequest {
    pub group_id: String,
    pub member_id: String,
    pub member_epoch: i32,

    /// Revoked partitions the member has stopped consuming.
    pub acknowledged_revokes: BTreeSet<Topition>,

    /// Granted partitions the member has started consuming.
    pub acknowledged_grants: BTreeSet<Topition>,
}

impl HeartbeatRequest {
    pub fn new(
        group_id: impl Into<String>,
        member_id: impl Into<String>,
        member_epoch: i32,
    ) -> Self {
        Self {
            group_id: group_id.into(),
            member_id: member_id.into(),
            member_epoch,
            ..Default::default()
        }
    }

    pub fn acknowledge(
        self,
        acknowledged_revokes: BTreeSet<Topition>,
        acknowledged_grants: BTreeSet<Topition>,
    ) -> Self {
        Self {
            acknowledged_revokes,
            acknowledged_grants,
            ..self
        }
    }
}

/// Outstanding instructions for a member, repeated until acknowledged.
#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct HeartbeatResponse {
    pub member_epoch: i32,
    pub revoke: BTreeSet<Topition>,
    pub grant: BTreeSet<Topition>,
    pub heartbeat_interval_ms: u64,
}

#[async_trait]
pub trait Coordinator: Clone + Debug + Send + Sync + 'static {
    async fn join(&mut self, request: JoinRequest) -> Result<JoinResponse>;

    async fn heartbeat(&mut self, request: HeartbeatRequest) -> Result<HeartbeatResponse>;

    async fn leave(&mut self, group_id: &str, member_id: &str) -> Result<()>;

    async fn describe(&mut self, group_id: &str) -> Result<GroupDescription>;

    /// Changes the assignor of a group, recomputing its target assignment.
    async fn configure_assignor(&mut self, group_id: &str, assignor: &str) -> Result<()>;

    /// Deletes a group without members.
    async fn delete_group(&mut self, group_id: &str) -> Result<()>;
}
