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

#![allow(dead_code)]

use std::collections::BTreeSet;

use tansu_coordinator::{
    Error, Result, Topition,
    coordinator::{
        Coordinator, GroupDescription, GroupState, HeartbeatRequest, HeartbeatResponse,
        MemberDescription,
    },
    metadata::InMemoryTopics,
};
use tracing::{debug, subscriber::DefaultGuard};
use tracing_subscriber::EnvFilter;

pub(crate) fn init_tracing() -> Result<DefaultGuard> {
    use std::{
        fs::{self, File},
        sync::Arc,
        thread,
    };

    let directory = format!("../logs/{}", env!("CARGO_PKG_NAME"));
    fs::create_dir_all(&directory)?;

    Ok(tracing::subscriber::set_default(
        tracing_subscriber::fmt()
            .with_level(true)
            .with_line_number(true)
            .with_thread_names(false)
            .with_env_filter(
                EnvFilter::from_default_env()
                    .add_directive(format!("{}=debug", env!("CARGO_CRATE_NAME")).parse()?)
                    .add_directive("tansu_coordinator=debug".parse()?),
            )
            .with_writer(
                thread::current()
                    .name()
                    .ok_or(Error::Message(String::from("unnamed thread")))
                    .and_then(|name| {
                        File::create(format!(
                            "{directory}/{}::{name}.log",
                            env!("CARGO_CRATE_NAME")
                        ))
                        .map_err(Into::into)
                    })
                    .map(Arc::new)?,
            )
            .finish(),
    ))
}

pub(crate) fn topics(topics: &[(&str, i32)]) -> Result<InMemoryTopics> {
    topics
        .iter()
        .try_fold(InMemoryTopics::new(), |metadata, (topic, partitions)| {
            metadata.with_topic(*topic, *partitions)
        })
}

pub(crate) fn topitions(
    topic: &str,
    partitions: impl IntoIterator<Item = i32>,
) -> BTreeSet<Topition> {
    partitions
        .into_iter()
        .map(|partition| Topition::new(topic, partition))
        .collect()
}

pub(crate) fn member<'a>(
    description: &'a GroupDescription,
    member_id: &str,
) -> Result<&'a MemberDescription> {
    description
        .members
        .iter()
        .find(|member| member.member_id == member_id)
        .ok_or_else(|| Error::UnknownMember(member_id.to_owned()))
}

/// No partition may be held, confirmed or granted, by more than one member.
pub(crate) fn assert_single_ownership(description: &GroupDescription) {
    let mut seen = BTreeSet::new();

    for member in &description.members {
        for topition in member.current_assignment.union(&member.pending_grant) {
            assert!(
                seen.insert(topition.clone()),
                "{topition} held by more than one member: {description:?}"
            );
        }
    }
}

/// A heartbeat from a well behaved member, acknowledging every outstanding
/// instruction.
pub(crate) async fn acknowledge<C>(
    coordinator: &mut C,
    group_id: &str,
    member_id: &str,
) -> Result<HeartbeatResponse>
where
    C: Coordinator,
{
    let description = coordinator.describe(group_id).await?;
    let member = member(&description, member_id)?;

    coordinator
        .heartbeat(
            HeartbeatRequest::new(group_id, member_id, member.member_epoch)
                .acknowledge(member.pending_revoke.clone(), member.pending_grant.clone()),
        )
        .await
}

/// Heartbeats every live member until the group is stable.
pub(crate) async fn converge<C>(coordinator: &mut C, group_id: &str) -> Result<GroupDescription>
where
    C: Coordinator,
{
    for round in 0..16 {
        let description = coordinator.describe(group_id).await?;
        assert_single_ownership(&description);

        if description.state == GroupState::Stable {
            debug!(round, group_epoch = description.group_epoch);
            return Ok(description);
        }

        for member in description.members.iter().filter(|member| !member.departed) {
            _ = acknowledge(coordinator, group_id, &member.member_id).await?;
        }
    }

    Err(Error::Message(format!("{group_id} did not converge")))
}
