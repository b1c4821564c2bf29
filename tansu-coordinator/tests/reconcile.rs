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

use common::{
    acknowledge, assert_single_ownership, converge, init_tracing, member, topics, topitions,
};
use pretty_assertions::assert_eq;
use rand::{Rng, SeedableRng, rngs::StdRng, seq::IteratorRandom};
use tansu_coordinator::{
    Protocol, Result, Topition,
    assignor,
    config::Config,
    coordinator::{
        Controller, Coordinator, Group, GroupState, HeartbeatRequest, JoinRequest,
    },
    metadata::{InMemoryTopics, TopicChange},
};

pub mod common;

const GROUP_ID: &str = "orders";

#[tokio::test]
async fn revoke_then_grant() -> Result<()> {
    let _guard = init_tracing()?;

    let metadata = topics(&[("t", 6)])?;
    let mut controller = Controller::new(Config::default(), metadata);

    let a = controller
        .join(JoinRequest::new(GROUP_ID, ["t"]).member_id("a"))
        .await?;
    assert_eq!(topitions("t", 0..6), a.assigned_partitions);

    let description = converge(&mut controller, GROUP_ID).await?;
    assert_eq!(1, description.group_epoch);
    assert_eq!(1, member(&description, "a")?.member_epoch);

    let b = controller
        .join(JoinRequest::new(GROUP_ID, ["t"]).member_id("b"))
        .await?;
    assert!(b.assigned_partitions.is_empty());

    let description = controller.describe(GROUP_ID).await?;
    assert_eq!(2, description.group_epoch);
    assert_eq!(GroupState::Reconciling, description.state);
    assert_eq!(topitions("t", 0..3), member(&description, "a")?.target_assignment);
    assert_eq!(topitions("t", 3..6), member(&description, "b")?.target_assignment);

    let a = controller
        .heartbeat(HeartbeatRequest::new(GROUP_ID, "a", 1))
        .await?;
    assert_eq!(topitions("t", 3..6), a.revoke);

    // nothing is granted to b while a still holds the partitions
    let b = controller
        .heartbeat(HeartbeatRequest::new(GROUP_ID, "b", 0))
        .await?;
    assert!(b.grant.is_empty());

    let a = acknowledge(&mut controller, GROUP_ID, "a").await?;
    assert_eq!(2, a.member_epoch);

    let b = controller
        .heartbeat(HeartbeatRequest::new(GROUP_ID, "b", 0))
        .await?;
    assert_eq!(topitions("t", 3..6), b.grant);

    let description = converge(&mut controller, GROUP_ID).await?;
    assert_eq!(topitions("t", 0..3), member(&description, "a")?.current_assignment);
    assert_eq!(topitions("t", 3..6), member(&description, "b")?.current_assignment);
    assert_eq!(2, member(&description, "b")?.member_epoch);

    controller.shutdown();

    Ok(())
}

#[tokio::test]
async fn static_member_restart() -> Result<()> {
    let _guard = init_tracing()?;

    let metadata = topics(&[("t", 4)])?;
    let mut controller = Controller::new(Config::default(), metadata);

    let join = JoinRequest::new(GROUP_ID, ["t"])
        .group_instance_id("consumer-1")
        .client_id("app");

    let first = controller.join(join.clone()).await?;
    _ = controller
        .join(JoinRequest::new(GROUP_ID, ["t"]).member_id("dynamic"))
        .await?;

    let before = converge(&mut controller, GROUP_ID).await?;
    let held = member(&before, &first.member_id)?.current_assignment.clone();

    controller.leave(GROUP_ID, &first.member_id).await?;

    let departed = controller.describe(GROUP_ID).await?;
    assert_eq!(before.group_epoch, departed.group_epoch);
    assert!(member(&departed, &first.member_id)?.departed);

    // the departed member's partitions are not handed to anyone else
    let dynamic = acknowledge(&mut controller, GROUP_ID, "dynamic").await?;
    assert!(dynamic.grant.is_empty());

    let second = controller.join(join).await?;
    assert_eq!(first.member_id, second.member_id);
    assert_eq!(held, second.assigned_partitions);

    let after = controller.describe(GROUP_ID).await?;
    assert_eq!(before.group_epoch, after.group_epoch);
    assert_eq!(GroupState::Stable, after.state);

    Ok(())
}

#[tokio::test]
async fn incremental_sticky_moves_minimum() -> Result<()> {
    let _guard = init_tracing()?;

    let metadata = topics(&[("t", 12)])?;
    let mut controller = Controller::new(Config::default(), metadata);

    for member_id in ["m-0", "m-1", "m-2"] {
        _ = controller
            .join(JoinRequest::new(GROUP_ID, ["t"]).member_id(member_id))
            .await?;
    }

    let before = converge(&mut controller, GROUP_ID).await?;

    _ = controller
        .join(JoinRequest::new(GROUP_ID, ["t"]).member_id("m-3"))
        .await?;

    let after = converge(&mut controller, GROUP_ID).await?;

    let owners = |description: &tansu_coordinator::coordinator::GroupDescription| {
        description
            .members
            .iter()
            .flat_map(|member| {
                member
                    .target_assignment
                    .iter()
                    .map(|topition| (topition.clone(), member.member_id.clone()))
            })
            .collect::<assignor::TargetAssignment>()
    };

    assert_eq!(3, assignor::movement(&owners(&before), &owners(&after)));

    for member in &after.members {
        assert_eq!(3, member.current_assignment.len());
    }

    Ok(())
}

#[tokio::test]
async fn classic_and_incremental_members() -> Result<()> {
    let _guard = init_tracing()?;

    let metadata = topics(&[("t", 8)])?;
    let mut controller = Controller::new(Config::default(), metadata);

    for (member_id, protocol) in [
        ("classic-0", Protocol::Classic),
        ("incremental-0", Protocol::Incremental),
    ] {
        _ = controller
            .join(
                JoinRequest::new(GROUP_ID, ["t"])
                    .member_id(member_id)
                    .protocol(protocol),
            )
            .await?;
    }

    let description = converge(&mut controller, GROUP_ID).await?;
    assert!(!description.upgraded);

    for (member_id, protocol) in [
        ("classic-1", Protocol::Classic),
        ("incremental-1", Protocol::Incremental),
    ] {
        _ = controller
            .join(
                JoinRequest::new(GROUP_ID, ["t"])
                    .member_id(member_id)
                    .protocol(protocol),
            )
            .await?;

        assert_single_ownership(&controller.describe(GROUP_ID).await?);
    }

    let description = converge(&mut controller, GROUP_ID).await?;

    assert_eq!(
        8,
        description
            .members
            .iter()
            .map(|member| member.current_assignment.len())
            .sum::<usize>()
    );

    for member_id in ["classic-0", "classic-1"] {
        controller.leave(GROUP_ID, member_id).await?;
    }

    let description = converge(&mut controller, GROUP_ID).await?;
    assert!(description.upgraded);
    assert_eq!(2, description.members.len());

    Ok(())
}

#[tokio::test]
async fn departed_member_can_not_heartbeat() -> Result<()> {
    let _guard = init_tracing()?;

    let metadata = topics(&[("t", 2)])?;
    let mut controller = Controller::new(Config::default(), metadata);

    let joined = controller
        .join(JoinRequest::new(GROUP_ID, ["t"]).member_id("a"))
        .await?;

    controller.leave(GROUP_ID, &joined.member_id).await?;

    assert!(
        controller
            .heartbeat(HeartbeatRequest::new(GROUP_ID, "a", 0))
            .await
            .is_err_and(|error| error.is_member_error())
    );

    assert_eq!(
        GroupState::Empty,
        controller.describe(GROUP_ID).await?.state
    );

    Ok(())
}

/// The partitions each simulated client is consuming, as far as the client
/// knows.
type Consuming = BTreeMap<String, BTreeSet<Topition>>;

fn assert_consumed_once(consuming: &Consuming) {
    let mut seen = BTreeSet::new();

    for (member_id, topitions) in consuming {
        for topition in topitions {
            assert!(
                seen.insert(topition.clone()),
                "{topition} consumed by {member_id} and another client: {consuming:?}"
            );
        }
    }
}

/// A simulated member, acknowledging a random part of what it was told.
fn heartbeat(
    group: &mut Group<InMemoryTopics>,
    consuming: &mut Consuming,
    rng: &mut StdRng,
    now: SystemTime,
    member_id: &str,
) -> Result<()> {
    let Some(member) = group.members().get(member_id) else {
        return Ok(());
    };

    if member.is_departed() {
        return Ok(());
    }

    let revokes = member
        .pending_revoke()
        .iter()
        .filter(|_| rng.random_bool(0.7))
        .cloned()
        .collect::<BTreeSet<_>>();

    let grants = member
        .pending_grant()
        .iter()
        .filter(|_| rng.random_bool(0.7))
        .cloned()
        .collect::<BTreeSet<_>>();

    let epoch = member.member_epoch();

    let response = group.heartbeat(
        now,
        &HeartbeatRequest::new(GROUP_ID, member_id, epoch)
            .acknowledge(revokes.clone(), grants.clone()),
    )?;

    let client = consuming.entry(member_id.to_owned()).or_default();

    for topition in &revokes {
        _ = client.remove(topition);
    }

    client.extend(grants);
    client.extend(response.grant);

    Ok(())
}

/// An existing member joining again: as a restarted client, with the epoch
/// it already has, or as a new process taking over its instance id.
fn rejoin(
    group: &mut Group<InMemoryTopics>,
    consuming: &mut Consuming,
    rng: &mut StdRng,
    now: SystemTime,
    member_id: &str,
) -> Result<()> {
    let Some(member) = group.members().get(member_id) else {
        return Ok(());
    };

    let mut join = JoinRequest::new(GROUP_ID, member.subscribed_topics().clone())
        .protocol(member.protocol());

    if let Some(group_instance_id) = member.group_instance_id() {
        join = join.group_instance_id(group_instance_id);
    }

    let epoch = member.member_epoch();

    match rng.random_range(0..3) {
        0 => {
            let response = group.join(now, &join.member_id(member_id))?;
            _ = consuming.insert(member_id.to_owned(), response.assigned_partitions);
        }

        1 => {
            let response = group.join(now, &join.member_id(member_id).member_epoch(epoch))?;

            consuming
                .entry(member_id.to_owned())
                .or_default()
                .extend(response.assigned_partitions);
        }

        _ => {
            if join.group_instance_id.is_some() {
                let response = group.join(now, &join)?;
                assert_ne!(member_id, response.member_id);

                _ = consuming.remove(member_id);
                _ = consuming.insert(response.member_id, response.assigned_partitions);
            }
        }
    }

    Ok(())
}

#[test]
fn random_churn_keeps_single_ownership() -> Result<()> {
    let _guard = init_tracing()?;

    for seed in 0..16 {
        let mut rng = StdRng::seed_from_u64(seed);

        let metadata = topics(&[("t", 10), ("u", 4)])?;
        let mut group = Group::new(GROUP_ID, Config::default(), metadata.clone())?;
        let mut consuming = Consuming::new();

        let mut now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        let mut next = 0;

        for _ in 0..200 {
            now += Duration::from_millis(rng.random_range(0..500));

            let live = group
                .members()
                .list_live()
                .map(|member| member.member_id().to_owned())
                .collect::<Vec<_>>();

            match rng.random_range(0..12) {
                0 if live.len() < 6 => {
                    let protocol = if rng.random_bool(0.3) {
                        Protocol::Classic
                    } else {
                        Protocol::Incremental
                    };

                    let topics = if rng.random_bool(0.5) {
                        vec!["t", "u"]
                    } else {
                        vec!["t"]
                    };

                    let mut join = JoinRequest::new(GROUP_ID, topics)
                        .member_id(format!("m-{next}"))
                        .protocol(protocol);

                    if rng.random_bool(0.3) {
                        join = join.group_instance_id(format!("i-{next}"));
                    }

                    next += 1;

                    let response = group.join(now, &join)?;
                    _ = consuming.insert(response.member_id, response.assigned_partitions);
                }

                1 => {
                    if let Some(member_id) = live.iter().choose(&mut rng) {
                        group.leave(now, member_id)?;
                        _ = consuming.remove(member_id);
                    }
                }

                2 => {
                    let partitions = rng.random_range(1..12);
                    metadata.upsert("t", partitions)?;
                    group.metadata_changed(
                        now,
                        Some(&TopicChange {
                            topic: "t".into(),
                            partitions: Some(partitions),
                        }),
                    );

                    // partitions that no longer exist are not consumed
                    for topitions in consuming.values_mut() {
                        topitions.retain(|topition| {
                            topition.topic() != "t" || topition.partition() < partitions
                        });
                    }
                }

                3 => group.tick(now),

                4 | 5 => {
                    if let Some(member_id) = live.iter().choose(&mut rng) {
                        rejoin(&mut group, &mut consuming, &mut rng, now, member_id)?;
                    }
                }

                _ => {
                    for member_id in &live {
                        heartbeat(&mut group, &mut consuming, &mut rng, now, member_id)?;
                    }
                }
            }

            // clients without a session have stopped consuming
            consuming.retain(|member_id, _| {
                group
                    .members()
                    .get(member_id)
                    .is_some_and(|member| !member.is_departed())
            });

            assert_consumed_once(&consuming);

            let description = group.describe();
            assert_single_ownership(&description);
            assert!(description.target_assignment_epoch <= description.group_epoch);

            for member in &description.members {
                assert!(member.member_epoch <= description.target_assignment_epoch);
            }
        }

        // with churn over, well behaved members converge
        for _ in 0..16 {
            if group.state() == GroupState::Stable {
                break;
            }

            let live = group
                .members()
                .list_live()
                .map(|member| member.member_id().to_owned())
                .collect::<Vec<_>>();

            for member_id in live {
                let Some(member) = group.members().get(&member_id) else {
                    continue;
                };

                let heartbeat = HeartbeatRequest::new(GROUP_ID, &member_id, member.member_epoch())
                    .acknowledge(member.pending_revoke().clone(), member.pending_grant().clone());

                _ = group.heartbeat(now, &heartbeat)?;
            }
        }

        let description = group.describe();

        if description.members.iter().any(|member| !member.departed) {
            assert_eq!(GroupState::Stable, description.state, "seed: {seed}");
        }

        for member in description.members.iter().filter(|member| !member.departed) {
            assert_eq!(member.target_assignment, member.current_assignment, "seed: {seed}");
            assert_eq!(description.target_assignment_epoch, member.member_epoch);
        }
    }

    Ok(())
}
