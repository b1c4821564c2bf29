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
    collections::BTreeMap,
    ops::ControlFlow,
    sync::{Arc, LazyLock, Mutex, Weak},
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use opentelemetry::{KeyValue, metrics::Counter};
use tokio::{
    select,
    sync::{broadcast, mpsc, oneshot},
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    Error, METER, Result,
    config::Config,
    metadata::{TopicChange, TopicMetadata},
};

use super::{
    Coordinator, GroupDescription, HeartbeatRequest, HeartbeatResponse, JoinRequest,
    JoinResponse, group::Group,
};

static COORDINATOR_REQUESTS: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("tansu_coordinator_requests")
        .with_description("consumer group coordinator requests")
        .build()
});

/// A request that found its group task gone is sent again, once, to a new
/// task for the group.
const REQUEST_ATTEMPTS: u32 = 2;

type Groups = Mutex<BTreeMap<String, mpsc::Sender<Command>>>;

#[derive(Debug)]
enum Command {
    Join {
        request: JoinRequest,
        reply: oneshot::Sender<Result<JoinResponse>>,
    },

    Heartbeat {
        request: HeartbeatRequest,
        reply: oneshot::Sender<Result<HeartbeatResponse>>,
    },

    Leave {
        member_id: String,
        reply: oneshot::Sender<Result<()>>,
    },

    Describe {
        reply: oneshot::Sender<GroupDescription>,
    },

    ConfigureAssignor {
        assignor: String,
        reply: oneshot::Sender<Result<()>>,
    },

    Delete {
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Routes requests to one task per group, so that every change to a group
/// is applied in order.
#[derive(Clone, Debug)]
pub struct Controller<M> {
    config: Config,
    metadata: M,
    groups: Arc<Groups>,
    token: CancellationToken,
}

impl<M> Controller<M>
where
    M: TopicMetadata,
{
    pub fn new(config: Config, metadata: M) -> Self {
        Self {
            config,
            metadata,
            groups: Arc::new(Mutex::new(BTreeMap::new())),
            token: CancellationToken::new(),
        }
    }

    pub fn with_cancellation_token(self, token: CancellationToken) -> Self {
        Self { token, ..self }
    }

    /// Stops every group task.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn groups(&self) -> Result<Vec<String>> {
        self.groups
            .lock()
            .map(|groups| groups.keys().cloned().collect())
            .map_err(Into::into)
    }

    fn sender(&self, group_id: &str, create: bool) -> Result<mpsc::Sender<Command>> {
        if self.token.is_cancelled() {
            return Err(Error::ChannelClosed);
        }

        let mut groups = self.groups.lock()?;

        if let Some(sender) = groups.get(group_id).filter(|sender| !sender.is_closed()) {
            return Ok(sender.clone());
        }

        if !create {
            _ = groups.remove(group_id);
            return Err(Error::UnknownGroup(group_id.to_owned()));
        }

        let group = Group::new(group_id, self.config.clone(), self.metadata.clone())?;
        let (sender, requests) = mpsc::channel(self.config.group_channel_capacity.max(1));

        let actor = Actor {
            group,
            requests,
            sender: sender.downgrade(),
            groups: Arc::downgrade(&self.groups),
            changes: self.metadata.changes(),
            sweep_interval: self.config.sweep_interval(),
            idle_timeout: self.config.rejoin_grace_timeout(),
            idle_since: None,
            token: self.token.child_token(),
        };

        info!(group_id);

        _ = tokio::spawn(actor.run());
        _ = groups.insert(group_id.to_owned(), sender.clone());

        Ok(sender)
    }

    async fn request<T>(
        &self,
        group_id: &str,
        create: bool,
        command: impl Fn(oneshot::Sender<T>) -> Command + Send,
    ) -> Result<T> {
        let mut attempt = 0;

        loop {
            attempt += 1;

            let sender = self.sender(group_id, create)?;
            let (reply, response) = oneshot::channel();

            // unanswered when the task retired before reaching the command
            let outcome = match sender.send(command(reply)).await {
                Ok(()) => response.await.map_err(Error::from),
                Err(_) => Err(Error::ChannelClosed),
            };

            match outcome {
                Err(error) if attempt < REQUEST_ATTEMPTS => debug!(group_id, attempt, ?error),
                otherwise => return otherwise,
            }
        }
    }
}

#[async_trait]
impl<M> Coordinator for Controller<M>
where
    M: TopicMetadata,
{
    async fn join(&mut self, request: JoinRequest) -> Result<JoinResponse> {
        COORDINATOR_REQUESTS.add(1, &[KeyValue::new("method", "join")]);

        let group_id = request.group_id.clone();

        self.request(&group_id, true, |reply| Command::Join {
            request: request.clone(),
            reply,
        })
        .await?
    }

    async fn heartbeat(&mut self, request: HeartbeatRequest) -> Result<HeartbeatResponse> {
        COORDINATOR_REQUESTS.add(1, &[KeyValue::new("method", "heartbeat")]);

        let group_id = request.group_id.clone();

        self.request(&group_id, false, |reply| Command::Heartbeat {
            request: request.clone(),
            reply,
        })
        .await?
    }

    async fn leave(&mut self, group_id: &str, member_id: &str) -> Result<()> {
        COORDINATOR_REQUESTS.add(1, &[KeyValue::new("method", "leave")]);

        self.request(group_id, false, |reply| Command::Leave {
            member_id: member_id.to_owned(),
            reply,
        })
        .await?
    }

    async fn describe(&mut self, group_id: &str) -> Result<GroupDescription> {
        COORDINATOR_REQUESTS.add(1, &[KeyValue::new("method", "describe")]);

        self.request(group_id, false, |reply| Command::Describe { reply })
            .await
    }

    async fn configure_assignor(&mut self, group_id: &str, assignor: &str) -> Result<()> {
        COORDINATOR_REQUESTS.add(1, &[KeyValue::new("method", "configure_assignor")]);

        self.request(group_id, false, |reply| Command::ConfigureAssignor {
            assignor: assignor.to_owned(),
            reply,
        })
        .await?
    }

    async fn delete_group(&mut self, group_id: &str) -> Result<()> {
        COORDINATOR_REQUESTS.add(1, &[KeyValue::new("method", "delete_group")]);

        self.request(group_id, false, |reply| Command::Delete { reply })
            .await?
    }
}

#[derive(Debug)]
struct Actor<M> {
    group: Group<M>,
    requests: mpsc::Receiver<Command>,
    sender: mpsc::WeakSender<Command>,
    groups: Weak<Groups>,
    changes: broadcast::Receiver<TopicChange>,
    sweep_interval: Duration,
    idle_timeout: Duration,
    idle_since: Option<Instant>,
    token: CancellationToken,
}

impl<M> Actor<M>
where
    M: TopicMetadata,
{
    async fn run(mut self) {
        let mut sweep = time::interval(self.sweep_interval.max(Duration::from_millis(1)));
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut watching = true;

        loop {
            select! {
                _ = self.token.cancelled() => break,

                command = self.requests.recv() => {
                    let Some(command) = command else {
                        break;
                    };

                    if self.handle(command).is_break() {
                        break;
                    }
                }

                _ = sweep.tick() => {
                    self.group.tick(SystemTime::now());

                    if self.is_idle() {
                        match self.retire() {
                            Ok(()) => {
                                info!(group_id = self.group.group_id(), "retired");
                                break;
                            }

                            Err(error) => warn!(group_id = self.group.group_id(), ?error),
                        }
                    }
                }

                change = self.changes.recv(), if watching => {
                    match change {
                        Ok(change) => self.group.metadata_changed(SystemTime::now(), Some(&change)),

                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(group_id = self.group.group_id(), skipped);
                            self.group.metadata_changed(SystemTime::now(), None)
                        }

                        Err(broadcast::error::RecvError::Closed) => {
                            warn!(group_id = self.group.group_id(), "metadata changes closed");
                            watching = false;
                        }
                    }
                }
            }
        }

        debug!(group_id = self.group.group_id(), "stopped");
    }

    /// Whether the group has had no members, live or departed, for the idle
    /// timeout.
    fn is_idle(&mut self) -> bool {
        if !self.group.is_empty() {
            self.idle_since = None;
            return false;
        }

        self.idle_since.get_or_insert_with(Instant::now).elapsed() >= self.idle_timeout
    }

    /// Stops taking requests, removing the group unless a newer task has
    /// already taken its place. Requests still buffered are dropped
    /// unanswered, to be retried against a new task.
    fn retire(&mut self) -> Result<()> {
        if let Some(registered) = self.groups.upgrade() {
            let mut groups = registered.lock()?;

            if groups
                .get(self.group.group_id())
                .zip(self.sender.upgrade())
                .is_some_and(|(stored, sender)| stored.same_channel(&sender))
            {
                _ = groups.remove(self.group.group_id());
            }
        }

        self.requests.close();
        Ok(())
    }

    fn handle(&mut self, command: Command) -> ControlFlow<()> {
        let now = SystemTime::now();

        match command {
            Command::Join { request, reply } => {
                _ = reply.send(self.group.join(now, &request));
            }

            Command::Heartbeat { request, reply } => {
                _ = reply.send(self.group.heartbeat(now, &request));
            }

            Command::Leave { member_id, reply } => {
                _ = reply.send(self.group.leave(now, &member_id));
            }

            Command::Describe { reply } => {
                _ = reply.send(self.group.describe());
            }

            Command::ConfigureAssignor { assignor, reply } => {
                _ = reply.send(self.group.configure_assignor(now, &assignor));
            }

            Command::Delete { reply } => {
                if !self.group.is_empty() {
                    _ = reply.send(Err(Error::NonEmptyGroup(
                        self.group.group_id().to_owned(),
                    )));
                    return ControlFlow::Continue(());
                }

                let retired = self.retire();
                let deleted = retired.is_ok();

                info!(group_id = self.group.group_id(), deleted);
                _ = reply.send(retired);

                if deleted {
                    return ControlFlow::Break(());
                }
            }
        }

        ControlFlow::Continue(())
    }
}
