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
    sync::{Arc, RwLock},
};

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::{Result, Topition};

const CHANGE_CAPACITY: usize = 256;

/// A change in the partition count of a topic, `None` once the topic is deleted.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TopicChange {
    pub topic: String,
    pub partitions: Option<i32>,
}

/// The partition counts of a set of topics at one instant.
///
/// Topics without metadata are absent, so their partitions are never assigned.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct MetadataImage {
    topics: BTreeMap<String, i32>,
}

impl MetadataImage {
    pub fn new<I, T>(topics: I) -> Self
    where
        I: IntoIterator<Item = (T, i32)>,
        T: Into<String>,
    {
        Self {
            topics: topics
                .into_iter()
                .map(|(topic, partitions)| (topic.into(), partitions))
                .collect(),
        }
    }

    pub fn partition_count(&self, topic: &str) -> Option<i32> {
        self.topics.get(topic).copied()
    }

    pub fn topics(&self) -> impl Iterator<Item = (&str, i32)> {
        self.topics
            .iter()
            .map(|(topic, partitions)| (topic.as_str(), *partitions))
    }

    pub fn topitions(&self, topic: &str) -> impl Iterator<Item = Topition> {
        (0..self.partition_count(topic).unwrap_or(0))
            .map(move |partition| Topition::new(topic, partition))
    }

    pub fn contains(&self, topition: &Topition) -> bool {
        self.partition_count(topition.topic()).is_some_and(|partitions| {
            topition.partition() >= 0 && topition.partition() < partitions
        })
    }
}

/// Read only view of topic metadata, refreshed elsewhere.
pub trait TopicMetadata: Clone + Debug + Send + Sync + 'static {
    fn partition_count(&self, topic: &str) -> Result<Option<i32>>;

    /// The subset of `topics` that have metadata.
    fn subscribed_topics_exist(&self, topics: &BTreeSet<String>) -> Result<BTreeSet<String>>;

    /// Notifications of partition count changes.
    fn changes(&self) -> broadcast::Receiver<TopicChange>;

    fn image(&self, topics: &BTreeSet<String>) -> Result<MetadataImage> {
        let mut image = BTreeMap::new();

        for topic in self.subscribed_topics_exist(topics)? {
            if let Some(partitions) = self.partition_count(&topic)? {
                _ = image.insert(topic, partitions);
            }
        }

        Ok(MetadataImage { topics: image })
    }
}

/// Topic metadata held in memory, typically fed by a controller
/// registration listener.
#[derive(Clone, Debug)]
pub struct InMemoryTopics {
    topics: Arc<RwLock<BTreeMap<String, i32>>>,
    changes: broadcast::Sender<TopicChange>,
}

impl Default for InMemoryTopics {
    fn default() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);

        Self {
            topics: Default::default(),
            changes,
        }
    }
}

impl InMemoryTopics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_topic(self, topic: impl Into<String>, partitions: i32) -> Result<Self> {
        self.upsert(topic, partitions).map(|()| self)
    }

    /// Creates a topic or changes its partition count.
    pub fn upsert(&self, topic: impl Into<String>, partitions: i32) -> Result<()> {
        let topic = topic.into();

        let previous = self
            .topics
            .write()
            .map(|mut topics| topics.insert(topic.clone(), partitions))?;

        if previous != Some(partitions) {
            debug!(%topic, ?previous, partitions);
            self.notify(TopicChange {
                topic,
                partitions: Some(partitions),
            });
        }

        Ok(())
    }

    pub fn delete(&self, topic: &str) -> Result<()> {
        let previous = self
            .topics
            .write()
            .map(|mut topics| topics.remove(topic))?;

        if previous.is_some() {
            debug!(topic, ?previous);
            self.notify(TopicChange {
                topic: topic.to_owned(),
                partitions: None,
            });
        }

        Ok(())
    }

    fn notify(&self, change: TopicChange) {
        // no receivers just means no group is listening yet
        _ = self
            .changes
            .send(change)
            .inspect_err(|err| debug!(?err));
    }
}

impl TopicMetadata for InMemoryTopics {
    fn partition_count(&self, topic: &str) -> Result<Option<i32>> {
        self.topics
            .read()
            .map(|topics| topics.get(topic).copied())
            .map_err(Into::into)
    }

    fn subscribed_topics_exist(&self, topics: &BTreeSet<String>) -> Result<BTreeSet<String>> {
        self.topics
            .read()
            .map(|known| {
                topics
                    .iter()
                    .filter(|topic| known.contains_key(*topic))
                    .cloned()
                    .collect()
            })
            .map_err(Into::into)
    }

    fn changes(&self) -> broadcast::Receiver<TopicChange> {
        self.changes.subscribe()
    }
}
