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

//! Consumer group membership and partition assignment reconciliation.
//!
//! A group is driven from its current assignment to a target assignment
//! computed by an [`assignor::Assignor`]. Partitions move between members
//! with an epoch gated revoke then grant handoff, so that no two members
//! hold the same [`Topition`] at the same time.

use std::{
    fmt, io, result,
    str::FromStr,
    sync::{LazyLock, PoisonError},
};

use opentelemetry::{InstrumentationScope, global, metrics::Meter};
use opentelemetry_semantic_conventions::SCHEMA_URL;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot::error::RecvError;
use tracing_subscriber::filter::ParseError;

pub mod assignor;
pub mod config;
pub mod coordinator;
pub mod metadata;
pub mod otel;

pub(crate) static METER: LazyLock<Meter> = LazyLock::new(|| {
    global::meter_with_scope(
        InstrumentationScope::builder(env!("CARGO_PKG_NAME"))
            .with_version(env!("CARGO_PKG_VERSION"))
            .with_schema_url(SCHEMA_URL)
            .build(),
    )
});

#[derive(Error, Debug)]
pub enum Error {
    Assignor(String),
    ChannelClosed,
    FencedMember {
        member_id: String,
        group_instance_id: Option<String>,
    },
    InvalidAssignment(String),
    InvalidSubscription(String),
    Io(#[from] io::Error),
    Message(String),
    Metadata(String),
    NonEmptyGroup(String),
    OneshotRecv(#[from] RecvError),
    ParseFilter(#[from] ParseError),
    Poison,
    StaleMemberEpoch {
        member_id: String,
        current: i32,
        received: i32,
    },
    UnknownAssignor(String),
    UnknownGroup(String),
    UnknownMember(String),
    UnsupportedTracingFormat(String),
}

impl<T> From<PoisonError<T>> for Error {
    fn from(_value: PoisonError<T>) -> Self {
        Self::Poison
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Message(msg) => write!(f, "{msg}"),
            error => write!(f, "{error:?}"),
        }
    }
}

impl Error {
    /// Errors that belong to a single member's request, returned to that
    /// caller only.
    pub fn is_member_error(&self) -> bool {
        matches!(
            self,
            Self::FencedMember { .. } | Self::StaleMemberEpoch { .. } | Self::UnknownMember(..)
        )
    }
}

pub type Result<T, E = Error> = result::Result<T, E>;

/// Topic Partition (topition)
///
/// A topic partition pair.
#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct Topition {
    topic: String,
    partition: i32,
}

impl Topition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        let topic = topic.into();
        Self { topic, partition }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }
}

impl fmt::Display for Topition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// The rebalance protocol spoken by a member, fixed for its session.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub enum Protocol {
    /// Eager, client driven: every held partition is revoked before any new
    /// assignment is handed out.
    Classic,

    /// Server driven, per partition revoke then grant.
    #[default]
    Incremental,
}

impl Protocol {
    pub fn is_upgraded(&self) -> bool {
        matches!(self, Self::Incremental)
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "classic" => Ok(Self::Classic),
            "consumer" | "incremental" => Ok(Self::Incremental),
            otherwise => Err(Error::Message(format!("unknown protocol: {otherwise}"))),
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub enum TracingFormat {
    Text,
    Json,
}

impl FromStr for TracingFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            otherwise => Err(Error::UnsupportedTracingFormat(otherwise.to_owned())),
        }
    }
}
