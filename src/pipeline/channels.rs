//! Channel routing between stage instances.
//!
//! Two channel kinds exist:
//!
//! - **Routed** channels carry one item per `(role, sample)` from a single
//!   producer to every declared consumer. Consumers read independently; each
//!   consumer instance receives the item at most once.
//! - **Collecting** channels accumulate one item per contributing
//!   `(stage, sample)` and release the complete set to their single consumer
//!   once the expected count (known from the topology) is reached. After
//!   release the channel is sealed; any further write is a protocol error.
//!
//! The router is owned by the scheduler's coordinator task, so it needs no
//! interior locking.

use serde::{Serialize, Serializer};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;

use crate::error::ChannelError;
use crate::topology::{ChannelKind, ChannelRole, Scope, Topology};

/// Identifies which sample a channel item or stage instance belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SampleKey {
    Sample(String),
    /// Run-wide (`*global*`)
    Global,
}

impl SampleKey {
    pub fn sample(name: impl Into<String>) -> Self {
        SampleKey::Sample(name.into())
    }

    pub fn as_str(&self) -> &str {
        match self {
            SampleKey::Sample(name) => name,
            SampleKey::Global => "*global*",
        }
    }
}

impl fmt::Display for SampleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for SampleKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Files produced by one stage instance for one role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Artifact {
    pub producer: &'static str,
    pub sample: SampleKey,
    pub files: Vec<PathBuf>,
}

#[derive(Debug)]
struct RoutedChannel {
    item: Artifact,
    delivered: HashSet<(&'static str, SampleKey)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectState {
    /// Accepting contributions
    Open,
    /// A contributor failed; the channel can never release
    Blocked,
    /// Count reached; waiting for the consumer to take the set
    Released,
    /// Set delivered; no further writes or reads
    Sealed,
}

/// Fan-in channel for an aggregator stage.
#[derive(Debug)]
pub struct CollectingChannel {
    role: ChannelRole,
    consumer: &'static str,
    expected: usize,
    items: BTreeMap<(SampleKey, &'static str), Artifact>,
    state: CollectState,
}

impl CollectingChannel {
    pub fn new(role: ChannelRole, consumer: &'static str, expected: usize) -> Self {
        Self {
            role,
            consumer,
            expected,
            items: BTreeMap::new(),
            state: if expected == 0 {
                CollectState::Released
            } else {
                CollectState::Open
            },
        }
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn observed(&self) -> usize {
        self.items.len()
    }

    pub fn state(&self) -> CollectState {
        self.state
    }

    /// Add one item. Returns true if this write completed the set.
    pub fn contribute(&mut self, artifact: Artifact) -> Result<bool, ChannelError> {
        let key = (artifact.sample.clone(), artifact.producer);
        if matches!(self.state, CollectState::Released | CollectState::Sealed)
            || (self.state == CollectState::Open && self.items.len() >= self.expected)
        {
            return Err(ChannelError::Sealed {
                role: self.role,
                stage: artifact.producer.to_string(),
                key: artifact.sample.to_string(),
            });
        }
        if self.items.contains_key(&key) {
            return Err(ChannelError::DuplicateContribution {
                role: self.role,
                stage: artifact.producer.to_string(),
                key: artifact.sample.to_string(),
            });
        }

        self.items.insert(key, artifact);
        if self.state == CollectState::Open && self.items.len() == self.expected {
            self.state = CollectState::Released;
            return Ok(true);
        }
        Ok(false)
    }

    /// Mark the channel as unable to complete.
    pub fn block(&mut self) {
        if self.state == CollectState::Open {
            self.state = CollectState::Blocked;
        }
    }

    pub fn is_released(&self) -> bool {
        self.state == CollectState::Released
    }

    /// Hand the full set to the consumer, ordered by sample name then
    /// producer, and seal the channel.
    pub fn take(&mut self, consumer: &str) -> Result<Vec<Artifact>, ChannelError> {
        if consumer != self.consumer {
            return Err(ChannelError::UndeclaredConsumer {
                role: self.role,
                stage: consumer.to_string(),
            });
        }
        match self.state {
            CollectState::Released => {
                self.state = CollectState::Sealed;
                Ok(std::mem::take(&mut self.items).into_values().collect())
            }
            CollectState::Sealed => Err(ChannelError::AlreadyDelivered {
                role: self.role,
                key: SampleKey::Global.to_string(),
                stage: consumer.to_string(),
            }),
            CollectState::Open | CollectState::Blocked => Err(ChannelError::NotReady {
                role: self.role,
                key: SampleKey::Global.to_string(),
            }),
        }
    }
}

/// All channels of one run.
#[derive(Debug)]
pub struct ChannelRouter {
    routed: HashMap<(ChannelRole, SampleKey), RoutedChannel>,
    collecting: BTreeMap<ChannelRole, CollectingChannel>,
    routed_consumers: HashMap<ChannelRole, Vec<&'static str>>,
    producer_scope: HashMap<ChannelRole, Scope>,
}

impl ChannelRouter {
    /// Create the channels for `topology` with `num_samples` samples.
    pub fn new(topology: &Topology, num_samples: usize) -> Self {
        let mut collecting = BTreeMap::new();
        let mut routed_consumers = HashMap::new();
        let mut producer_scope = HashMap::new();

        for (role, edge) in topology.edges() {
            match edge.kind {
                ChannelKind::Collecting => {
                    if let Some(consumer) = edge.consumers.first() {
                        let expected = topology.expected_count(*role, num_samples);
                        collecting.insert(*role, CollectingChannel::new(*role, consumer, expected));
                    }
                }
                ChannelKind::Routed => {
                    routed_consumers.insert(*role, edge.consumers.clone());
                    if let Some(scope) = topology.producer_scope(*role) {
                        producer_scope.insert(*role, scope);
                    }
                }
            }
        }

        Self {
            routed: HashMap::new(),
            collecting,
            routed_consumers,
            producer_scope,
        }
    }

    /// Publish one stage instance's output for `role`.
    pub fn publish(&mut self, role: ChannelRole, artifact: Artifact) -> Result<(), ChannelError> {
        match role.kind() {
            ChannelKind::Routed => {
                let key = (role, artifact.sample.clone());
                if self.routed.contains_key(&key) {
                    return Err(ChannelError::AlreadyPublished {
                        role,
                        key: artifact.sample.to_string(),
                    });
                }
                self.routed.insert(
                    key,
                    RoutedChannel {
                        item: artifact,
                        delivered: HashSet::new(),
                    },
                );
                Ok(())
            }
            ChannelKind::Collecting => match self.collecting.get_mut(&role) {
                Some(channel) => {
                    if channel.contribute(artifact)? {
                        tracing::debug!(
                            "Collecting channel {} complete ({} items)",
                            role,
                            channel.expected()
                        );
                    }
                    Ok(())
                }
                // Produced but never consumed: nothing to collect into.
                None => Ok(()),
            },
        }
    }

    /// Channel key a consumer instance reads a routed role from.
    fn routed_key(&self, role: ChannelRole, sample: &SampleKey) -> (ChannelRole, SampleKey) {
        match self.producer_scope.get(&role) {
            Some(Scope::Global) => (role, SampleKey::Global),
            _ => (role, sample.clone()),
        }
    }

    /// Whether `role` has an item available for consumer instance
    /// `(stage, sample)`.
    pub fn is_ready(&self, role: ChannelRole, stage: &'static str, sample: &SampleKey) -> bool {
        match role.kind() {
            ChannelKind::Routed => self
                .routed
                .get(&self.routed_key(role, sample))
                .is_some_and(|ch| !ch.delivered.contains(&(stage, sample.clone()))),
            ChannelKind::Collecting => self
                .collecting
                .get(&role)
                .is_some_and(CollectingChannel::is_released),
        }
    }

    /// Deliver `role` to consumer instance `(stage, sample)`.
    pub fn read(
        &mut self,
        role: ChannelRole,
        stage: &'static str,
        sample: &SampleKey,
    ) -> Result<Vec<Artifact>, ChannelError> {
        match role.kind() {
            ChannelKind::Routed => {
                let declared = self
                    .routed_consumers
                    .get(&role)
                    .is_some_and(|c| c.contains(&stage));
                if !declared {
                    return Err(ChannelError::UndeclaredConsumer {
                        role,
                        stage: stage.to_string(),
                    });
                }
                let key = self.routed_key(role, sample);
                let channel = self.routed.get_mut(&key).ok_or_else(|| ChannelError::NotReady {
                    role,
                    key: key.1.to_string(),
                })?;
                if !channel.delivered.insert((stage, sample.clone())) {
                    return Err(ChannelError::AlreadyDelivered {
                        role,
                        key: key.1.to_string(),
                        stage: stage.to_string(),
                    });
                }
                Ok(vec![channel.item.clone()])
            }
            ChannelKind::Collecting => self
                .collecting
                .get_mut(&role)
                .ok_or(ChannelError::UnknownChannel { role })?
                .take(stage),
        }
    }

    /// Mark a collecting channel as unable to complete.
    pub fn block(&mut self, role: ChannelRole) {
        if let Some(channel) = self.collecting.get_mut(&role) {
            channel.block();
        }
    }

    pub fn collecting(&self, role: ChannelRole) -> Option<&CollectingChannel> {
        self.collecting.get(&role)
    }

    /// Routed item for `(role, sample)`, if published.
    pub fn routed_item(&self, role: ChannelRole, sample: &SampleKey) -> Option<&Artifact> {
        self.routed.get(&(role, sample.clone())).map(|ch| &ch.item)
    }
}
