//! Sample aggregate and helpers for tests and benchmarks.
//!
//! `Fabric` is a catalogue entry with enough field shapes (sets, maps, enums,
//! optional timestamps, durations, nested structs, a wrapper id) to exercise
//! the snapshot codec end to end.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Mutex;
use std::sync::mpsc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use sourcekit_core::{Agent, Aggregate, AggregateId, DomainError, EventMetadata, UserId};
use sourcekit_events::{Event, EventBus, JsonEventEnvelope, Subscription};

/// Typed identity wrapping the raw stream id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FabricId(AggregateId);

impl FabricId {
    pub fn new(raw: &str) -> Result<Self, DomainError> {
        AggregateId::new(raw).map(Self)
    }

    pub fn generate() -> Self {
        Self(AggregateId::generate())
    }
}

impl From<AggregateId> for FabricId {
    fn from(value: AggregateId) -> Self {
        Self(value)
    }
}

impl From<FabricId> for AggregateId {
    fn from(value: FabricId) -> Self {
        value.0
    }
}

impl fmt::Display for FabricId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Weave {
    #[default]
    Plain,
    Twill,
    Satin,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FabricStatus {
    #[default]
    Draft,
    Published,
    Retired,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width_cm: f64,
    pub roll_length_m: f64,
}

/// Aggregate body: everything that goes into a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Fabric {
    pub name: String,
    pub weave: Weave,
    pub status: FabricStatus,
    pub price_cents: i64,
    pub tags: BTreeSet<String>,
    pub stock_by_site: BTreeMap<String, u32>,
    pub featured: bool,
    /// Tombstone; deleted fabrics stay in the log.
    pub deleted: bool,
    pub owner: Option<UserId>,
    pub published_at: Option<DateTime<Utc>>,
    #[serde(with = "sourcekit_codec::duration::option", default)]
    pub lead_time: Option<Duration>,
    pub dimensions: Option<Dimensions>,
}

#[derive(Debug, Clone)]
pub enum FabricCommand {
    Create {
        name: String,
        weave: Weave,
        price_cents: i64,
    },
    Rename {
        name: String,
    },
    Tag {
        tag: String,
    },
    Restock {
        site: String,
        quantity: u32,
    },
    SetLeadTime(Duration),
    Measure(Dimensions),
    Feature,
    Unfeature,
    Publish,
    Retire,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FabricEvent {
    Created {
        name: String,
        weave: Weave,
        price_cents: i64,
    },
    Renamed {
        name: String,
    },
    Tagged {
        tag: String,
    },
    Restocked {
        site: String,
        quantity: u32,
    },
    LeadTimeSet {
        #[serde(with = "sourcekit_codec::duration")]
        lead_time: Duration,
    },
    Measured(Dimensions),
    Featured,
    Unfeatured,
    Published,
    Retired,
    Deleted,
}

impl Event for FabricEvent {
    fn event_type(&self) -> &'static str {
        match self {
            FabricEvent::Created { .. } => "fabric.created",
            FabricEvent::Renamed { .. } => "fabric.renamed",
            FabricEvent::Tagged { .. } => "fabric.tagged",
            FabricEvent::Restocked { .. } => "fabric.restocked",
            FabricEvent::LeadTimeSet { .. } => "fabric.lead_time_set",
            FabricEvent::Measured(_) => "fabric.measured",
            FabricEvent::Featured => "fabric.featured",
            FabricEvent::Unfeatured => "fabric.unfeatured",
            FabricEvent::Published => "fabric.published",
            FabricEvent::Retired => "fabric.retired",
            FabricEvent::Deleted => "fabric.deleted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FabricError {
    #[error("fabric already exists")]
    AlreadyExists,
    #[error("fabric has not been created")]
    NotCreated,
    #[error("fabric is deleted")]
    Deleted,
    #[error("fabric name must not be blank")]
    BlankName,
    #[error("price must not be negative")]
    NegativePrice,
    #[error("restock quantity must be positive")]
    ZeroQuantity,
    #[error("fabric is already featured")]
    AlreadyFeatured,
    #[error("fabric is not featured")]
    NotFeatured,
    #[error("fabric is already published")]
    AlreadyPublished,
    #[error("fabric is already retired")]
    AlreadyRetired,
}

impl Fabric {
    fn exists(&self) -> bool {
        !self.name.is_empty()
    }

    fn ensure_live(&self) -> Result<(), FabricError> {
        if !self.exists() {
            return Err(FabricError::NotCreated);
        }
        if self.deleted {
            return Err(FabricError::Deleted);
        }
        Ok(())
    }
}

fn non_blank(name: &str) -> Result<String, FabricError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(FabricError::BlankName);
    }
    Ok(name.to_string())
}

impl Aggregate for Fabric {
    const AGGREGATE_TYPE: &'static str = "FABRIC";

    type Id = FabricId;
    type Command = FabricCommand;
    type Event = FabricEvent;
    type Error = FabricError;

    fn handle(
        &self,
        command: &FabricCommand,
        _agent: &Agent,
    ) -> Result<Vec<FabricEvent>, FabricError> {
        if let FabricCommand::Create {
            name,
            weave,
            price_cents,
        } = command
        {
            if self.exists() {
                return Err(FabricError::AlreadyExists);
            }
            if *price_cents < 0 {
                return Err(FabricError::NegativePrice);
            }
            return Ok(vec![FabricEvent::Created {
                name: non_blank(name)?,
                weave: *weave,
                price_cents: *price_cents,
            }]);
        }

        self.ensure_live()?;

        let event = match command {
            FabricCommand::Create { .. } => return Err(FabricError::AlreadyExists),
            FabricCommand::Rename { name } => {
                let name = non_blank(name)?;
                if name == self.name {
                    return Ok(vec![]);
                }
                FabricEvent::Renamed { name }
            }
            FabricCommand::Tag { tag } => {
                if self.tags.contains(tag) {
                    return Ok(vec![]);
                }
                FabricEvent::Tagged { tag: tag.clone() }
            }
            FabricCommand::Restock { site, quantity } => {
                if *quantity == 0 {
                    return Err(FabricError::ZeroQuantity);
                }
                FabricEvent::Restocked {
                    site: site.clone(),
                    quantity: *quantity,
                }
            }
            FabricCommand::SetLeadTime(lead_time) => FabricEvent::LeadTimeSet {
                lead_time: *lead_time,
            },
            FabricCommand::Measure(dimensions) => FabricEvent::Measured(dimensions.clone()),
            FabricCommand::Feature => {
                if self.featured {
                    return Err(FabricError::AlreadyFeatured);
                }
                FabricEvent::Featured
            }
            FabricCommand::Unfeature => {
                if !self.featured {
                    return Err(FabricError::NotFeatured);
                }
                FabricEvent::Unfeatured
            }
            FabricCommand::Publish => {
                if self.status != FabricStatus::Draft {
                    return Err(FabricError::AlreadyPublished);
                }
                FabricEvent::Published
            }
            FabricCommand::Retire => {
                if self.status == FabricStatus::Retired {
                    return Err(FabricError::AlreadyRetired);
                }
                FabricEvent::Retired
            }
            FabricCommand::Delete => {
                // Unfeature on delete so listeners drop it from showcases.
                if self.featured {
                    return Ok(vec![FabricEvent::Unfeatured, FabricEvent::Deleted]);
                }
                FabricEvent::Deleted
            }
        };

        Ok(vec![event])
    }

    fn apply(&mut self, event: &FabricEvent, metadata: &EventMetadata) {
        match event {
            FabricEvent::Created {
                name,
                weave,
                price_cents,
            } => {
                self.name = name.clone();
                self.weave = *weave;
                self.price_cents = *price_cents;
                self.owner = metadata.agent.user_id();
            }
            FabricEvent::Renamed { name } => self.name = name.clone(),
            FabricEvent::Tagged { tag } => {
                self.tags.insert(tag.clone());
            }
            FabricEvent::Restocked { site, quantity } => {
                *self.stock_by_site.entry(site.clone()).or_default() += quantity;
            }
            FabricEvent::LeadTimeSet { lead_time } => self.lead_time = Some(*lead_time),
            FabricEvent::Measured(dimensions) => self.dimensions = Some(dimensions.clone()),
            FabricEvent::Featured => self.featured = true,
            FabricEvent::Unfeatured => self.featured = false,
            FabricEvent::Published => {
                self.status = FabricStatus::Published;
                self.published_at = Some(metadata.timestamp);
            }
            FabricEvent::Retired => self.status = FabricStatus::Retired,
            FabricEvent::Deleted => self.deleted = true,
        }
    }

    fn snapshot_threshold() -> u64 {
        2
    }
}

pub fn create(name: &str) -> FabricCommand {
    FabricCommand::Create {
        name: name.to_string(),
        weave: Weave::Twill,
        price_cents: 1_850,
    }
}

pub fn rename(name: &str) -> FabricCommand {
    FabricCommand::Rename {
        name: name.to_string(),
    }
}

pub fn tag(tag: &str) -> FabricCommand {
    FabricCommand::Tag {
        tag: tag.to_string(),
    }
}

pub fn restock(site: &str, quantity: u32) -> FabricCommand {
    FabricCommand::Restock {
        site: site.to_string(),
        quantity,
    }
}

/// A command sequence touching every field of [`Fabric`].
pub fn full_history() -> Vec<FabricCommand> {
    vec![
        create("Selvedge denim"),
        tag("cotton"),
        restock("north", 12),
        FabricCommand::SetLeadTime(Duration::days(3) + Duration::hours(4)),
        FabricCommand::Measure(Dimensions {
            width_cm: 150.0,
            roll_length_m: 50.5,
        }),
        FabricCommand::Feature,
        FabricCommand::Publish,
        rename("Raw selvedge denim"),
        restock("north", 3),
        tag("heavy"),
    ]
}

/// Bus whose `publish` always fails; records how often it was called.
#[derive(Debug, Default)]
pub struct FailingBus {
    attempts: Mutex<usize>,
}

#[derive(Debug, Error)]
#[error("bus unavailable")]
pub struct BusUnavailable;

impl FailingBus {
    pub fn attempts(&self) -> usize {
        self.attempts.lock().map(|n| *n).unwrap_or(0)
    }
}

impl EventBus<JsonEventEnvelope> for FailingBus {
    type Error = BusUnavailable;

    fn publish(&self, _message: JsonEventEnvelope) -> Result<(), Self::Error> {
        if let Ok(mut attempts) = self.attempts.lock() {
            *attempts += 1;
        }
        Err(BusUnavailable)
    }

    fn subscribe(&self) -> Subscription<JsonEventEnvelope> {
        let (_tx, rx) = mpsc::channel();
        Subscription::new(rx)
    }
}
