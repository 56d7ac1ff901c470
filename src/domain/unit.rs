use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::workflows::OperationState;

/// Unique tag of a spool, e.g. `SP-01`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitTag(pub String);

impl UnitTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UnitTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UnitTag {
    fn from(tag: &str) -> Self {
        Self(tag.to_string())
    }
}

/// Worker identity as recorded in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(pub String);

impl ActorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ActorId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl PartialEq<str> for ActorId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

/// Opaque optimistic-concurrency marker carried by every spool row.
///
/// A fresh token is minted for each successful write. The empty token is the
/// value of a row that has never been written by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionToken(pub String);

impl VersionToken {
    pub fn fresh() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("<unversioned>")
        } else {
            f.write_str(&self.0)
        }
    }
}

/// A named phase of work with its own lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    /// Assembly (fit-up) of the unions
    Arm,
    /// Welding of the unions
    Sold,
    /// Quality inspection, with the bounded repair sub-cycle
    Inspection,
}

impl Operation {
    pub const ALL: [Operation; 3] = [Operation::Arm, Operation::Sold, Operation::Inspection];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Arm => "ARM",
            Operation::Sold => "SOLD",
            Operation::Inspection => "INSPECTION",
        }
    }

    /// Whether the operation is performed union by union.
    pub fn tracks_sub_units(&self) -> bool {
        matches!(self, Operation::Arm | Operation::Sold)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown operation '{0}' (expected ARM, SOLD or INSPECTION)")]
pub struct ParseOperationError(pub String);

impl FromStr for Operation {
    type Err = ParseOperationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ARM" => Ok(Operation::Arm),
            "SOLD" => Ok(Operation::Sold),
            "INSPECTION" => Ok(Operation::Inspection),
            _ => Err(ParseOperationError(s.to_string())),
        }
    }
}

/// Who currently occupies a spool, and for which operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claimant {
    pub actor: ActorId,
    pub operation: Operation,
    pub claimed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    pub at: DateTime<Utc>,
    pub by: ActorId,
}

/// A union: the granular piece of a spool tracked for partial completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubUnit {
    pub id: String,
    pub unit_tag: UnitTag,
    /// Business weight used for progress, e.g. diameter-inches.
    pub weight: f64,
    pub arm: Option<Completion>,
    pub sold: Option<Completion>,
}

impl SubUnit {
    pub fn completion(&self, operation: Operation) -> Option<&Completion> {
        match operation {
            Operation::Arm => self.arm.as_ref(),
            Operation::Sold => self.sold.as_ref(),
            Operation::Inspection => None,
        }
    }

    pub fn is_complete(&self, operation: Operation) -> bool {
        self.completion(operation).is_some()
    }
}

/// A spool as currently recorded in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub tag: UnitTag,
    pub arm_state: OperationState,
    pub sold_state: OperationState,
    pub inspection_state: OperationState,
    pub repair_cycles: u8,
    pub claimant: Option<Claimant>,
    pub version: VersionToken,
    pub sub_units: Vec<SubUnit>,
}

impl WorkUnit {
    pub fn state(&self, operation: Operation) -> OperationState {
        match operation {
            Operation::Arm => self.arm_state,
            Operation::Sold => self.sold_state,
            Operation::Inspection => self.inspection_state,
        }
    }

    /// Claimant holding this spool for `operation`, if any.
    pub fn claimant_for(&self, operation: Operation) -> Option<&Claimant> {
        self.claimant
            .as_ref()
            .filter(|claimant| claimant.operation == operation)
    }

    pub fn completed_count(&self, operation: Operation) -> usize {
        self.sub_units
            .iter()
            .filter(|sub| sub.is_complete(operation))
            .count()
    }

    pub fn sub_unit(&self, id: &str) -> Option<&SubUnit> {
        self.sub_units.iter().find(|sub| sub.id == id)
    }
}
