//! Chain-of-custody handoffs.
//!
//! Custody of a session's collected waste moves through two handoffs:
//! facility → driver, then driver → incineration plant. Each handoff is a
//! small state machine:
//!
//! ```text
//! pending -> confirmed_by_sender -> completed
//! pending -> rejected
//! ```
//!
//! `completed` and `rejected` are terminal.

mod chain;
mod token;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ids::{ContainerRef, HandoffId, SessionId};
use crate::session::HandoffStage;

pub use chain::{HandoffChain, IssuedHandoff};
pub use token::{ConfirmationToken, TokenSeal, MIN_TOKEN_BYTES};

/// Which custody transfer a handoff records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffType {
    /// The producing facility hands containers to the driver.
    FacilityToDriver,
    /// The driver hands containers to the incineration plant.
    DriverToIncinerator,
}

impl HandoffType {
    /// The handoff that must be completed before this one can be created.
    #[must_use]
    pub fn prerequisite(self) -> Option<Self> {
        match self {
            Self::FacilityToDriver => None,
            Self::DriverToIncinerator => Some(Self::FacilityToDriver),
        }
    }

    /// Session stage while a handoff of this type is open.
    #[must_use]
    pub fn pending_stage(self) -> HandoffStage {
        match self {
            Self::FacilityToDriver => HandoffStage::AwaitingFacilityConfirmation,
            Self::DriverToIncinerator => HandoffStage::AwaitingIncineratorHandoff,
        }
    }

    /// Session stage once a handoff of this type completes.
    #[must_use]
    pub fn completed_stage(self) -> HandoffStage {
        match self {
            Self::FacilityToDriver => HandoffStage::FacilityConfirmed,
            Self::DriverToIncinerator => HandoffStage::IncineratorConfirmed,
        }
    }

    /// Session stage to fall back to if a handoff of this type is rejected.
    #[must_use]
    pub fn preceding_stage(self) -> HandoffStage {
        match self {
            Self::FacilityToDriver => HandoffStage::None,
            Self::DriverToIncinerator => HandoffStage::FacilityConfirmed,
        }
    }
}

impl std::fmt::Display for HandoffType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FacilityToDriver => write!(f, "facility_to_driver"),
            Self::DriverToIncinerator => write!(f, "driver_to_incinerator"),
        }
    }
}

impl std::str::FromStr for HandoffType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "facility_to_driver" => Ok(Self::FacilityToDriver),
            "driver_to_incinerator" => Ok(Self::DriverToIncinerator),
            other => Err(Error::Validation(format!("unknown handoff type: {other}"))),
        }
    }
}

/// Handoff status. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffStatus {
    /// Created, waiting for the sender.
    Pending,
    /// The sender confirmed; waiting for the receiver's token.
    ConfirmedBySender,
    /// The receiver accepted custody.
    Completed,
    /// The handoff was refused.
    Rejected,
}

impl HandoffStatus {
    /// Whether no further transition is possible.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Rejected)
    }
}

impl std::fmt::Display for HandoffStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::ConfirmedBySender => write!(f, "confirmed_by_sender"),
            Self::Completed => write!(f, "completed"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

impl std::str::FromStr for HandoffStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "confirmed_by_sender" => Ok(Self::ConfirmedBySender),
            "completed" => Ok(Self::Completed),
            "rejected" => Ok(Self::Rejected),
            other => Err(Error::internal(format!("unknown handoff status: {other}"))),
        }
    }
}

/// A container declared in a handoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffContainer {
    /// Registry reference.
    pub container_ref: ContainerRef,
    /// Weight declared by the sender, in kilograms.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub declared_weight: Option<f64>,
}

impl HandoffContainer {
    /// A container without a declared weight.
    #[must_use]
    pub fn new(container_ref: impl Into<ContainerRef>) -> Self {
        Self {
            container_ref: container_ref.into(),
            declared_weight: None,
        }
    }

    /// Attach a declared weight.
    #[must_use]
    pub fn with_weight(mut self, kg: f64) -> Self {
        self.declared_weight = Some(kg);
        self
    }
}

/// Who receives custody.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Receiver {
    /// A registered incineration plant.
    IncinerationPlant {
        /// Plant identity.
        plant_id: String,
    },
    /// An ad-hoc contact reachable by phone.
    Contact {
        /// Phone number.
        phone: String,
    },
}

impl Receiver {
    /// How the receiver is named in the audit trail. Phone numbers are never
    /// written to the trail.
    #[must_use]
    pub fn audit_label(&self) -> String {
        match self {
            Self::IncinerationPlant { plant_id } => format!("plant:{plant_id}"),
            Self::Contact { .. } => "contact".to_string(),
        }
    }

    /// Check the receiver is well formed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidReceiver`] for an empty plant id or a phone
    /// number that does not match `phone_pattern`.
    pub fn validate(&self, phone_pattern: &Regex) -> Result<()> {
        match self {
            Self::IncinerationPlant { plant_id } if plant_id.trim().is_empty() => {
                Err(Error::invalid_receiver("plant id is empty"))
            }
            Self::Contact { phone } if !phone_pattern.is_match(phone) => Err(
                Error::invalid_receiver(format!("phone number {phone:?} is not valid")),
            ),
            _ => Ok(()),
        }
    }
}

/// A custody transfer record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handoff {
    /// Handoff identity.
    pub id: HandoffId,
    /// Owning session.
    pub session_id: SessionId,
    /// Which transfer this is.
    pub handoff_type: HandoffType,
    /// Current status.
    pub status: HandoffStatus,
    /// Declared containers.
    pub containers: Vec<HandoffContainer>,
    /// Number of declared containers.
    pub total_containers: usize,
    /// Sum of declared weights, in kilograms.
    pub total_declared_weight: f64,
    /// Receiving party.
    pub receiver: Receiver,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// When the sender confirmed.
    pub sender_confirmed_at: Option<DateTime<Utc>>,
    /// When the receiver accepted custody.
    pub completed_at: Option<DateTime<Utc>>,
    /// When the handoff was rejected.
    pub rejected_at: Option<DateTime<Utc>>,
    /// Why the handoff was rejected.
    pub rejection_reason: Option<String>,
    /// Stored token digest. Never serialized.
    #[serde(skip)]
    pub seal: TokenSeal,
    /// Record version, bumped on every persisted mutation.
    pub version: i64,
}

impl Handoff {
    /// Derive the container totals.
    #[must_use]
    pub fn totals(containers: &[HandoffContainer]) -> (usize, f64) {
        let weight = containers.iter().filter_map(|c| c.declared_weight).sum();
        (containers.len(), weight)
    }
}
