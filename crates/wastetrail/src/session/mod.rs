//! Collection sessions.
//!
//! A [`Session`] is one driver's run over a fixed set of containers. It is
//! created active, mutated by visit and location events, and frozen when the
//! driver stops it. Sessions are never deleted.

mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ids::{ContainerRef, DriverId, SessionId};

pub use store::{NewSession, RouteAppend, SessionStore};

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Accepting visit and location writes.
    Active,
    /// Stopped; only the handoff stage may still change.
    Completed,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            other => Err(Error::internal(format!("unknown session status: {other}"))),
        }
    }
}

/// Where the session stands in the custody chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffStage {
    /// No handoff has been created.
    #[default]
    None,
    /// A facility-to-driver handoff is open.
    AwaitingFacilityConfirmation,
    /// The facility-to-driver handoff completed.
    FacilityConfirmed,
    /// A driver-to-incinerator handoff is open.
    AwaitingIncineratorHandoff,
    /// The incinerator accepted custody. Terminal.
    IncineratorConfirmed,
}

impl std::fmt::Display for HandoffStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::AwaitingFacilityConfirmation => "awaiting_facility_confirmation",
            Self::FacilityConfirmed => "facility_confirmed",
            Self::AwaitingIncineratorHandoff => "awaiting_incinerator_handoff",
            Self::IncineratorConfirmed => "incinerator_confirmed",
        };
        f.write_str(s)
    }
}

/// The custody position of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HandoffState {
    /// Current stage.
    pub stage: HandoffStage,
}

/// A plain coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    /// Degrees north, in [-90, 90].
    pub latitude: f64,
    /// Degrees east, in [-180, 180].
    pub longitude: f64,
}

impl GeoPoint {
    /// Create a point without validation.
    #[must_use]
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Check that both coordinates are finite and in range.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidFix`] naming the offending coordinate.
    pub fn validate(&self) -> Result<()> {
        if !self.latitude.is_finite() || !(-90.0..=90.0).contains(&self.latitude) {
            return Err(Error::invalid_fix(format!(
                "latitude {} outside [-90, 90]",
                self.latitude
            )));
        }
        if !self.longitude.is_finite() || !(-180.0..=180.0).contains(&self.longitude) {
            return Err(Error::invalid_fix(format!(
                "longitude {} outside [-180, 180]",
                self.longitude
            )));
        }
        Ok(())
    }
}

/// One accepted location sample on a session's route.
///
/// Optional motion attributes are absent rather than stored as sentinels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutePoint {
    /// Degrees north.
    pub latitude: f64,
    /// Degrees east.
    pub longitude: f64,
    /// Horizontal accuracy in meters.
    pub accuracy: f64,
    /// Ground speed in m/s.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    /// Altitude in meters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    /// Altitude accuracy in meters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude_accuracy: Option<f64>,
    /// Heading in degrees from true north.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    /// Backend receipt time. Authoritative.
    pub timestamp: DateTime<Utc>,
    /// Time reported by the device, kept for reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reported_at: Option<DateTime<Utc>>,
}

/// A container selected for the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectedContainer {
    /// Registry reference.
    pub container_ref: ContainerRef,
    /// Company the registry associates with the container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_id: Option<String>,
    /// Whether the driver has collected it.
    pub visited: bool,
    /// When it was first marked visited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visited_at: Option<DateTime<Utc>>,
    /// Weight recorded at collection, in kilograms.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collected_weight: Option<f64>,
}

/// A driver's collection run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Session identity.
    pub id: SessionId,
    /// Owning driver.
    pub driver_id: DriverId,
    /// Lifecycle status.
    pub status: SessionStatus,
    /// When the session was started.
    pub start_time: DateTime<Utc>,
    /// When the session was stopped.
    pub end_time: Option<DateTime<Utc>>,
    /// Where the driver started.
    pub start_location: Option<GeoPoint>,
    /// Where the driver stopped.
    pub end_location: Option<GeoPoint>,
    /// Containers in selection order. Membership never changes.
    pub selected_containers: Vec<SelectedContainer>,
    /// Accepted fixes in arrival order.
    pub route: Vec<RoutePoint>,
    /// Custody position.
    pub handoff_state: HandoffState,
    /// Record version, bumped on every persisted mutation.
    pub version: i64,
}

impl Session {
    /// Whether the session still accepts visit and location writes.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    /// Find a selected container.
    #[must_use]
    pub fn container(&self, container_ref: &ContainerRef) -> Option<&SelectedContainer> {
        self.selected_containers
            .iter()
            .find(|c| &c.container_ref == container_ref)
    }

    /// The visited containers, in selection order.
    ///
    /// This is the single derivation of the visited set; every component
    /// that needs it goes through here.
    pub fn visited(&self) -> impl Iterator<Item = &SelectedContainer> {
        self.selected_containers.iter().filter(|c| c.visited)
    }

    /// Number of visited containers.
    #[must_use]
    pub fn visited_count(&self) -> usize {
        self.visited().count()
    }

    /// Whether `container_ref` has been visited.
    #[must_use]
    pub fn is_visited(&self, container_ref: &ContainerRef) -> bool {
        self.container(container_ref).is_some_and(|c| c.visited)
    }

    /// The most recently accepted fix.
    #[must_use]
    pub fn last_fix(&self) -> Option<&RoutePoint> {
        self.route.last()
    }
}
