//! GPS fix ingestion.
//!
//! Mobile clients report fixes far more often than is worth storing. The
//! ingestor validates each fix, then accepts at most one per session per
//! minimum interval of backend wall-clock time. Fixes arriving sooner are
//! dropped and reported as [`LocationOutcome::Throttled`], which is not an
//! error.
//!
//! The throttle reads the timestamp of the last point on the persisted
//! route, so it needs no state of its own and survives restarts. Gaps from
//! lost connectivity stay gaps: nothing is backfilled or interpolated.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{Error, Result};
use crate::ids::SessionId;
use crate::session::{GeoPoint, RouteAppend, RoutePoint, SessionStore};

/// Default minimum spacing between accepted fixes.
pub const DEFAULT_MIN_FIX_INTERVAL_SECS: u64 = 10;

/// A location sample as reported by a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationFix {
    /// Degrees north.
    pub latitude: f64,
    /// Degrees east.
    pub longitude: f64,
    /// Horizontal accuracy in meters.
    pub accuracy: f64,
    /// Ground speed in m/s.
    #[serde(default)]
    pub speed: Option<f64>,
    /// Altitude in meters.
    #[serde(default)]
    pub altitude: Option<f64>,
    /// Altitude accuracy in meters.
    #[serde(default)]
    pub altitude_accuracy: Option<f64>,
    /// Heading in degrees.
    #[serde(default)]
    pub heading: Option<f64>,
    /// Device clock at sampling time.
    #[serde(default)]
    pub reported_at: Option<DateTime<Utc>>,
}

impl LocationFix {
    /// A fix with only the required fields.
    #[must_use]
    pub fn new(latitude: f64, longitude: f64, accuracy: f64) -> Self {
        Self {
            latitude,
            longitude,
            accuracy,
            speed: None,
            altitude: None,
            altitude_accuracy: None,
            heading: None,
            reported_at: None,
        }
    }

    /// Check plausibility.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidFix`] for out-of-range coordinates or a
    /// negative or non-finite accuracy.
    pub fn validate(&self) -> Result<()> {
        GeoPoint::new(self.latitude, self.longitude).validate()?;
        if !self.accuracy.is_finite() || self.accuracy < 0.0 {
            return Err(Error::invalid_fix(format!(
                "accuracy {} must be a non-negative number",
                self.accuracy
            )));
        }
        Ok(())
    }

    /// Build the stored route point, stamped with the receipt time.
    ///
    /// Null and NaN optionals are dropped rather than stored.
    #[must_use]
    pub fn to_route_point(&self, received_at: DateTime<Utc>) -> RoutePoint {
        RoutePoint {
            latitude: self.latitude,
            longitude: self.longitude,
            accuracy: self.accuracy,
            speed: finite(self.speed),
            altitude: finite(self.altitude),
            altitude_accuracy: finite(self.altitude_accuracy),
            heading: finite(self.heading),
            timestamp: received_at,
            reported_at: self.reported_at,
        }
    }
}

fn finite(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite())
}

/// What happened to a fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LocationOutcome {
    /// The fix was appended to the route.
    Accepted {
        /// Route length after the append.
        route_points: usize,
    },
    /// The fix arrived inside the throttle window and was dropped.
    Throttled {
        /// Route length, unchanged.
        route_points: usize,
    },
}

impl LocationOutcome {
    /// Whether the fix was stored.
    #[must_use]
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }

    /// Route length after handling the fix.
    #[must_use]
    pub fn route_points(&self) -> usize {
        match self {
            Self::Accepted { route_points } | Self::Throttled { route_points } => *route_points,
        }
    }
}

/// Validates and rate-limits fixes for active sessions.
#[derive(Debug)]
pub struct LocationIngestor {
    sessions: Arc<SessionStore>,
    min_interval: Duration,
}

impl LocationIngestor {
    /// Create an ingestor with the given minimum spacing between fixes.
    #[must_use]
    pub fn new(sessions: Arc<SessionStore>, min_interval: std::time::Duration) -> Self {
        Self {
            sessions,
            min_interval: Duration::from_std(min_interval).unwrap_or(Duration::MAX),
        }
    }

    /// The configured minimum spacing.
    #[must_use]
    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Offer a fix to a session.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidFix`] if the fix is implausible.
    /// - [`Error::SessionNotFound`] / [`Error::NotActive`] if the session
    ///   cannot take writes.
    pub fn accept(&self, session_id: &SessionId, fix: &LocationFix) -> Result<LocationOutcome> {
        fix.validate()?;

        let min_interval = self.min_interval;
        let appended = self.sessions.append_route_point(session_id, |session, now| {
            if let Some(last) = session.last_fix() {
                if now - last.timestamp < min_interval {
                    return None;
                }
            }
            Some(fix.to_route_point(now))
        })?;

        Ok(match appended {
            RouteAppend::Appended { route_points } => {
                trace!(%session_id, route_points, "Location fix accepted");
                LocationOutcome::Accepted { route_points }
            }
            RouteAppend::Skipped { route_points } => {
                trace!(%session_id, "Location fix throttled");
                LocationOutcome::Throttled { route_points }
            }
        })
    }
}
