//! CLI command definitions.
//!
//! This module defines the structure of all CLI subcommands.

use std::path::PathBuf;

use clap::{Args, Subcommand, ValueEnum};

use crate::error::{Error, Result};
use crate::handoff::{HandoffContainer, HandoffType, Receiver};
use crate::session::GeoPoint;

/// Session commands.
#[derive(Debug, Subcommand)]
pub enum SessionCommand {
    /// Start a collection session
    Start {
        /// Driver starting the session
        #[arg(long)]
        driver: String,

        /// Client-generated session id
        #[arg(long)]
        id: Option<String>,

        /// Start location
        #[command(flatten)]
        location: PointArgs,

        /// Containers to collect
        #[arg(required = true)]
        containers: Vec<String>,
    },

    /// Stop a collection session
    Stop {
        /// Driver that owns the session
        #[arg(long)]
        driver: String,

        /// Session to stop
        session: String,

        /// End location
        #[command(flatten)]
        location: PointArgs,
    },

    /// Show the driver's active session
    Active {
        /// Driver to look up
        #[arg(long)]
        driver: String,
    },

    /// Mark a container as collected
    Visit {
        /// Driver that owns the session
        #[arg(long)]
        driver: String,

        /// Session the container belongs to
        session: String,

        /// Container reference
        container: String,

        /// Collected weight in kilograms
        #[arg(long)]
        weight: Option<f64>,
    },

    /// Show a session with its handoffs
    Summary {
        /// Session to show
        session: String,
    },
}

/// Location commands.
#[derive(Debug, Subcommand)]
pub enum LocationCommand {
    /// Record a GPS fix
    Record {
        /// Driver that owns the session
        #[arg(long)]
        driver: String,

        /// Session to record for
        session: String,

        /// Latitude in degrees
        #[arg(long, allow_negative_numbers = true)]
        lat: f64,

        /// Longitude in degrees
        #[arg(long, allow_negative_numbers = true)]
        lon: f64,

        /// Horizontal accuracy in meters
        #[arg(long)]
        accuracy: f64,

        /// Speed in m/s
        #[arg(long)]
        speed: Option<f64>,

        /// Altitude in meters
        #[arg(long, allow_negative_numbers = true)]
        altitude: Option<f64>,

        /// Altitude accuracy in meters
        #[arg(long)]
        altitude_accuracy: Option<f64>,

        /// Heading in degrees
        #[arg(long)]
        heading: Option<f64>,
    },
}

/// Handoff commands.
#[derive(Debug, Subcommand)]
pub enum HandoffCommand {
    /// Open a handoff and print its confirmation token
    Create {
        /// Driver that owns the session
        #[arg(long)]
        driver: String,

        /// Which custody transfer
        #[arg(long = "type", value_enum)]
        handoff_type: HandoffTypeArg,

        /// Receiving party
        #[command(flatten)]
        receiver: ReceiverArgs,

        /// Container to hand off, as REF or REF=KG (defaults to all visited)
        #[arg(long = "container", value_parser = parse_container)]
        containers: Vec<HandoffContainer>,

        /// Session the handoff belongs to
        session: String,
    },

    /// Confirm as sender, or as receiver when a token is given
    Confirm {
        /// Handoff to confirm
        handoff: String,

        /// Confirmation token (receiver only)
        #[arg(long)]
        token: Option<String>,

        /// Who is confirming, for the audit trail
        #[arg(long, default_value = "operator")]
        actor: String,
    },

    /// Reject a pending handoff
    Reject {
        /// Handoff to reject
        handoff: String,

        /// Why it is rejected
        #[arg(long)]
        reason: String,

        /// Who is rejecting, for the audit trail
        #[arg(long, default_value = "operator")]
        actor: String,
    },

    /// Show the handoff a token belongs to
    Lookup {
        /// Confirmation token
        token: String,
    },
}

/// Audit trail commands.
#[derive(Debug, Subcommand)]
pub enum AuditCommand {
    /// Print a session's custody trail
    Show {
        /// Session to show
        session: String,
    },

    /// Recompute a session's trail hashes
    Verify {
        /// Session to verify
        session: String,
    },
}

/// Container registry commands.
#[derive(Debug, Subcommand)]
pub enum ContainerCommand {
    /// Register a container
    Add {
        /// Container reference
        container: String,

        /// Owning company
        #[arg(long)]
        company: String,
    },
}

/// Configuration commands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Show configuration file path
    Path,

    /// Validate configuration file
    Validate {
        /// Path to configuration file (uses default if not specified)
        file: Option<PathBuf>,
    },
}

/// An optional coordinate pair.
#[derive(Debug, Clone, Args)]
pub struct PointArgs {
    /// Latitude in degrees
    #[arg(long, requires = "lon", allow_negative_numbers = true)]
    pub lat: Option<f64>,

    /// Longitude in degrees
    #[arg(long, requires = "lat", allow_negative_numbers = true)]
    pub lon: Option<f64>,
}

impl PointArgs {
    /// The point, if both coordinates were given.
    #[must_use]
    pub fn point(&self) -> Option<GeoPoint> {
        match (self.lat, self.lon) {
            (Some(lat), Some(lon)) => Some(GeoPoint::new(lat, lon)),
            _ => None,
        }
    }
}

/// Exactly one receiving party.
#[derive(Debug, Clone, Args)]
#[group(required = true, multiple = false)]
pub struct ReceiverArgs {
    /// Registered incineration plant id
    #[arg(long)]
    pub plant: Option<String>,

    /// Ad-hoc contact phone number
    #[arg(long)]
    pub phone: Option<String>,
}

impl ReceiverArgs {
    /// Build the receiver.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidReceiver`] if neither party was given.
    pub fn to_receiver(&self) -> Result<Receiver> {
        match (&self.plant, &self.phone) {
            (Some(plant_id), _) => Ok(Receiver::IncinerationPlant {
                plant_id: plant_id.clone(),
            }),
            (None, Some(phone)) => Ok(Receiver::Contact {
                phone: phone.clone(),
            }),
            (None, None) => Err(Error::invalid_receiver("no receiver given")),
        }
    }
}

/// Handoff type as a CLI value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum HandoffTypeArg {
    /// Facility hands containers to the driver
    FacilityToDriver,
    /// Driver hands containers to the incineration plant
    DriverToIncinerator,
}

impl From<HandoffTypeArg> for HandoffType {
    fn from(arg: HandoffTypeArg) -> Self {
        match arg {
            HandoffTypeArg::FacilityToDriver => Self::FacilityToDriver,
            HandoffTypeArg::DriverToIncinerator => Self::DriverToIncinerator,
        }
    }
}

/// Parse `REF` or `REF=KG`.
///
/// # Errors
///
/// Returns a message if the reference is empty or the weight is not a
/// number.
pub fn parse_container(value: &str) -> std::result::Result<HandoffContainer, String> {
    let (container_ref, weight) = match value.split_once('=') {
        Some((r, w)) => (r, Some(w)),
        None => (value, None),
    };
    if container_ref.is_empty() {
        return Err("container reference is empty".to_string());
    }

    let container = HandoffContainer::new(container_ref);
    match weight {
        Some(w) => w
            .parse::<f64>()
            .map(|kg| container.with_weight(kg))
            .map_err(|e| format!("invalid weight {w:?}: {e}")),
        None => Ok(container),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_container() {
        let plain = parse_container("A-17").unwrap();
        assert_eq!(plain.container_ref.as_str(), "A-17");
        assert_eq!(plain.declared_weight, None);

        let weighed = parse_container("A-17=3.25").unwrap();
        assert_eq!(weighed.declared_weight, Some(3.25));

        assert!(parse_container("=3").is_err());
        assert!(parse_container("A=heavy").is_err());
    }

    #[test]
    fn test_point_args() {
        let both = PointArgs {
            lat: Some(1.0),
            lon: Some(2.0),
        };
        assert_eq!(both.point(), Some(GeoPoint::new(1.0, 2.0)));

        let neither = PointArgs {
            lat: None,
            lon: None,
        };
        assert_eq!(neither.point(), None);
    }

    #[test]
    fn test_receiver_args() {
        let plant = ReceiverArgs {
            plant: Some("p-1".to_string()),
            phone: None,
        };
        assert!(matches!(
            plant.to_receiver().unwrap(),
            Receiver::IncinerationPlant { .. }
        ));

        let none = ReceiverArgs {
            plant: None,
            phone: None,
        };
        assert!(none.to_receiver().is_err());
    }

    #[test]
    fn test_handoff_type_arg_conversion() {
        assert_eq!(
            HandoffType::from(HandoffTypeArg::FacilityToDriver),
            HandoffType::FacilityToDriver
        );
        assert_eq!(
            HandoffType::from(HandoffTypeArg::DriverToIncinerator),
            HandoffType::DriverToIncinerator
        );
    }
}
