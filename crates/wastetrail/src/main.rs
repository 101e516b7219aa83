//! `wtrail` - CLI for wastetrail
//!
//! Operator access to collection sessions, custody handoffs, and audit
//! trails. Domain commands print JSON to stdout; logs go to stderr.

#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;

use wastetrail::cli::{
    AuditCommand, Cli, Command, ConfigCommand, ContainerCommand, HandoffCommand,
    LocationCommand, SessionCommand,
};
use wastetrail::{
    init_logging, CollectionCoordinator, Config, ConfirmationToken, ContainerRef, DriverId,
    HandoffId, LocationFix, SessionId, SqliteStore, StartCollection, SystemClock,
    TracingPublisher,
};

fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbosity());

    match cli.command {
        // Validation reports its own errors instead of failing startup.
        Command::Config(ConfigCommand::Validate { file }) => {
            handle_validate(file.or(cli.config));
            Ok(())
        }
        command => {
            let config =
                Config::load_from(cli.config.clone()).context("failed to load configuration")?;
            run(&config, command)
        }
    }
}

fn run(config: &Config, command: Command) -> Result<()> {
    match command {
        Command::Config(cmd) => handle_config(config, cmd),
        Command::Container(cmd) => {
            let store = open_store(config)?;
            handle_container(&store, cmd)
        }
        Command::Session(cmd) => handle_session(&coordinator(config)?, cmd),
        Command::Location(cmd) => handle_location(&coordinator(config)?, cmd),
        Command::Handoff(cmd) => handle_handoff(&coordinator(config)?, cmd),
        Command::Audit(cmd) => handle_audit(&coordinator(config)?, cmd),
    }
}

fn open_store(config: &Config) -> Result<Arc<SqliteStore>> {
    let path = config.database_path();
    let store = SqliteStore::open_with_timeout(&path, config.busy_timeout())
        .with_context(|| format!("failed to open database at {}", path.display()))?;
    Ok(Arc::new(store))
}

fn coordinator(config: &Config) -> Result<CollectionCoordinator> {
    let store = open_store(config)?;
    let coordinator = CollectionCoordinator::new(
        store.clone(),
        store,
        Arc::new(SystemClock),
        Arc::new(TracingPublisher),
        config,
    )?;
    Ok(coordinator)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn handle_session(coordinator: &CollectionCoordinator, cmd: SessionCommand) -> Result<()> {
    match cmd {
        SessionCommand::Start {
            driver,
            id,
            location,
            containers,
        } => {
            let session = coordinator.start_collection(
                &DriverId::new(driver),
                StartCollection {
                    session_id: id.map(SessionId::new),
                    container_refs: containers.into_iter().map(ContainerRef::new).collect(),
                    start_location: location.point(),
                },
            )?;
            print_json(&session)
        }
        SessionCommand::Stop {
            driver,
            session,
            location,
        } => {
            let session = coordinator.stop_collection(
                &DriverId::new(driver),
                &SessionId::new(session),
                location.point(),
            )?;
            print_json(&session)
        }
        SessionCommand::Active { driver } => {
            print_json(&coordinator.active_session(&DriverId::new(driver))?)
        }
        SessionCommand::Visit {
            driver,
            session,
            container,
            weight,
        } => {
            let session = coordinator.mark_visited(
                &DriverId::new(driver),
                &SessionId::new(session),
                &ContainerRef::new(container),
                weight,
            )?;
            print_json(&session)
        }
        SessionCommand::Summary { session } => {
            print_json(&coordinator.session_summary(&SessionId::new(session))?)
        }
    }
}

fn handle_location(coordinator: &CollectionCoordinator, cmd: LocationCommand) -> Result<()> {
    match cmd {
        LocationCommand::Record {
            driver,
            session,
            lat,
            lon,
            accuracy,
            speed,
            altitude,
            altitude_accuracy,
            heading,
        } => {
            let fix = LocationFix {
                speed,
                altitude,
                altitude_accuracy,
                heading,
                ..LocationFix::new(lat, lon, accuracy)
            };
            let recorded = coordinator.record_location(
                &DriverId::new(driver),
                &SessionId::new(session),
                &fix,
            )?;
            print_json(&recorded)
        }
    }
}

fn handle_handoff(coordinator: &CollectionCoordinator, cmd: HandoffCommand) -> Result<()> {
    match cmd {
        HandoffCommand::Create {
            driver,
            handoff_type,
            receiver,
            containers,
            session,
        } => {
            let containers = if containers.is_empty() {
                None
            } else {
                Some(containers)
            };
            let issued = coordinator.create_handoff(
                &DriverId::new(driver),
                &SessionId::new(session),
                handoff_type.into(),
                receiver.to_receiver()?,
                containers,
            )?;
            print_json(&issued)
        }
        HandoffCommand::Confirm {
            handoff,
            token,
            actor,
        } => {
            let token = token.map(ConfirmationToken::from_plaintext);
            let handoff =
                coordinator.confirm_handoff(&HandoffId::new(handoff), token.as_ref(), &actor)?;
            print_json(&handoff)
        }
        HandoffCommand::Reject {
            handoff,
            reason,
            actor,
        } => print_json(&coordinator.reject_handoff(&HandoffId::new(handoff), &reason, &actor)?),
        HandoffCommand::Lookup { token } => print_json(
            &coordinator.lookup_handoff_by_token(&ConfirmationToken::from_plaintext(token))?,
        ),
    }
}

fn handle_audit(coordinator: &CollectionCoordinator, cmd: AuditCommand) -> Result<()> {
    match cmd {
        AuditCommand::Show { session } => {
            print_json(&coordinator.audit_trail(&SessionId::new(session))?)
        }
        AuditCommand::Verify { session } => {
            let report = coordinator.verify_trail(&SessionId::new(session))?;
            print_json(&report)?;
            if !report.intact {
                anyhow::bail!("custody trail failed verification");
            }
            Ok(())
        }
    }
}

fn handle_container(store: &SqliteStore, cmd: ContainerCommand) -> Result<()> {
    match cmd {
        ContainerCommand::Add { container, company } => {
            store.register_container(&ContainerRef::new(container.as_str()), &company)?;
            print_json(&serde_json::json!({
                "container_ref": container,
                "company_id": company,
            }))
        }
    }
}

fn handle_config(config: &Config, cmd: ConfigCommand) -> Result<()> {
    match cmd {
        ConfigCommand::Show { json } => {
            if json {
                print_json(config)?;
            } else {
                println!("Current Configuration");
                println!("=====================");
                println!();
                println!("[Storage]");
                println!("  Database path:      {}", config.database_path().display());
                println!("  Busy timeout (ms):  {}", config.storage.busy_timeout_ms);
                println!();
                println!("[Tracking]");
                println!(
                    "  Min fix interval:   {}s",
                    config.tracking.min_fix_interval_secs
                );
                println!();
                println!("[Handoff]");
                println!("  Token bytes:        {}", config.handoff.token_bytes);
                println!("  Phone pattern:      {}", config.handoff.phone_pattern);
            }
        }
        ConfigCommand::Path => {
            println!("{}", Config::default_config_path().display());
        }
        ConfigCommand::Validate { file } => handle_validate(file),
    }
    Ok(())
}

fn handle_validate(file: Option<std::path::PathBuf>) {
    let path = file.unwrap_or_else(Config::default_config_path);
    println!("Validating configuration: {}", path.display());
    match Config::load_from(Some(path)) {
        Ok(_) => println!("Configuration is valid."),
        Err(e) => println!("Configuration error: {e}"),
    }
}
