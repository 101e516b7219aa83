//! Container registry lookups.
//!
//! The registry is owned by another part of the product. The core only asks
//! whether a container exists and which company it belongs to.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::ids::ContainerRef;

/// What the registry knows about a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    /// Registry reference.
    pub container_ref: ContainerRef,
    /// Owning company.
    pub company_id: String,
}

/// Synchronous container lookup.
pub trait ContainerRegistry: Send + Sync + std::fmt::Debug {
    /// Resolve a container, returning `None` if it is unknown.
    ///
    /// # Errors
    ///
    /// Returns an error only if the lookup itself fails.
    fn lookup(&self, container_ref: &ContainerRef) -> Result<Option<ContainerInfo>>;
}

/// An in-memory registry.
#[derive(Debug, Default)]
pub struct StaticRegistry {
    containers: RwLock<HashMap<ContainerRef, ContainerInfo>>,
}

impl StaticRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding `refs`, all owned by `company_id`.
    #[must_use]
    pub fn with_containers<I, S>(company_id: &str, refs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let registry = Self::new();
        for r in refs {
            registry.register(ContainerRef::new(r), company_id);
        }
        registry
    }

    /// Add or replace a container.
    pub fn register(&self, container_ref: ContainerRef, company_id: &str) {
        let info = ContainerInfo {
            container_ref: container_ref.clone(),
            company_id: company_id.to_string(),
        };
        self.containers.write().insert(container_ref, info);
    }
}

impl ContainerRegistry for StaticRegistry {
    fn lookup(&self, container_ref: &ContainerRef) -> Result<Option<ContainerInfo>> {
        Ok(self.containers.read().get(container_ref).cloned())
    }
}
