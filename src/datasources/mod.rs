//! Datasource implementations for various cloud providers
//!
//! Datasources provide instance metadata and user data from cloud providers.
//! The [`DatasourceRegistry`] knows every compiled-in datasource together with
//! the capabilities it needs; resolution filters by what the current boot
//! stage can offer and probes the survivors in configured order.

pub mod cache;
pub mod configdrive;
pub mod ec2;
pub mod mock;
pub mod nocloud;

use crate::{BootContext, CloudInitError, InstanceRecord};
use async_trait::async_trait;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::str::FromStr;
use tracing::{debug, info, warn};

bitflags! {
    /// What a boot stage can offer a datasource
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Capability: u8 {
        /// Local disks and mounted volumes are readable
        const FILESYSTEM = 0b0000_0001;
        /// The network is configured
        const NETWORK = 0b0000_0010;
    }
}

/// Compiled-in datasource variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DatasourceKind {
    NoCloud,
    ConfigDrive,
    Ec2,
}

impl DatasourceKind {
    /// Name used in `datasource_list` and on disk
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoCloud => "NoCloud",
            Self::ConfigDrive => "ConfigDrive",
            Self::Ec2 => "Ec2",
        }
    }
}

impl std::fmt::Display for DatasourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatasourceKind {
    type Err = CloudInitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "nocloud" | "nocloudnet" | "nocloud-net" => Ok(Self::NoCloud),
            "configdrive" | "config-drive" | "openstack" => Ok(Self::ConfigDrive),
            "ec2" | "aws" => Ok(Self::Ec2),
            other => Err(CloudInitError::Datasource(format!(
                "Unknown datasource: {other}"
            ))),
        }
    }
}

/// What a successful probe found
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeData {
    pub instance_id: String,
    pub metadata: Map<String, Value>,
    pub user_data: Vec<u8>,
    pub vendor_data: Option<Vec<u8>>,
}

/// Trait for cloud metadata datasources
///
/// Each cloud provider implements this trait to provide instance metadata
/// and user data in a consistent way.
#[async_trait]
pub trait Datasource: Send + Sync {
    /// Which variant this is
    fn kind(&self) -> DatasourceKind;

    /// Look for this platform
    ///
    /// `Ok(None)` means "not this platform". Errors are treated the same way
    /// by the resolver after being logged.
    async fn probe(&self) -> Result<Option<ProbeData>, CloudInitError>;
}

/// Builds a datasource from the boot context
pub type DatasourceFactory = Box<dyn Fn(&BootContext) -> Box<dyn Datasource> + Send + Sync>;

/// One registered datasource
pub struct RegistryEntry {
    pub kind: DatasourceKind,
    pub requires: Capability,
    factory: DatasourceFactory,
}

impl std::fmt::Debug for RegistryEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryEntry")
            .field("kind", &self.kind)
            .field("requires", &self.requires)
            .finish_non_exhaustive()
    }
}

/// All datasources this build knows about
#[derive(Debug, Default)]
pub struct DatasourceRegistry {
    entries: Vec<RegistryEntry>,
}

impl DatasourceRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every compiled-in datasource
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(DatasourceKind::NoCloud, Capability::FILESYSTEM, |ctx| {
            Box::new(nocloud::NoCloud::from_context(ctx))
        });
        registry.register(DatasourceKind::ConfigDrive, Capability::FILESYSTEM, |ctx| {
            Box::new(configdrive::ConfigDrive::from_context(ctx))
        });
        registry.register(
            DatasourceKind::Ec2,
            Capability::FILESYSTEM | Capability::NETWORK,
            |ctx| Box::new(ec2::Ec2::from_context(ctx)),
        );
        registry
    }

    /// Register (or replace) the factory for `kind`
    pub fn register<F>(&mut self, kind: DatasourceKind, requires: Capability, factory: F)
    where
        F: Fn(&BootContext) -> Box<dyn Datasource> + Send + Sync + 'static,
    {
        self.entries.retain(|e| e.kind != kind);
        self.entries.push(RegistryEntry {
            kind,
            requires,
            factory: Box::new(factory),
        });
    }

    /// Entries named in `names` whose requirements fit within `capability`,
    /// in the order of `names`
    pub fn candidates(&self, names: &[String], capability: Capability) -> Vec<&RegistryEntry> {
        let mut found: Vec<&RegistryEntry> = Vec::new();
        for name in names {
            let kind = match name.parse::<DatasourceKind>() {
                Ok(kind) => kind,
                Err(_) => {
                    warn!("Skipping unknown datasource {:?}", name);
                    continue;
                }
            };
            let Some(entry) = self.entries.iter().find(|e| e.kind == kind) else {
                warn!("Datasource {} is not registered", kind);
                continue;
            };
            if !capability.contains(entry.requires) {
                debug!(
                    "Datasource {} needs {:?}, stage offers {:?}",
                    kind, entry.requires, capability
                );
                continue;
            }
            if !found.iter().any(|e| e.kind == kind) {
                found.push(entry);
            }
        }
        found
    }

    /// Probe candidates in order; the first success wins
    ///
    /// Returns [`CloudInitError::NoDatasource`] when nothing matched.
    pub async fn resolve(
        &self,
        ctx: &BootContext,
        capability: Capability,
    ) -> Result<InstanceRecord, CloudInitError> {
        let candidates = self.candidates(&ctx.config.datasource_list, capability);
        info!(
            "Searching for datasource among {:?}",
            candidates.iter().map(|e| e.kind.as_str()).collect::<Vec<_>>()
        );

        for entry in candidates {
            let datasource = (entry.factory)(ctx);
            match datasource.probe().await {
                Ok(Some(data)) => {
                    info!(
                        "Detected datasource: {} (instance {})",
                        entry.kind, data.instance_id
                    );
                    return Ok(into_record(entry.kind, data));
                }
                Ok(None) => debug!("Datasource {} not applicable", entry.kind),
                Err(e) => warn!("Datasource {} probe failed: {}", entry.kind, e),
            }
        }

        Err(CloudInitError::NoDatasource)
    }
}

fn into_record(kind: DatasourceKind, data: ProbeData) -> InstanceRecord {
    let mut record = InstanceRecord::new(kind, data.instance_id);
    record.metadata = data.metadata;
    record.user_data = data.user_data;
    record.vendor_data = data.vendor_data;
    record
}
