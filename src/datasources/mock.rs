//! Mock datasource for testing
//!
//! Provides a configurable datasource that counts its probes, so tests can
//! check which candidates the resolver actually touched.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{Datasource, DatasourceKind, ProbeData};
use crate::CloudInitError;

/// Mock datasource for testing
///
/// # Example
/// ```
/// use cloud_init_rs::datasources::mock::MockDatasource;
/// use cloud_init_rs::DatasourceKind;
///
/// let mock = MockDatasource::new(DatasourceKind::NoCloud)
///     .with_instance_id("test-123")
///     .with_user_data("#cloud-config\nhostname: mock\n");
/// ```
#[derive(Debug, Clone)]
pub struct MockDatasource {
    kind: DatasourceKind,
    outcome: Outcome,
    data: ProbeData,
    probes: ProbeCounter,
}

#[derive(Debug, Clone)]
enum Outcome {
    Found,
    NotApplicable,
    Error(String),
}

/// Shared count of `probe` calls
#[derive(Debug, Clone, Default)]
pub struct ProbeCounter(Arc<AtomicUsize>);

impl ProbeCounter {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

impl MockDatasource {
    /// A datasource that matches with instance ID `iid-mock`
    pub fn new(kind: DatasourceKind) -> Self {
        Self {
            kind,
            outcome: Outcome::Found,
            data: ProbeData {
                instance_id: "iid-mock".to_string(),
                ..Default::default()
            },
            probes: ProbeCounter::default(),
        }
    }

    /// Set the instance ID to report
    pub fn with_instance_id(mut self, id: &str) -> Self {
        self.data.instance_id = id.to_string();
        self
    }

    /// Set the raw user-data to return
    pub fn with_user_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data.user_data = data.into();
        self
    }

    /// Set the raw vendor-data to return
    pub fn with_vendor_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data.vendor_data = Some(data.into());
        self
    }

    /// Add a metadata entry
    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Report "not this platform"
    pub fn not_applicable(mut self) -> Self {
        self.outcome = Outcome::NotApplicable;
        self
    }

    /// Fail every probe with `error`
    pub fn failing(mut self, error: &str) -> Self {
        self.outcome = Outcome::Error(error.to_string());
        self
    }

    /// Handle on the probe count, shared with every clone
    pub fn probe_counter(&self) -> ProbeCounter {
        self.probes.clone()
    }
}

#[async_trait]
impl Datasource for MockDatasource {
    fn kind(&self) -> DatasourceKind {
        self.kind
    }

    async fn probe(&self) -> Result<Option<ProbeData>, CloudInitError> {
        self.probes.0.fetch_add(1, Ordering::SeqCst);
        match &self.outcome {
            Outcome::Found => Ok(Some(self.data.clone())),
            Outcome::NotApplicable => Ok(None),
            Outcome::Error(e) => Err(CloudInitError::Datasource(e.clone())),
        }
    }
}
