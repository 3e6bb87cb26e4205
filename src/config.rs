//! Process-level defaults for virtual dataset access.
//!
//! Configuration is resolved in order:
//! 1. built-in defaults
//! 2. an optional JSON document
//! 3. environment variables (`HDF5_VDS_PREFIX`, `VDS_VIEW`, `VDS_PRINTF_GAP`)

use crate::error::{Result, VdsError};
use crate::props::{DatasetAccessProps, FileAccessProps, LibVersion};
use crate::types::ViewPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, warn};

pub const ENV_VDS_PREFIX: &str = "HDF5_VDS_PREFIX";
pub const ENV_VDS_VIEW: &str = "VDS_VIEW";
pub const ENV_VDS_PRINTF_GAP: &str = "VDS_PRINTF_GAP";

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VdsConfig {
    pub view: ViewPolicy,
    pub printf_gap: u64,
    pub vds_prefix: Option<String>,
    /// Lower format bound for newly created files.
    pub low_bound: LibVersion,
}

impl VdsConfig {
    /// Defaults with environment overrides applied.
    pub fn load() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Read a JSON document, then apply environment overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading VDS config from {:?}", path);
        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::from_json(&contents)?;
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from `lookup`. Unparseable values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(prefix) = lookup(ENV_VDS_PREFIX) {
            self.vds_prefix = Some(prefix);
        }
        if let Some(view) = lookup(ENV_VDS_VIEW) {
            match ViewPolicy::parse(&view) {
                Ok(v) => self.view = v,
                Err(e) => warn!(value = %view, "ignoring {}: {}", ENV_VDS_VIEW, e),
            }
        }
        if let Some(gap) = lookup(ENV_VDS_PRINTF_GAP) {
            match gap.trim().parse() {
                Ok(n) => self.printf_gap = n,
                Err(_) => warn!(value = %gap, "ignoring {}: not an integer", ENV_VDS_PRINTF_GAP),
            }
        }
    }

    pub fn dataset_access(&self) -> DatasetAccessProps {
        DatasetAccessProps {
            view: self.view,
            printf_gap: self.printf_gap,
            vds_prefix: self.vds_prefix.clone(),
        }
    }

    pub fn file_access(&self) -> FileAccessProps {
        FileAccessProps::new().with_low_bound(self.low_bound)
    }

    pub fn validate(&self) -> Result<()> {
        if self.view == ViewPolicy::FirstMissing && self.printf_gap != 0 {
            warn!(
                printf_gap = self.printf_gap,
                "printf gap is ignored under the first-missing view"
            );
        }
        if let Some(prefix) = &self.vds_prefix {
            if prefix.contains('\0') {
                return Err(VdsError::Configuration(
                    "VDS prefix contains a NUL byte".to_string(),
                ));
            }
        }
        Ok(())
    }
}
