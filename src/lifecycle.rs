//! Holding and refreshing the files behind open sources.

use crate::error::Result;
use crate::layout::VirtualLayout;
use crate::storage::ContainerFile;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Files kept from closing. Each hold is released when this is dropped.
#[derive(Debug, Default)]
pub struct HeldFiles {
    files: Vec<Arc<ContainerFile>>,
}

impl HeldFiles {
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Release the holds now.
    pub fn release(self) {}
}

impl Drop for HeldFiles {
    fn drop(&mut self) {
        for file in self.files.drain(..) {
            file.release();
        }
    }
}

impl VirtualLayout {
    /// Hold the file of every open source, once per file.
    pub fn hold_source_files(&self) -> HeldFiles {
        let mut seen: Vec<Uuid> = Vec::new();
        let mut held = HeldFiles::default();
        for src in self.mappings.iter().flat_map(|m| m.sources_ref()) {
            let Some(dset) = src.dset.as_ref() else {
                continue;
            };
            let file = dset.file();
            if seen.contains(&file.id()) {
                continue;
            }
            seen.push(file.id());
            file.hold();
            held.files.push(file.clone());
        }
        held
    }

    /// Refresh every open source dataset and bind its handle to the fresh
    /// object. Source files are held for the duration so none of them
    /// closes halfway through. Unlimited extents must be re-resolved
    /// afterwards.
    pub fn refresh_sources(&mut self) -> Result<()> {
        let held = self.hold_source_files();
        let mut refreshed = 0usize;
        for entry in &mut self.mappings {
            for src in entry.sources_mut() {
                if let Some(dset) = src.dset.as_mut() {
                    dset.refresh()?;
                    refreshed += 1;
                }
            }
        }
        debug!(sources = refreshed, files = held.len(), "refreshed source datasets");
        held.release();
        self.initialized = false;
        Ok(())
    }
}
