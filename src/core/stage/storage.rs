//! Store objects in a directory tree organised by patient and study.

use super::{PipelineStage, StageCore, StorageService};
use crate::core::object::{FileObject, ObjectKind};
use crate::error::StageError;
use crate::events::{Event, ObjectEvent};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const UNKNOWN: &str = "unknown";

/// Copies each accepted object into
/// `store/<kind>/<patient id>/<study uid>/<uid><extension>`.
///
/// Non-DICOM objects have no patient or study and land in
/// `store/<kind>/<original name>`. A copy that fails sends the object to
/// quarantine and ends its trip through the pipeline.
pub struct DirectoryStorageService {
    core: StageCore,
    store: PathBuf,
}

impl DirectoryStorageService {
    pub fn new(core: StageCore, store: impl Into<PathBuf>) -> Self {
        Self {
            core,
            store: store.into(),
        }
    }

    pub fn store_dir(&self) -> &Path {
        &self.store
    }

    /// Where an object is (or would be) stored
    pub fn path_for(&self, object: &FileObject) -> PathBuf {
        let kind_dir = self.store.join(object.kind().as_str());
        match object.kind() {
            ObjectKind::Dicom => kind_dir
                .join(component(object.patient_id()))
                .join(component(object.study_uid()))
                .join(format!(
                    "{}{}",
                    component(Some(object.uid())),
                    object.standard_extension()
                )),
            _ => kind_dir.join(component(Some(&object.embedded_name()))),
        }
    }
}

/// A single safe path component; separators and dot-only names are
/// replaced.
fn component(value: Option<&str>) -> String {
    let value = value.map(str::trim).unwrap_or_default();
    let cleaned: String = value
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '\0' => '_',
            c => c,
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        UNKNOWN.to_string()
    } else {
        cleaned
    }
}

impl PipelineStage for DirectoryStorageService {
    fn core(&self) -> &StageCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StageCore {
        &mut self.core
    }
}

impl StorageService for DirectoryStorageService {
    fn store(&mut self, object: FileObject) -> Result<Option<FileObject>, StageError> {
        if !self.core.accepts(&object) {
            return Ok(Some(object));
        }

        self.core.monitor().file_received();
        let target = self.path_for(&object);
        match object.copy_to(&target) {
            Ok(stored) => {
                debug!(stage = %self.core.name(), path = %stored.display(), "Object stored");
                self.core.monitor().file_processed();
                self.core.events().send(Event::Object(ObjectEvent::Stored {
                    stage: self.core.name().to_string(),
                    path: stored,
                }));
                Ok(Some(object))
            }
            Err(e) => {
                warn!(stage = %self.core.name(), error = %e, "Store failed");
                self.core.reject(object)?;
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::object::sample_dicom;
    use crate::core::stage::{StageKind, StageSettings};
    use std::fs;
    use tempfile::TempDir;

    fn storage(dir: &TempDir) -> DirectoryStorageService {
        let core = StageCore::new(
            StageSettings::new("store", dir.path().join("stage")),
            StageKind::Storage,
        )
        .unwrap();
        DirectoryStorageService::new(core, dir.path().join("store"))
    }

    fn object(dir: &TempDir, name: &str, content: &[u8]) -> FileObject {
        let path = dir.path().join(name);
        fs::write(&path, content).unwrap();
        FileObject::open(path).unwrap()
    }

    #[test]
    fn dicom_objects_are_stored_by_patient_and_study() {
        let dir = TempDir::new().unwrap();
        let mut storage = storage(&dir);

        let object = object(&dir, "scan", &sample_dicom("1.2.3.9", "PAT-1", "1.2.3.4"));
        let passed = storage.store(object).unwrap().unwrap();

        let stored = dir.path().join("store/dicom/PAT-1/1.2.3.4/1.2.3.9.dcm");
        assert!(stored.is_file());
        assert!(passed.file().exists());
        assert_eq!(storage.status().processed, 1);
    }

    #[test]
    fn other_objects_keep_their_name() {
        let dir = TempDir::new().unwrap();
        let mut storage = storage(&dir);

        storage
            .store(object(&dir, "QF-1[report.xml]", b"<report/>"))
            .unwrap();

        assert!(dir.path().join("store/xml/report.xml").is_file());
    }

    #[test]
    fn unsafe_components_are_replaced() {
        assert_eq!(component(Some("../etc")), ".._etc");
        assert_eq!(component(Some("..")), "unknown");
        assert_eq!(component(None), "unknown");
        assert_eq!(component(Some("A/B")), "A_B");
    }
}
