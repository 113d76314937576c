//! Export by copying into a destination directory.

use super::{ExportOptions, ExportStage, ExportStatus, Exporter, StageCore};
use crate::core::queue::embedded_name_of;
use crate::error::StageError;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Copies each file into `destination` under its original name.
///
/// The copy is written under a hidden name and renamed into place, so a
/// watcher on the destination never sees a partial file. A missing or
/// unwritable destination means "retry"; an unreadable source means
/// "fail".
#[derive(Debug, Clone)]
pub struct DirectoryExporter {
    destination: PathBuf,
}

impl DirectoryExporter {
    pub fn new(destination: impl Into<PathBuf>) -> Self {
        Self {
            destination: destination.into(),
        }
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }
}

impl Exporter for DirectoryExporter {
    fn connect(&mut self) -> ExportStatus {
        match fs::create_dir_all(&self.destination) {
            Ok(()) => ExportStatus::Ok,
            Err(e) => {
                debug!(destination = %self.destination.display(), error = %e, "Export destination unavailable");
                ExportStatus::Retry
            }
        }
    }

    fn export(&mut self, file: &Path) -> ExportStatus {
        if !file.is_file() {
            warn!(file = %file.display(), "Export source is missing");
            return ExportStatus::Fail;
        }
        if !self.destination.is_dir() {
            return ExportStatus::Retry;
        }

        let name = embedded_name_of(file);
        let target = self.destination.join(&name);
        let partial = self.destination.join(format!(".{}.partial", name));

        let copied = fs::copy(file, &partial).and_then(|_| fs::rename(&partial, &target));
        match copied {
            Ok(()) => ExportStatus::Ok,
            Err(e) => {
                let _ = fs::remove_file(&partial);
                if e.kind() == io::ErrorKind::NotFound && !file.exists() {
                    ExportStatus::Fail
                } else {
                    warn!(target = %target.display(), error = %e, "Export copy failed");
                    ExportStatus::Retry
                }
            }
        }
    }
}

/// Export stage that writes into a directory
pub type DirectoryExportService = ExportStage<DirectoryExporter>;

impl ExportStage<DirectoryExporter> {
    pub fn to_directory(
        core: StageCore,
        options: ExportOptions,
        destination: impl Into<PathBuf>,
    ) -> Result<Self, StageError> {
        ExportStage::new(core, options, DirectoryExporter::new(destination))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn copies_under_the_embedded_name() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("QF-12ab[report.xml]");
        fs::write(&source, b"<report/>").unwrap();
        let mut exporter = DirectoryExporter::new(dir.path().join("out"));

        assert_eq!(exporter.connect(), ExportStatus::Ok);
        assert_eq!(exporter.export(&source), ExportStatus::Ok);

        let exported = dir.path().join("out").join("report.xml");
        assert_eq!(fs::read(exported).unwrap(), b"<report/>");
        assert!(source.exists());
        assert_eq!(fs::read_dir(dir.path().join("out")).unwrap().count(), 1);
    }

    #[test]
    fn missing_source_fails() {
        let dir = TempDir::new().unwrap();
        let mut exporter = DirectoryExporter::new(dir.path());

        assert_eq!(
            exporter.export(&dir.path().join("gone.dcm")),
            ExportStatus::Fail
        );
    }

    #[test]
    fn unavailable_destination_retries() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"not a directory").unwrap();
        let source = dir.path().join("a.txt");
        fs::write(&source, b"x").unwrap();
        let mut exporter = DirectoryExporter::new(blocker.join("out"));

        assert_eq!(exporter.connect(), ExportStatus::Retry);
        assert_eq!(exporter.export(&source), ExportStatus::Retry);
    }
}
