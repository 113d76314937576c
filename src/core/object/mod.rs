//! # Object Module
//!
//! The value carried through a pipeline: a file on disk plus its type.
//!
//! ## Types
//! - `Dicom` - Part-10 files (`DICM` at offset 128)
//! - `Xml` - documents starting with `<?xml` or an element
//! - `Zip` - archives starting with `PK\x03\x04`
//! - `File` - anything else
//!
//! The type is sniffed from content when the object is opened, never from
//! the file name. Every operation that moves the file updates `file()`.

mod dicom;

pub use dicom::{is_dicom, read_header, DicomHeader};

#[cfg(test)]
pub(crate) use dicom::sample as sample_dicom;

use crate::core::queue::{embedded_name_of, move_file};
use crate::error::ObjectError;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use xxhash_rust::xxh3::Xxh3;

/// How much of a file is read to sniff its type and header
const SNIFF_LIMIT: u64 = 1024 * 1024;

/// Object types used for stage acceptance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    File,
    Dicom,
    Xml,
    Zip,
}

impl ObjectKind {
    /// Detect the type from the first bytes of a file
    pub fn sniff(bytes: &[u8]) -> Self {
        if is_dicom(bytes) {
            ObjectKind::Dicom
        } else if bytes.starts_with(b"PK\x03\x04") {
            ObjectKind::Zip
        } else if looks_like_xml(bytes) {
            ObjectKind::Xml
        } else {
            ObjectKind::File
        }
    }

    /// Extension every object of this type carries in a pipeline
    pub fn standard_extension(&self) -> Option<&'static str> {
        match self {
            ObjectKind::Dicom => Some(".dcm"),
            ObjectKind::Xml => Some(".xml"),
            ObjectKind::Zip => Some(".zip"),
            ObjectKind::File => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::File => "file",
            ObjectKind::Dicom => "dicom",
            ObjectKind::Xml => "xml",
            ObjectKind::Zip => "zip",
        }
    }
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

fn looks_like_xml(bytes: &[u8]) -> bool {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let rest = &bytes[start..];

    rest.starts_with(b"<?xml")
        || (rest.len() > 1
            && rest[0] == b'<'
            && (rest[1].is_ascii_alphabetic() || rest[1] == b'_'))
}

/// A file travelling through a pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileObject {
    path: PathBuf,
    kind: ObjectKind,
    uid: String,
    size: u64,
    dicom: Option<DicomHeader>,
}

impl FileObject {
    /// Open a file and sniff its type.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ObjectError> {
        let path = path.into();
        let metadata = fs::metadata(&path).map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                ObjectError::NotFound { path: path.clone() }
            } else {
                ObjectError::Read {
                    path: path.clone(),
                    source,
                }
            }
        })?;
        if !metadata.is_file() {
            return Err(ObjectError::NotFound { path });
        }

        let read_error = |source| ObjectError::Read {
            path: path.clone(),
            source,
        };

        let mut prefix = Vec::new();
        File::open(&path)
            .and_then(|file| file.take(SNIFF_LIMIT).read_to_end(&mut prefix))
            .map_err(read_error)?;

        let kind = ObjectKind::sniff(&prefix);
        let dicom = match kind {
            ObjectKind::Dicom => read_header(&prefix),
            _ => None,
        };

        let uid = match dicom.as_ref().and_then(|h| h.sop_instance_uid.clone()) {
            Some(uid) => uid,
            None => content_digest(&path).map_err(read_error)?,
        };

        Ok(Self {
            path,
            kind,
            uid,
            size: metadata.len(),
            dicom,
        })
    }

    /// Current location of the underlying file
    pub fn file(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub fn is_dicom(&self) -> bool {
        self.kind == ObjectKind::Dicom
    }

    /// File name of the current location
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Name embedded in brackets, or the full file name
    pub fn embedded_name(&self) -> String {
        embedded_name_of(&self.path)
    }

    /// Size in bytes when the object was opened
    pub fn size(&self) -> u64 {
        self.size
    }

    /// SOP Instance UID for DICOM objects, a content digest otherwise
    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn dicom_header(&self) -> Option<&DicomHeader> {
        self.dicom.as_ref()
    }

    pub fn sop_class_uid(&self) -> Option<&str> {
        self.dicom.as_ref()?.sop_class_uid.as_deref()
    }

    pub fn patient_id(&self) -> Option<&str> {
        self.dicom.as_ref()?.patient_id.as_deref()
    }

    pub fn patient_name(&self) -> Option<&str> {
        self.dicom.as_ref()?.patient_name.as_deref()
    }

    pub fn study_uid(&self) -> Option<&str> {
        self.dicom.as_ref()?.study_instance_uid.as_deref()
    }

    pub fn series_uid(&self) -> Option<&str> {
        self.dicom.as_ref()?.series_instance_uid.as_deref()
    }

    /// Extension the object should carry: the type's standard extension,
    /// or the current extension for generic files
    pub fn standard_extension(&self) -> String {
        match self.kind.standard_extension() {
            Some(ext) => ext.to_string(),
            None => self
                .path
                .extension()
                .map(|ext| format!(".{}", ext.to_string_lossy()))
                .unwrap_or_default(),
        }
    }

    /// Rename the file in place so it ends with its standard extension.
    pub fn set_standard_extension(&mut self) -> Result<(), ObjectError> {
        let extension = self.standard_extension();
        let name = self.name();
        if extension.is_empty() || name.ends_with(&extension) {
            return Ok(());
        }

        self.rename(&format!("{}{}", name, extension))
    }

    /// Move the file to `target`; `file()` follows it.
    pub fn move_to(&mut self, target: &Path) -> Result<(), ObjectError> {
        move_file(&self.path, target).map_err(|source| ObjectError::Move {
            from: self.path.clone(),
            to: target.to_path_buf(),
            source,
        })?;
        self.path = target.to_path_buf();
        Ok(())
    }

    /// Rename the file within its directory.
    pub fn rename(&mut self, name: &str) -> Result<(), ObjectError> {
        let target = self.path.with_file_name(name);
        fs::rename(&self.path, &target).map_err(|source| ObjectError::Move {
            from: self.path.clone(),
            to: target.clone(),
            source,
        })?;
        self.path = target;
        Ok(())
    }

    /// Copy the file to `target`, leaving this object where it is.
    pub fn copy_to(&self, target: &Path) -> Result<PathBuf, ObjectError> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|source| ObjectError::Copy {
                from: self.path.clone(),
                to: target.to_path_buf(),
                source,
            })?;
        }
        fs::copy(&self.path, target).map_err(|source| ObjectError::Copy {
            from: self.path.clone(),
            to: target.to_path_buf(),
            source,
        })?;
        Ok(target.to_path_buf())
    }

    /// Record that the underlying file now lives at `path`.
    pub fn set_file(&mut self, path: impl Into<PathBuf>) {
        self.path = path.into();
    }

    /// Delete the underlying file; an already missing file is not an error.
    pub fn delete(self) -> Result<(), ObjectError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ObjectError::Read {
                path: self.path,
                source,
            }),
        }
    }
}

fn content_digest(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Xxh3::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:032x}", hasher.digest128()))
}
