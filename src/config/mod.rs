//! # Config Module
//!
//! The JSON file that declares pipelines and their stages.
//!
//! ## Example
//! ```json
//! {
//!   "pipelines": [
//!     {
//!       "name": "main",
//!       "quarantine": "quarantines/main",
//!       "stages": [
//!         { "type": "DirectoryImportService", "id": "import", "root": "roots/import",
//!           "import_dir": "incoming" },
//!         { "type": "ScriptFilter", "root": "roots/filter", "script": "scripts/filter.script" },
//!         { "type": "DirectoryStorageService", "root": "roots/store", "store": "archive" },
//!         { "type": "DirectoryExportService", "root": "roots/export", "destination": "outgoing",
//!           "interval": 2000, "accept_xml_objects": false }
//!       ]
//!     }
//!   ]
//! }
//! ```
//!
//! Relative paths resolve against the directory holding the file.
//! Anything a stage needs beyond the common keys is a stage parameter,
//! read by the stage's factory.

use crate::core::stage::AcceptFlags;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

/// The whole configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Configuration {
    #[serde(default)]
    pub pipelines: Vec<PipelineConfig>,
    /// Directory relative paths resolve against
    #[serde(skip)]
    base_dir: PathBuf,
}

/// One pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub name: String,
    /// Default quarantine for stages that do not name their own
    #[serde(default)]
    pub quarantine: Option<PathBuf>,
    #[serde(default)]
    pub stages: Vec<StageConfig>,
}

/// One stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    /// Registered stage type, e.g. `DirectoryImportService`
    #[serde(rename = "type")]
    pub stage_type: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    pub root: PathBuf,
    #[serde(default)]
    pub quarantine: Option<PathBuf>,
    #[serde(default = "accept_default")]
    pub accept_dicom_objects: bool,
    #[serde(default = "accept_default")]
    pub accept_xml_objects: bool,
    #[serde(default = "accept_default")]
    pub accept_zip_objects: bool,
    #[serde(default = "accept_default")]
    pub accept_file_objects: bool,
    /// Stage-specific parameters
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

fn accept_default() -> bool {
    true
}

impl Configuration {
    /// Read and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Self::parse(&text, base_dir).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    /// Parse configuration text; relative paths resolve against `base_dir`.
    pub fn parse(text: &str, base_dir: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let mut config: Configuration =
            serde_json::from_str(text).map_err(|source| ConfigError::Parse {
                path: PathBuf::new(),
                source,
            })?;
        config.base_dir = base_dir.into();
        config.validate()?;
        Ok(config)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Resolve a configured path against the configuration directory.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    /// Id of the stage at `index` in `pipeline`
    pub fn stage_id(pipeline: &PipelineConfig, index: usize) -> String {
        pipeline.stages[index]
            .id
            .clone()
            .unwrap_or_else(|| format!("{}/{}", pipeline.name, index))
    }

    /// The pipeline, index and configuration of the stage with this id
    pub fn find_stage(&self, id: &str) -> Option<(&PipelineConfig, usize, &StageConfig)> {
        self.pipelines.iter().find_map(|pipeline| {
            (0..pipeline.stages.len())
                .find(|&index| Self::stage_id(pipeline, index) == id)
                .map(|index| (pipeline, index, &pipeline.stages[index]))
        })
    }

    /// Queue directory of a stage, whether or not it has one
    pub fn queue_dir(&self, stage: &StageConfig) -> PathBuf {
        self.resolve(&stage.root).join("queue")
    }

    /// Resolved quarantine directory of a stage, falling back to its
    /// pipeline's
    pub fn quarantine_dir(&self, pipeline: &PipelineConfig, stage: &StageConfig) -> Option<PathBuf> {
        stage
            .quarantine
            .as_ref()
            .or(pipeline.quarantine.as_ref())
            .map(|dir| self.resolve(dir))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut ids = HashSet::new();
        for pipeline in &self.pipelines {
            for index in 0..pipeline.stages.len() {
                let id = Self::stage_id(pipeline, index);
                if !ids.insert(id.clone()) {
                    return Err(ConfigError::DuplicateStageId { id });
                }
            }
        }
        Ok(())
    }
}

impl StageConfig {
    pub fn accept(&self) -> AcceptFlags {
        AcceptFlags {
            dicom: self.accept_dicom_objects,
            xml: self.accept_xml_objects,
            zip: self.accept_zip_objects,
            file: self.accept_file_objects,
        }
    }

    /// A string parameter
    pub fn str_param(&self, key: &str) -> Result<Option<&str>, ConfigError> {
        match self.params.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(value)) => Ok(Some(value)),
            Some(_) => Err(self.invalid(key, "must be a string")),
        }
    }

    /// A non-negative integer parameter; numeric strings are accepted
    pub fn u64_param(&self, key: &str) -> Result<Option<u64>, ConfigError> {
        match self.params.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n
                .as_u64()
                .map(Some)
                .ok_or_else(|| self.invalid(key, "must be a non-negative integer")),
            Some(Value::String(s)) => s
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| self.invalid(key, "must be a non-negative integer")),
            Some(_) => Err(self.invalid(key, "must be a non-negative integer")),
        }
    }

    /// A boolean parameter; "yes"/"no" strings are accepted
    pub fn bool_param(&self, key: &str) -> Result<Option<bool>, ConfigError> {
        match self.params.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "yes" | "true" => Ok(Some(true)),
                "no" | "false" => Ok(Some(false)),
                _ => Err(self.invalid(key, "must be true or false")),
            },
            Some(_) => Err(self.invalid(key, "must be true or false")),
        }
    }

    /// A path parameter, not yet resolved
    pub fn path_param(&self, key: &str) -> Result<Option<PathBuf>, ConfigError> {
        Ok(self.str_param(key)?.map(PathBuf::from))
    }

    /// A path parameter that must be present
    pub fn required_path(&self, key: &str) -> Result<PathBuf, ConfigError> {
        self.path_param(key)?
            .ok_or_else(|| self.invalid(key, "is required"))
    }

    fn invalid(&self, key: &str, reason: &str) -> ConfigError {
        ConfigError::InvalidParameter {
            stage: self.name.clone().unwrap_or_else(|| self.stage_type.clone()),
            parameter: key.to_string(),
            reason: reason.to_string(),
        }
    }
}
