//! # Filter Module
//!
//! Small predicate scripts that decide whether an object passes a stage.
//!
//! ## Syntax
//! ```text
//! # every condition in a group must hold
//! kind == dicom
//! patient_id != ""
//! name ~ "^CT.*\.dcm$"
//! or
//! # ...or every condition in this group
//! kind == xml
//! size < 1048576
//! ```
//!
//! Fields: `kind`, `name`, `uid`, `sop_class_uid`, `patient_id`,
//! `patient_name`, `study_uid`, `series_uid`, `size`.
//! Operators: `==`, `!=`, `~` (regex), `!~`, `<`, `>` (size only).
//! An empty script matches everything.

use crate::core::object::FileObject;
use crate::error::FilterError;
use regex::Regex;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Object attribute a condition reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Kind,
    Name,
    Uid,
    SopClassUid,
    PatientId,
    PatientName,
    StudyUid,
    SeriesUid,
    Size,
}

impl Field {
    fn parse(token: &str) -> Option<Self> {
        match token {
            "kind" => Some(Field::Kind),
            "name" => Some(Field::Name),
            "uid" => Some(Field::Uid),
            "sop_class_uid" => Some(Field::SopClassUid),
            "patient_id" => Some(Field::PatientId),
            "patient_name" => Some(Field::PatientName),
            "study_uid" => Some(Field::StudyUid),
            "series_uid" => Some(Field::SeriesUid),
            "size" => Some(Field::Size),
            _ => None,
        }
    }

    fn read(&self, object: &FileObject) -> String {
        match self {
            Field::Kind => object.kind().as_str().to_string(),
            Field::Name => object.embedded_name(),
            Field::Uid => object.uid().to_string(),
            Field::SopClassUid => object.sop_class_uid().unwrap_or_default().to_string(),
            Field::PatientId => object.patient_id().unwrap_or_default().to_string(),
            Field::PatientName => object.patient_name().unwrap_or_default().to_string(),
            Field::StudyUid => object.study_uid().unwrap_or_default().to_string(),
            Field::SeriesUid => object.series_uid().unwrap_or_default().to_string(),
            Field::Size => object.size().to_string(),
        }
    }
}

#[derive(Debug, Clone)]
enum Condition {
    Literal(bool),
    Equals { field: Field, value: String, negate: bool },
    Matches { field: Field, pattern: Regex, negate: bool },
    SizeBelow(u64),
    SizeAbove(u64),
}

impl Condition {
    fn holds(&self, object: &FileObject) -> bool {
        match self {
            Condition::Literal(value) => *value,
            Condition::Equals {
                field,
                value,
                negate,
            } => (field.read(object) == *value) != *negate,
            Condition::Matches {
                field,
                pattern,
                negate,
            } => pattern.is_match(&field.read(object)) != *negate,
            Condition::SizeBelow(limit) => object.size() < *limit,
            Condition::SizeAbove(limit) => object.size() > *limit,
        }
    }
}

/// A parsed filter script
#[derive(Debug, Clone, Default)]
pub struct ObjectFilter {
    groups: Vec<Vec<Condition>>,
    source: Option<PathBuf>,
}

impl ObjectFilter {
    /// Parse a script from text.
    pub fn parse(script: &str) -> Result<Self, FilterError> {
        let mut groups = vec![Vec::new()];

        for (index, raw) in script.lines().enumerate() {
            let line_no = index + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            match line {
                "or" => groups.push(Vec::new()),
                "true" => push(&mut groups, Condition::Literal(true)),
                "false" => push(&mut groups, Condition::Literal(false)),
                _ => push(&mut groups, parse_condition(line, line_no)?),
            }
        }

        groups.retain(|group| !group.is_empty());
        Ok(Self {
            groups,
            source: None,
        })
    }

    /// Load a script file; a missing file means "no filter".
    pub fn load(path: &Path) -> Result<Option<Self>, FilterError> {
        let script = match fs::read_to_string(path) {
            Ok(script) => script,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(FilterError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let mut filter = Self::parse(&script)?;
        filter.source = Some(path.to_path_buf());
        Ok(Some(filter))
    }

    /// Script file this filter was loaded from
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Whether the object satisfies any condition group
    pub fn matches(&self, object: &FileObject) -> bool {
        self.groups.is_empty()
            || self
                .groups
                .iter()
                .any(|group| group.iter().all(|condition| condition.holds(object)))
    }
}

fn push(groups: &mut [Vec<Condition>], condition: Condition) {
    if let Some(group) = groups.last_mut() {
        group.push(condition);
    }
}

fn parse_condition(line: &str, line_no: usize) -> Result<Condition, FilterError> {
    let parse_error = |reason: String| FilterError::Parse {
        line: line_no,
        reason,
    };

    let (field_token, rest) = line
        .split_once(char::is_whitespace)
        .ok_or_else(|| parse_error(format!("expected '<field> <op> <value>', got '{}'", line)))?;
    let field = Field::parse(field_token)
        .ok_or_else(|| parse_error(format!("unknown field '{}'", field_token)))?;

    let rest = rest.trim_start();
    let (op, value) = ["!~", "==", "!=", "~", "<", ">"]
        .iter()
        .find_map(|op| rest.strip_prefix(op).map(|value| (*op, value)))
        .ok_or_else(|| parse_error(format!("unknown operator in '{}'", rest)))?;
    let value = unquote(value.trim());

    match op {
        "==" | "!=" => Ok(Condition::Equals {
            field,
            value,
            negate: op == "!=",
        }),
        "~" | "!~" => Ok(Condition::Matches {
            field,
            pattern: Regex::new(&value).map_err(|source| FilterError::Pattern {
                line: line_no,
                source,
            })?,
            negate: op == "!~",
        }),
        _ => {
            if field != Field::Size {
                return Err(parse_error(format!("'{}' only compares size", op)));
            }
            let limit = value
                .parse::<u64>()
                .map_err(|_| parse_error(format!("'{}' is not a size", value)))?;
            Ok(if op == "<" {
                Condition::SizeBelow(limit)
            } else {
                Condition::SizeAbove(limit)
            })
        }
    }
}

fn unquote(value: &str) -> String {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::object::sample_dicom;
    use tempfile::TempDir;

    fn open(dir: &TempDir, name: &str, content: &[u8]) -> FileObject {
        let path = dir.path().join(name);
        fs::write(&path, content).unwrap();
        FileObject::open(path).unwrap()
    }

    #[test]
    fn empty_script_matches_everything() {
        let dir = TempDir::new().unwrap();
        let filter = ObjectFilter::parse("# nothing here\n\n").unwrap();

        assert!(filter.matches(&open(&dir, "a.txt", b"x")));
    }

    #[test]
    fn conditions_in_a_group_are_anded() {
        let dir = TempDir::new().unwrap();
        let ct = open(&dir, "ct.dcm", &sample_dicom("1.2.3", "PAT-1", "1.2.4"));
        let other = open(&dir, "ct2.dcm", &sample_dicom("1.2.5", "PAT-2", "1.2.4"));

        let filter = ObjectFilter::parse("kind == dicom\npatient_id == \"PAT-1\"").unwrap();

        assert!(filter.matches(&ct));
        assert!(!filter.matches(&other));
    }

    #[test]
    fn or_starts_an_alternative_group() {
        let dir = TempDir::new().unwrap();
        let xml = open(&dir, "r.xml", b"<report/>");
        let text = open(&dir, "t.txt", b"text");

        let filter = ObjectFilter::parse("kind == dicom\nor\nkind == xml").unwrap();

        assert!(filter.matches(&xml));
        assert!(!filter.matches(&text));
    }

    #[test]
    fn regex_and_size_operators() {
        let dir = TempDir::new().unwrap();
        let object = open(&dir, "QF-1[bad-scan.txt]", b"12345");

        assert!(ObjectFilter::parse("name ~ ^bad-").unwrap().matches(&object));
        assert!(!ObjectFilter::parse("name !~ ^bad-").unwrap().matches(&object));
        assert!(ObjectFilter::parse("size < 10").unwrap().matches(&object));
        assert!(!ObjectFilter::parse("size > 10").unwrap().matches(&object));
    }

    #[test]
    fn literal_lines() {
        let dir = TempDir::new().unwrap();
        let object = open(&dir, "a.txt", b"x");

        assert!(ObjectFilter::parse("true").unwrap().matches(&object));
        assert!(!ObjectFilter::parse("false").unwrap().matches(&object));
    }

    #[test]
    fn parse_errors_name_the_line() {
        let error = ObjectFilter::parse("kind == dicom\ncolour == red").unwrap_err();
        assert!(matches!(error, FilterError::Parse { line: 2, .. }));

        let error = ObjectFilter::parse("name < 4").unwrap_err();
        assert!(matches!(error, FilterError::Parse { line: 1, .. }));

        let error = ObjectFilter::parse("name ~ (").unwrap_err();
        assert!(matches!(error, FilterError::Pattern { line: 1, .. }));
    }

    #[test]
    fn missing_script_file_is_no_filter() {
        let dir = TempDir::new().unwrap();
        assert!(ObjectFilter::load(&dir.path().join("none.script"))
            .unwrap()
            .is_none());

        let path = dir.path().join("dicom.script");
        fs::write(&path, "kind == dicom").unwrap();
        let filter = ObjectFilter::load(&path).unwrap().unwrap();
        assert_eq!(filter.source(), Some(path.as_path()));
    }
}
