//! Minimal DICOM Part-10 header reader.
//!
//! Only the identifiers the pipeline routes on are read. Parsing stops at the
//! first undefined-length element, at the first element past Series Instance
//! UID, or at a transfer syntax this reader does not walk.

use serde::{Deserialize, Serialize};

const PREAMBLE_LEN: usize = 128;
const MAGIC: &[u8; 4] = b"DICM";

const IMPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2";
const EXPLICIT_VR_BIG_ENDIAN: &str = "1.2.840.10008.1.2.2";
const DEFLATED_EXPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1.99";

const TRANSFER_SYNTAX_UID: u32 = 0x0002_0010;
const SOP_CLASS_UID: u32 = 0x0008_0016;
const SOP_INSTANCE_UID: u32 = 0x0008_0018;
const PATIENT_NAME: u32 = 0x0010_0010;
const PATIENT_ID: u32 = 0x0010_0020;
const STUDY_INSTANCE_UID: u32 = 0x0020_000D;
const SERIES_INSTANCE_UID: u32 = 0x0020_000E;

/// VRs encoded with a 2-byte reserved field and a 4-byte length
const LONG_VRS: [&[u8; 2]; 13] = [
    b"OB", b"OD", b"OF", b"OL", b"OV", b"OW", b"SQ", b"SV", b"UC", b"UN", b"UR", b"UT", b"UV",
];

/// Identifiers read from a DICOM header
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DicomHeader {
    pub transfer_syntax: Option<String>,
    pub sop_class_uid: Option<String>,
    pub sop_instance_uid: Option<String>,
    pub patient_name: Option<String>,
    pub patient_id: Option<String>,
    pub study_instance_uid: Option<String>,
    pub series_instance_uid: Option<String>,
}

/// Whether `bytes` start with a Part-10 preamble and magic
pub fn is_dicom(bytes: &[u8]) -> bool {
    bytes.len() >= PREAMBLE_LEN + MAGIC.len() && &bytes[PREAMBLE_LEN..PREAMBLE_LEN + 4] == MAGIC
}

/// Read the routing identifiers from the start of a Part-10 file.
pub fn read_header(bytes: &[u8]) -> Option<DicomHeader> {
    if !is_dicom(bytes) {
        return None;
    }

    let mut header = DicomHeader::default();
    let mut pos = PREAMBLE_LEN + MAGIC.len();
    let mut in_meta = true;
    let mut implicit = false;

    while pos + 8 <= bytes.len() {
        let group = read_u16(bytes, pos)?;
        let element = read_u16(bytes, pos + 2)?;

        if in_meta && group != 0x0002 {
            in_meta = false;
            match header.transfer_syntax.as_deref() {
                Some(EXPLICIT_VR_BIG_ENDIAN) | Some(DEFLATED_EXPLICIT_VR_LITTLE_ENDIAN) => break,
                Some(IMPLICIT_VR_LITTLE_ENDIAN) => implicit = true,
                _ => {}
            }
        }

        let tag = (u32::from(group) << 16) | u32::from(element);
        if tag > SERIES_INSTANCE_UID {
            break;
        }

        let (length, value_start) = if implicit {
            (read_u32(bytes, pos + 4)?, pos + 8)
        } else {
            let vr = [bytes[pos + 4], bytes[pos + 5]];
            if LONG_VRS.iter().any(|long| **long == vr) {
                (read_u32(bytes, pos + 8)?, pos + 12)
            } else {
                (u32::from(read_u16(bytes, pos + 6)?), pos + 8)
            }
        };

        if length == u32::MAX {
            break;
        }
        let Some(end) = value_start.checked_add(length as usize) else {
            break;
        };
        if end > bytes.len() {
            break;
        }

        let value = &bytes[value_start..end];
        let slot = match tag {
            TRANSFER_SYNTAX_UID => Some(&mut header.transfer_syntax),
            SOP_CLASS_UID => Some(&mut header.sop_class_uid),
            SOP_INSTANCE_UID => Some(&mut header.sop_instance_uid),
            PATIENT_NAME => Some(&mut header.patient_name),
            PATIENT_ID => Some(&mut header.patient_id),
            STUDY_INSTANCE_UID => Some(&mut header.study_instance_uid),
            SERIES_INSTANCE_UID => Some(&mut header.series_instance_uid),
            _ => None,
        };
        if let Some(slot) = slot {
            *slot = text(value);
        }

        pos = end;
    }

    Some(header)
}

fn read_u16(bytes: &[u8], at: usize) -> Option<u16> {
    bytes
        .get(at..at + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
}

fn read_u32(bytes: &[u8], at: usize) -> Option<u32> {
    bytes
        .get(at..at + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// Decode a padded text value; empty values are absent.
fn text(value: &[u8]) -> Option<String> {
    let decoded = String::from_utf8_lossy(value);
    let trimmed = decoded.trim_end_matches(['\0', ' ']).trim_start();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Build a small explicit-VR Part-10 file for tests.
#[cfg(test)]
pub(crate) fn sample(sop_instance_uid: &str, patient_id: &str, study_uid: &str) -> Vec<u8> {
    fn element(out: &mut Vec<u8>, group: u16, element: u16, vr: &[u8; 2], value: &str) {
        let mut bytes = value.as_bytes().to_vec();
        if bytes.len() % 2 == 1 {
            bytes.push(if vr == b"UI" { 0 } else { b' ' });
        }
        out.extend_from_slice(&group.to_le_bytes());
        out.extend_from_slice(&element.to_le_bytes());
        out.extend_from_slice(vr);
        out.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
        out.extend_from_slice(&bytes);
    }

    let mut out = vec![0u8; PREAMBLE_LEN];
    out.extend_from_slice(MAGIC);
    element(&mut out, 0x0002, 0x0010, b"UI", "1.2.840.10008.1.2.1");
    element(&mut out, 0x0008, 0x0016, b"UI", "1.2.840.10008.5.1.4.1.1.2");
    element(&mut out, 0x0008, 0x0018, b"UI", sop_instance_uid);
    element(&mut out, 0x0010, 0x0010, b"PN", "DOE^JANE");
    element(&mut out, 0x0010, 0x0020, b"LO", patient_id);
    element(&mut out, 0x0020, 0x000D, b"UI", study_uid);
    element(&mut out, 0x0020, 0x000E, b"UI", "1.2.3.4.5.6");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_identifiers_from_explicit_header() {
        let bytes = sample("1.2.3.100", "PAT-7", "1.2.3.200");
        let header = read_header(&bytes).unwrap();

        assert_eq!(header.sop_instance_uid.as_deref(), Some("1.2.3.100"));
        assert_eq!(header.patient_id.as_deref(), Some("PAT-7"));
        assert_eq!(header.patient_name.as_deref(), Some("DOE^JANE"));
        assert_eq!(header.study_instance_uid.as_deref(), Some("1.2.3.200"));
        assert_eq!(header.series_instance_uid.as_deref(), Some("1.2.3.4.5.6"));
        assert_eq!(
            header.transfer_syntax.as_deref(),
            Some("1.2.840.10008.1.2.1")
        );
    }

    #[test]
    fn rejects_missing_magic() {
        assert!(read_header(&[0u8; 200]).is_none());
        assert!(!is_dicom(b"short"));
    }

    #[test]
    fn truncated_header_keeps_what_was_read() {
        let mut bytes = sample("1.2.3.100", "PAT-7", "1.2.3.200");
        let cut = bytes.len() - 40;
        bytes.truncate(cut);

        let header = read_header(&bytes).unwrap();
        assert_eq!(header.sop_instance_uid.as_deref(), Some("1.2.3.100"));
    }

    #[test]
    fn padded_text_is_trimmed() {
        assert_eq!(text(b"1.2.3\0"), Some("1.2.3".to_string()));
        assert_eq!(text(b"  "), None);
    }
}
