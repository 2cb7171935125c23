use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use chrono::NaiveDateTime;
use exif::{Field, In, Reader, Tag, Value};
use thiserror::Error;

use crate::candidate::MetadataRecord;

/// Raw camera formats mime_guess does not classify as images.
const RAW_EXTENSIONS: &[&str] = &[
    "3fr", "arw", "cr2", "cr3", "crw", "dng", "erf", "heic", "heif", "kdc", "mef", "mos", "mrw",
    "nef", "nrw", "orf", "pef", "raf", "raw", "rw2", "rwl", "sr2", "srf", "srw", "x3f",
];

/// Tag values longer than this are binary blobs rather than descriptive text.
const MAX_TAG_LEN: usize = 128;

#[derive(Error, Debug)]
#[error("cannot decode metadata of {path}: {reason}")]
pub struct DecodeError {
    pub path: String,
    pub reason: String,
}

impl DecodeError {
    fn new(path: &Path, reason: impl ToString) -> Self {
        Self {
            path: path.display().to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Boundary to whatever decodes embedded image metadata.
pub trait MetadataReader: Send + Sync {
    fn read(&self, path: &Path) -> Result<MetadataRecord, DecodeError>;
}

/// Reads EXIF from JPEG, TIFF, HEIF, PNG and WebP containers.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExifReader;

impl MetadataReader for ExifReader {
    fn read(&self, path: &Path) -> Result<MetadataRecord, DecodeError> {
        let file = File::open(path).map_err(|e| DecodeError::new(path, e))?;
        let exif = Reader::new()
            .read_from_container(&mut BufReader::new(file))
            .map_err(|e| DecodeError::new(path, e))?;

        let mut record = MetadataRecord::default();

        // EXIF datetimes have no timezone info - they are local time as-is.
        for tag in [Tag::DateTimeOriginal, Tag::DateTimeDigitized, Tag::DateTime] {
            if let Some(dt) = exif
                .get_field(tag, In::PRIMARY)
                .and_then(ascii_value)
                .and_then(|s| parse_exif_datetime(&s))
            {
                record.capture_timestamp = Some(dt);
                break;
            }
        }

        record.camera_make = exif.get_field(Tag::Make, In::PRIMARY).and_then(ascii_value);
        record.camera_model = exif.get_field(Tag::Model, In::PRIMARY).and_then(ascii_value);

        for field in exif.fields().filter(|f| f.ifd_num == In::PRIMARY) {
            if matches!(
                field.tag,
                Tag::Make
                    | Tag::Model
                    | Tag::DateTime
                    | Tag::DateTimeOriginal
                    | Tag::DateTimeDigitized
                    | Tag::MakerNote
                    | Tag::ExifIFDPointer
                    | Tag::GPSInfoIFDPointer
                    | Tag::InteropIFDPointer
            ) {
                continue;
            }
            let name = field.tag.to_string();
            // Unknown tags render as "Tag(Context, n)"
            if name.contains('(') {
                continue;
            }
            let value = ascii_value(field)
                .unwrap_or_else(|| field.display_value().with_unit(&exif).to_string());
            if value.is_empty() || value.len() > MAX_TAG_LEN {
                continue;
            }
            record.other_tags.entry(name).or_insert(value);
        }

        Ok(record)
    }
}

/// Whether the file looks like an image by its extension.
pub fn is_image_like(path: &Path) -> bool {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return false;
    };
    let ext = ext.to_ascii_lowercase();
    if RAW_EXTENSIONS.contains(&ext.as_str()) {
        return true;
    }
    mime_guess::from_ext(&ext)
        .first()
        .map_or(false, |mime| mime.type_() == mime_guess::mime::IMAGE)
}

fn ascii_value(field: &Field) -> Option<String> {
    let Value::Ascii(ref parts) = field.value else {
        return None;
    };
    let joined = parts
        .iter()
        .map(|p| String::from_utf8_lossy(p).trim_matches(char::from(0)).trim().to_string())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    if joined.is_empty() {
        None
    } else {
        Some(joined)
    }
}

fn parse_exif_datetime(s: &str) -> Option<NaiveDateTime> {
    let cleaned = s
        .replace('-', ":")
        .replace('/', ":")
        .replace('\\', ":")
        .replace('.', ":");

    if let Ok(dt) = NaiveDateTime::parse_from_str(&cleaned, "%Y:%m:%d %H:%M:%S") {
        return Some(dt);
    }

    // Date-only or malformed time part
    if let Ok(d) = chrono::NaiveDate::parse_from_str(cleaned.split(' ').next()?, "%Y:%m:%d") {
        return d.and_hms_opt(0, 0, 0);
    }

    None
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::{NaiveDate, Timelike};
    use tempfile::tempdir;

    /// Minimal little-endian TIFF with Make, Model and DateTimeOriginal.
    fn tiff(make: &str, model: &str, taken: &str) -> Vec<u8> {
        let make = format!("{}\0", make).into_bytes();
        let model = format!("{}\0", model).into_bytes();
        let taken = format!("{}\0", taken).into_bytes();

        let ifd0_off: u32 = 8;
        let ifd0_len: u32 = 2 + 3 * 12 + 4;
        let exif_off = ifd0_off + ifd0_len;
        let exif_len: u32 = 2 + 12 + 4;
        let taken_off = exif_off + exif_len;
        let make_off = taken_off + taken.len() as u32;
        let model_off = make_off + make.len() as u32;

        let mut out = Vec::new();
        out.extend_from_slice(b"II");
        out.extend_from_slice(&42u16.to_le_bytes());
        out.extend_from_slice(&ifd0_off.to_le_bytes());

        let entry = |out: &mut Vec<u8>, tag: u16, typ: u16, count: u32, value: u32| {
            out.extend_from_slice(&tag.to_le_bytes());
            out.extend_from_slice(&typ.to_le_bytes());
            out.extend_from_slice(&count.to_le_bytes());
            out.extend_from_slice(&value.to_le_bytes());
        };

        out.extend_from_slice(&3u16.to_le_bytes());
        entry(&mut out, 0x010f, 2, make.len() as u32, make_off);
        entry(&mut out, 0x0110, 2, model.len() as u32, model_off);
        entry(&mut out, 0x8769, 4, 1, exif_off);
        out.extend_from_slice(&0u32.to_le_bytes());

        out.extend_from_slice(&1u16.to_le_bytes());
        entry(&mut out, 0x9003, 2, taken.len() as u32, taken_off);
        out.extend_from_slice(&0u32.to_le_bytes());

        out.extend_from_slice(&taken);
        out.extend_from_slice(&make);
        out.extend_from_slice(&model);
        out
    }

    /// JPEG consisting of SOI, an Exif APP1 segment and EOI.
    pub(crate) fn jpeg_with_exif(make: &str, model: &str, taken: &str) -> Vec<u8> {
        let tiff = tiff(make, model, taken);
        let mut app1 = b"Exif\0\0".to_vec();
        app1.extend_from_slice(&tiff);

        let mut out = vec![0xff, 0xd8, 0xff, 0xe1];
        out.extend_from_slice(&((app1.len() + 2) as u16).to_be_bytes());
        out.extend_from_slice(&app1);
        out.extend_from_slice(&[0xff, 0xd9]);
        out
    }

    #[test]
    fn test_reads_exif_fields() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("IMG_0001.jpg");
        std::fs::write(&path, jpeg_with_exif("Canon", "Canon EOS 5D", "2021:03:04 05:06:07")).unwrap();

        let record = ExifReader.read(&path).unwrap();
        let dt = record.capture_timestamp.unwrap();
        assert_eq!(dt.date(), NaiveDate::from_ymd_opt(2021, 3, 4).unwrap());
        assert_eq!((dt.hour(), dt.minute(), dt.second()), (5, 6, 7));
        assert_eq!(record.camera_make.as_deref(), Some("Canon"));
        assert_eq!(record.camera_model.as_deref(), Some("Canon EOS 5D"));
    }

    #[test]
    fn test_no_exif_is_decode_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plain.jpg");
        std::fs::write(&path, b"not really a jpeg").unwrap();
        assert!(ExifReader.read(&path).is_err());
    }

    #[test]
    fn test_image_like() {
        assert!(is_image_like(Path::new("a/b/IMG_1.JPG")));
        assert!(is_image_like(Path::new("shot.png")));
        assert!(is_image_like(Path::new("DSC_0001.NEF")));
        assert!(is_image_like(Path::new("x.cr3")));
        assert!(!is_image_like(Path::new("notes.txt")));
        assert!(!is_image_like(Path::new("Makefile")));
    }

    #[test]
    fn test_parse_exif_datetime_variants() {
        let expected = NaiveDate::from_ymd_opt(2019, 12, 31)
            .unwrap()
            .and_hms_opt(23, 59, 58)
            .unwrap();
        assert_eq!(parse_exif_datetime("2019:12:31 23:59:58"), Some(expected));
        assert_eq!(parse_exif_datetime("2019-12-31 23:59:58"), Some(expected));
        assert_eq!(
            parse_exif_datetime("2019:12:31 xx"),
            NaiveDate::from_ymd_opt(2019, 12, 31).unwrap().and_hms_opt(0, 0, 0)
        );
        assert_eq!(parse_exif_datetime("0000:00:00 00:00:00"), None);
    }
}
