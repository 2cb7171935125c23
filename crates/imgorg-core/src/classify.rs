use std::path::PathBuf;
use std::sync::LazyLock;

use chrono::{Datelike, NaiveDateTime, Timelike};
use regex::Regex;
use unicode_normalization::UnicodeNormalization;

use crate::candidate::{FileCandidate, MetadataRecord};
use crate::error::Error;

pub const DEFAULT_TEMPLATE: &str = "{year}/{month}/{name}";

/// Bucket for files whose date came from the filesystem, not from metadata.
pub const UNKNOWN_DATE_DIR: &str = "unknown-date";

const UNKNOWN: &str = "unknown";
const UNKNOWN_CAMERA: &str = "unknown-camera";

static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\{([^{}]*)\}").unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Year,
    Month,
    Day,
    Hour,
    Minute,
    Second,
    Make,
    Model,
    Camera,
    Name,
    Stem,
    Ext,
    Tag(String),
}

impl Token {
    fn parse(s: &str) -> Option<Token> {
        let token = match s {
            "year" => Token::Year,
            "month" => Token::Month,
            "day" => Token::Day,
            "hour" => Token::Hour,
            "minute" => Token::Minute,
            "second" => Token::Second,
            "make" => Token::Make,
            "model" => Token::Model,
            "camera" => Token::Camera,
            "name" | "originalName" => Token::Name,
            "stem" => Token::Stem,
            "ext" => Token::Ext,
            other => {
                let tag = other.strip_prefix("tag:")?;
                if tag.is_empty() {
                    return None;
                }
                Token::Tag(tag.to_string())
            }
        };
        Some(token)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Piece {
    Literal(String),
    Token(Token),
}

/// Derives canonical relative destination paths from a naming template.
#[derive(Debug, Clone)]
pub struct PathClassifier {
    template: String,
    segments: Vec<Vec<Piece>>,
}

impl PathClassifier {
    pub fn new(template: &str) -> Result<Self, Error> {
        let invalid = |reason: &str| Error::InvalidTemplate {
            template: template.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = template.trim();
        if trimmed.is_empty() {
            return Err(invalid("template is empty"));
        }
        if trimmed.starts_with('/') || trimmed.starts_with('\\') {
            return Err(invalid("template must be relative"));
        }

        let mut segments = Vec::new();
        for raw in trimmed.split('/') {
            if raw.is_empty() {
                return Err(invalid("empty path segment"));
            }
            if raw == "." || raw == ".." {
                return Err(invalid("'.' and '..' segments are not allowed"));
            }

            let mut pieces = Vec::new();
            let mut last = 0;
            for caps in TOKEN_RE.captures_iter(raw) {
                let whole = caps.get(0).unwrap();
                push_literal(&mut pieces, &raw[last..whole.start()], &invalid)?;
                let name = &caps[1];
                let token = Token::parse(name)
                    .ok_or_else(|| invalid(&format!("unknown token {{{}}}", name)))?;
                pieces.push(Piece::Token(token));
                last = whole.end();
            }
            push_literal(&mut pieces, &raw[last..], &invalid)?;
            segments.push(pieces);
        }

        Ok(Self {
            template: trimmed.to_string(),
            segments,
        })
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// Canonical path for the candidate, relative to the destination root.
    ///
    /// Without a capture timestamp the modification time fills the date
    /// tokens and the whole path moves under [`UNKNOWN_DATE_DIR`].
    pub fn classify(&self, candidate: &FileCandidate, metadata: &MetadataRecord) -> PathBuf {
        let (date, dated) = match metadata.capture_timestamp {
            Some(dt) => (dt, true),
            None => (candidate.modified_local(), false),
        };
        let name = candidate.file_name();
        let ctx = RenderContext {
            date,
            name: &name,
            metadata,
        };

        let mut path = PathBuf::new();
        if !dated {
            path.push(UNKNOWN_DATE_DIR);
        }
        for segment in &self.segments {
            let rendered: String = segment
                .iter()
                .map(|piece| match piece {
                    Piece::Literal(s) => s.clone(),
                    Piece::Token(t) => sanitize(&ctx.render(t)),
                })
                .collect();
            path.push(sanitize(&rendered));
        }
        path
    }
}

fn push_literal(
    pieces: &mut Vec<Piece>,
    literal: &str,
    invalid: &dyn Fn(&str) -> Error,
) -> Result<(), Error> {
    if literal.contains('{') || literal.contains('}') {
        return Err(invalid("unbalanced brace"));
    }
    if !literal.is_empty() {
        pieces.push(Piece::Literal(literal.to_string()));
    }
    Ok(())
}

struct RenderContext<'a> {
    date: NaiveDateTime,
    name: &'a str,
    metadata: &'a MetadataRecord,
}

impl RenderContext<'_> {
    fn render(&self, token: &Token) -> String {
        let d = &self.date;
        match token {
            Token::Year => format!("{:04}", d.year()),
            Token::Month => format!("{:02}", d.month()),
            Token::Day => format!("{:02}", d.day()),
            Token::Hour => format!("{:02}", d.hour()),
            Token::Minute => format!("{:02}", d.minute()),
            Token::Second => format!("{:02}", d.second()),
            Token::Make => or_unknown(self.metadata.camera_make.as_deref()),
            Token::Model => or_unknown(self.metadata.camera_model.as_deref()),
            Token::Camera => camera_label(
                self.metadata.camera_make.as_deref(),
                self.metadata.camera_model.as_deref(),
            ),
            Token::Name => self.name.to_string(),
            Token::Stem => match self.name.rsplit_once('.') {
                Some((stem, _)) if !stem.is_empty() => stem.to_string(),
                _ => self.name.to_string(),
            },
            Token::Ext => match self.name.rsplit_once('.') {
                Some((stem, ext)) if !stem.is_empty() => ext.to_lowercase(),
                _ => String::new(),
            },
            Token::Tag(name) => or_unknown(self.metadata.tag(name)),
        }
    }
}

fn or_unknown(value: Option<&str>) -> String {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => v.to_string(),
        _ => UNKNOWN.to_string(),
    }
}

/// Models usually repeat the make ("Canon" + "Canon EOS 5D"); avoid doubling it.
fn camera_label(make: Option<&str>, model: Option<&str>) -> String {
    let make = make.map(str::trim).filter(|s| !s.is_empty());
    let model = model.map(str::trim).filter(|s| !s.is_empty());
    match (make, model) {
        (Some(make), Some(model)) => {
            if model.to_lowercase().starts_with(&make.to_lowercase()) {
                model.to_string()
            } else {
                format!("{}-{}", make, model)
            }
        }
        (Some(only), None) | (None, Some(only)) => only.to_string(),
        (None, None) => UNKNOWN_CAMERA.to_string(),
    }
}

/// Make a single path component safe on common filesystems.
fn sanitize(component: &str) -> String {
    let cleaned: String = component
        .nfc()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim_matches(|c: char| c.is_whitespace() || c == '.');
    if trimmed.is_empty() {
        UNKNOWN.to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::path::Path;
    use std::time::{Duration, SystemTime};

    fn candidate(name: &str) -> FileCandidate {
        FileCandidate::new(
            PathBuf::from("/src/some/dir").join(name),
            10,
            SystemTime::UNIX_EPOCH + Duration::from_secs(1_600_000_000),
        )
    }

    fn dated(y: i32, m: u32, d: u32) -> MetadataRecord {
        MetadataRecord {
            capture_timestamp: NaiveDate::from_ymd_opt(y, m, d)
                .unwrap()
                .and_hms_opt(12, 30, 5),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_template() {
        let c = PathClassifier::new(DEFAULT_TEMPLATE).unwrap();
        let path = c.classify(&candidate("IMG_0001.jpg"), &dated(2023, 7, 4));
        assert_eq!(path, Path::new("2023/07/IMG_0001.jpg"));
    }

    #[test]
    fn test_camera_template() {
        let c = PathClassifier::new("{year}/{month}/{camera}-{name}").unwrap();
        let mut meta = dated(2021, 1, 2);
        meta.camera_make = Some("Canon".into());
        meta.camera_model = Some("Canon EOS R5".into());
        let path = c.classify(&candidate("A.CR3"), &meta);
        assert_eq!(path, Path::new("2021/01/Canon EOS R5-A.CR3"));

        meta.camera_make = Some("FUJIFILM".into());
        meta.camera_model = Some("X-T4".into());
        let path = c.classify(&candidate("A.RAF"), &meta);
        assert_eq!(path, Path::new("2021/01/FUJIFILM-X-T4-A.RAF"));

        let path = c.classify(&candidate("A.RAF"), &dated(2021, 1, 2));
        assert_eq!(path, Path::new("2021/01/unknown-camera-A.RAF"));
    }

    #[test]
    fn test_missing_date_goes_to_unknown_bucket() {
        let c = PathClassifier::new(DEFAULT_TEMPLATE).unwrap();
        let cand = candidate("scan.png");
        let path = c.classify(&cand, &MetadataRecord::default());

        let mtime = cand.modified_local();
        let expected = PathBuf::from(UNKNOWN_DATE_DIR)
            .join(format!("{:04}", mtime.year()))
            .join(format!("{:02}", mtime.month()))
            .join("scan.png");
        assert_eq!(path, expected);
    }

    #[test]
    fn test_deterministic() {
        let c = PathClassifier::new("{year}/{day}/{hour}{minute}{second}_{stem}.{ext}").unwrap();
        let meta = dated(2020, 2, 29);
        let a = c.classify(&candidate("Photo.JPEG"), &meta);
        let b = c.classify(&candidate("Photo.JPEG"), &meta);
        assert_eq!(a, b);
        assert_eq!(a, Path::new("2020/29/123005_Photo.jpeg"));
    }

    #[test]
    fn test_values_are_sanitized() {
        let c = PathClassifier::new("{model}/{tag:LensModel}/{name}").unwrap();
        let mut meta = dated(2020, 1, 1);
        meta.camera_model = Some("Cam/Model: 2".into());
        meta.other_tags.insert("LensModel".into(), "..".into());
        let path = c.classify(&candidate("x.jpg"), &meta);
        assert_eq!(path, Path::new("Cam_Model_ 2/unknown/x.jpg"));
    }

    #[test]
    fn test_names_normalized_to_nfc() {
        let c = PathClassifier::new("{name}").unwrap();
        // "e" + combining acute accent
        let path = c.classify(&candidate("cafe\u{301}.jpg"), &dated(2020, 1, 1));
        assert_eq!(path, Path::new("caf\u{e9}.jpg"));
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_names_keep_their_extension() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let raw = |bytes: &[u8]| {
            FileCandidate::new(
                PathBuf::from("/src").join(OsStr::from_bytes(bytes)),
                1,
                SystemTime::now(),
            )
        };
        let meta = dated(2020, 1, 1);

        let c = PathClassifier::new(DEFAULT_TEMPLATE).unwrap();
        let cafe = c.classify(&raw(b"caf\xe9.jpg"), &meta);
        let naive = c.classify(&raw(b"na\xefve.jpg"), &meta);
        assert_eq!(cafe, Path::new("2020/01/caf\u{fffd}.jpg"));
        assert_eq!(naive, Path::new("2020/01/na\u{fffd}ve.jpg"));

        let c = PathClassifier::new("{ext}/{stem}").unwrap();
        assert_eq!(c.classify(&raw(b"caf\xe9.JPG"), &meta), Path::new("jpg/caf\u{fffd}"));
    }

    #[test]
    fn test_invalid_templates() {
        for bad in ["", "/abs/{name}", "{year}/../{name}", "{year}//{name}", "{nope}", "{year", "{tag:}/x"] {
            assert!(
                matches!(PathClassifier::new(bad), Err(Error::InvalidTemplate { .. })),
                "template {:?} should be rejected",
                bad
            );
        }
    }
}
