//! The `Ticket` type, its on-disk frontmatter representation, and the ID/slug
//! rules that govern it. Metadata and raw body content are kept separate,
//! with a typed, serde-driven frontmatter rather than ad hoc key/value
//! extraction.

use crate::error::{Error, Result};
use chrono::{DateTime, FixedOffset, Local, SecondsFormat};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

static SLUG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9]+(-[a-z0-9]+)*$").unwrap());
static ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{6}-\d{6}-[a-z0-9]+(-[a-z0-9]+)*$").unwrap());

pub fn validate_slug(slug: &str) -> Result<()> {
    if SLUG_RE.is_match(slug) {
        Ok(())
    } else {
        Err(Error::InvalidSlug(slug.to_string()))
    }
}

pub fn is_valid_id(id: &str) -> bool {
    ID_RE.is_match(id)
}

/// Generate `YYMMDD-HHMMSS-<slug>` from the current local time.
pub fn generate_id(slug: &str) -> String {
    format!("{}-{}", Local::now().format("%y%m%d-%H%M%S"), slug)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Todo,
    Doing,
    Done,
}

impl Status {
    pub fn dir_name(self) -> &'static str {
        match self {
            Status::Todo => "todo",
            Status::Doing => "doing",
            Status::Done => "done",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dir_name())
    }
}

impl std::str::FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "todo" => Ok(Status::Todo),
            "doing" => Ok(Status::Doing),
            "done" => Ok(Status::Done),
            other => Err(Error::InvalidStatus(other.to_string())),
        }
    }
}

/// The YAML frontmatter block, serialized/deserialized as a unit so the
/// store never hand-rolls key/value parsing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frontmatter {
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default)]
    pub description: String,
    #[serde(with = "rfc3339")]
    pub created_at: DateTime<FixedOffset>,
    #[serde(with = "rfc3339_opt", default)]
    pub started_at: Option<DateTime<FixedOffset>>,
    #[serde(with = "rfc3339_opt", default)]
    pub closed_at: Option<DateTime<FixedOffset>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related: Vec<String>,
}

fn default_priority() -> i32 {
    2
}

#[derive(Debug, Clone)]
pub struct Ticket {
    pub id: String,
    /// Absent for a ticket that hasn't been written to disk yet.
    pub path: Option<PathBuf>,
    pub frontmatter: Frontmatter,
    pub content: String,
}

impl Ticket {
    pub fn new(id: String, description: String) -> Self {
        let now = Local::now().fixed_offset();
        Self {
            id,
            path: None,
            frontmatter: Frontmatter {
                priority: default_priority(),
                description,
                created_at: now,
                started_at: None,
                closed_at: None,
                related: Vec::new(),
            },
            content: String::new(),
        }
    }

    /// Status derived purely from timestamps: directory placement must
    /// agree with this, but this function never consults the path.
    pub fn derived_status(&self) -> Status {
        if self.frontmatter.closed_at.is_some() {
            Status::Done
        } else if self.frontmatter.started_at.is_some() {
            Status::Doing
        } else {
            Status::Todo
        }
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.frontmatter
            .related
            .iter()
            .find_map(|token| token.strip_prefix("parent:"))
    }

    pub fn set_parent(&mut self, parent_id: &str) {
        self.frontmatter
            .related
            .retain(|t| !t.starts_with("parent:"));
        self.frontmatter.related.push(format!("parent:{parent_id}"));
    }

    pub fn filename(&self) -> String {
        format!("{}.md", self.id)
    }
}

/// Manual `Serialize` impl (the `path` field serializes fine, but we also
/// surface the derived status alongside the raw frontmatter for the JSON
/// output writer, sparing every CLI handler from recomputing it).
impl Serialize for Ticket {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("Ticket", 4)?;
        s.serialize_field("id", &self.id)?;
        s.serialize_field("status", &self.derived_status())?;
        s.serialize_field("path", &self.path)?;
        s.serialize_field("frontmatter", &self.frontmatter)?;
        s.end()
    }
}

/// Frontmatter fenced by `---` lines at the top of the file. Returns
/// `(frontmatter, body)`.
pub fn parse_document(raw: &str) -> Result<(Frontmatter, String)> {
    let mut lines = raw.lines();
    let first = lines.next().unwrap_or("");
    if first.trim_end() != "---" {
        return Err(parse_err("missing opening frontmatter fence"));
    }

    let mut yaml_lines = Vec::new();
    let mut closed = false;
    let mut remainder_start = 0usize;
    let mut offset = first.len() + 1;

    for line in lines.clone() {
        if line.trim_end() == "---" {
            closed = true;
            offset += line.len() + 1;
            remainder_start = offset;
            break;
        }
        yaml_lines.push(line);
        offset += line.len() + 1;
    }

    if !closed {
        return Err(parse_err("missing closing frontmatter fence"));
    }

    let yaml = yaml_lines.join("\n");
    let frontmatter: Frontmatter = serde_yaml::from_str(&yaml)
        .map_err(|e| Error::ParseError {
            file: String::new(),
            source: Box::new(e),
        })?;

    let body = if remainder_start <= raw.len() {
        raw[remainder_start.min(raw.len())..].trim_start_matches('\n').to_string()
    } else {
        String::new()
    };

    Ok((frontmatter, body))
}

fn parse_err(message: &str) -> Error {
    Error::ParseError {
        file: String::new(),
        source: Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    }
}

/// Serialize `(frontmatter, body)` back into the fenced document format.
/// Timestamps always write without subseconds; `related` is omitted when empty.
pub fn render_document(frontmatter: &Frontmatter, body: &str) -> Result<String> {
    let yaml = serde_yaml::to_string(frontmatter)
        .map_err(|e| Error::ParseError {
            file: String::new(),
            source: Box::new(e),
        })?;
    Ok(format!("---\n{yaml}---\n\n{body}"))
}

mod rfc3339 {
    use super::{DateTime, FixedOffset, SecondsFormat};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &DateTime<FixedOffset>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339_opts(SecondsFormat::Secs, false))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<DateTime<FixedOffset>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw).map_err(serde::de::Error::custom)
    }
}

mod rfc3339_opt {
    use super::{DateTime, FixedOffset, SecondsFormat};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<FixedOffset>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) => serializer.serialize_str(&v.to_rfc3339_opts(SecondsFormat::Secs, false)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<FixedOffset>>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw {
            Some(raw) => DateTime::parse_from_rfc3339(&raw)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}
