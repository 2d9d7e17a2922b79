//! Core domain model for bidwatch: notices, query definitions and diffs.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const CRATE_NAME: &str = "bidwatch-core";

pub const ID_FIELD: &str = "publishId";
pub const PUBLISH_DATE_FIELD: &str = "publishDate";
pub const NAME_FIELD: &str = "name";
pub const REGION_FIELD: &str = "companyTypeName";
pub const SALE_DEADLINE_FIELD: &str = "tenderSaleDeadline";
pub const BACK_DATE_FIELD: &str = "backDate";

pub const DEFAULT_DETAIL_LINK_TEMPLATE: &str = "https://b2b.10086.cn/#/noticeDetail?publishId={publishId}&publishUuid={publishUuid}&publishType={publishType}&publishOneType={publishOneType}";

/// Stable identity of a notice. Upstream sends it either as a string or a number;
/// both normalize to the same textual key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One procurement notice exactly as the upstream API returned it.
///
/// Only the identity and publish-date fields carry meaning for the pipeline;
/// every other field is passed through untouched so snapshots stay faithful.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    fields: Map<String, Value>,
}

impl Record {
    pub fn from_fields(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    /// Wraps a JSON value, rejecting anything that is not an object.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(fields) => Some(Self { fields }),
            _ => None,
        }
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn into_fields(self) -> Map<String, Value> {
        self.fields
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Scalar field rendered as text. Nulls and nested values yield `None`.
    pub fn text(&self, field: &str) -> Option<String> {
        match self.fields.get(field)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            Value::Null | Value::Array(_) | Value::Object(_) => None,
        }
    }

    /// Identity used for diffing. Missing, null and blank ids all count as absent.
    pub fn id(&self) -> Option<RecordId> {
        match self.fields.get(ID_FIELD)? {
            Value::String(s) if !s.trim().is_empty() => Some(RecordId(s.clone())),
            Value::Number(n) => Some(RecordId(n.to_string())),
            _ => None,
        }
    }

    pub fn publish_date(&self) -> Option<&str> {
        self.fields.get(PUBLISH_DATE_FIELD)?.as_str()
    }

    pub fn name(&self) -> Option<&str> {
        self.fields.get(NAME_FIELD)?.as_str()
    }
}

impl FromIterator<(String, Value)> for Record {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

/// Records produced by paginating one query once, in upstream order.
pub type ResultSet = Vec<Record>;

/// A named, fixed filter over the upstream dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryDefinition {
    /// Task key used on the command line, e.g. `TASK_3`.
    pub key: String,
    /// Display name; doubles as the snapshot file stem and metadata key.
    pub name: String,
    #[serde(default)]
    pub filters: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<DiffSettings>,
}

impl QueryDefinition {
    pub fn is_diff_monitored(&self) -> bool {
        self.diff.is_some()
    }
}

/// Present on queries whose changes are pushed as notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSettings {
    /// Location of the prior-state document inside the durable state backend.
    pub state_path: String,
}

/// Added and removed notices between a fresh result and the prior state.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct RecordDiff {
    pub added: Vec<Record>,
    pub removed: Vec<Record>,
}

impl RecordDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    pub fn total_changes(&self) -> usize {
        self.added.len() + self.removed.len()
    }
}

/// URL template with `{field}` placeholders filled from a record.
///
/// Missing or null fields become empty strings so a link never carries a
/// literal `null`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetailLinkTemplate {
    template: String,
}

impl Default for DetailLinkTemplate {
    fn default() -> Self {
        Self::new(DEFAULT_DETAIL_LINK_TEMPLATE)
    }
}

impl DetailLinkTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.template
    }

    pub fn placeholders(&self) -> Vec<&str> {
        let mut out = Vec::new();
        let mut rest = self.template.as_str();
        while let Some(open) = rest.find('{') {
            let after = &rest[open + 1..];
            match after.find('}') {
                Some(close) if is_field_name(&after[..close]) => {
                    out.push(&after[..close]);
                    rest = &after[close + 1..];
                }
                _ => rest = after,
            }
        }
        out
    }

    pub fn render(&self, record: &Record) -> String {
        let mut out = String::with_capacity(self.template.len());
        let mut rest = self.template.as_str();
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            match after.find('}') {
                Some(close) if is_field_name(&after[..close]) => {
                    out.push_str(&record.text(&after[..close]).unwrap_or_default());
                    rest = &after[close + 1..];
                }
                _ => {
                    out.push('{');
                    rest = after;
                }
            }
        }
        out.push_str(rest);
        out
    }
}

fn is_field_name(candidate: &str) -> bool {
    !candidate.is_empty()
        && candidate
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}
