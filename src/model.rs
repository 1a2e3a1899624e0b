use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const DEFAULT_TITLE: &str = "Untitled report";
pub const DEFAULT_DESCRIPTION: &str = "No description available";
pub const DEFAULT_AUTHOR: &str = "Unknown author";

/// Metadata of one hosted report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportRecord {
    pub report_id: String,
    /// Prefix of the report's script and assets in the bucket, always ending in `/`
    pub storage_path: String,
    pub title: String,
    pub description: String,
    pub author: String,
    pub deleted: bool,
    pub owner_email: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Why a raw table item could not become a record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordRejection {
    NotAnObject,
    MissingId,
}

// Stored field names first, English aliases second.
const STORAGE_PATH_KEYS: &[&str] = &["id_s3", "storage_path"];
const TITLE_KEYS: &[&str] = &["titulo", "title"];
const DESCRIPTION_KEYS: &[&str] = &["descricao", "description"];
const AUTHOR_KEYS: &[&str] = &["autor", "author"];
const DELETED_KEYS: &[&str] = &["deletado", "deleted"];
const OWNER_KEYS: &[&str] = &["user_email", "owner_email"];

impl ReportRecord {
    /// Build a record from a raw table item, filling defaults for absent fields.
    ///
    /// Only `report_id` is required; `null` values count as absent.
    pub fn from_item(item: &Value) -> Result<Self, RecordRejection> {
        let map = item.as_object().ok_or(RecordRejection::NotAnObject)?;

        let report_id = string_field(map, &["report_id"])
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .ok_or(RecordRejection::MissingId)?;

        let storage_path = string_field(map, STORAGE_PATH_KEYS)
            .filter(|p| !p.trim().is_empty())
            .map(|p| normalize_prefix(&p))
            .unwrap_or_else(|| format!("{}/", report_id));

        Ok(Self {
            storage_path,
            title: string_field(map, TITLE_KEYS).unwrap_or_else(|| DEFAULT_TITLE.to_string()),
            description: string_field(map, DESCRIPTION_KEYS)
                .unwrap_or_else(|| DEFAULT_DESCRIPTION.to_string()),
            author: string_field(map, AUTHOR_KEYS).unwrap_or_else(|| DEFAULT_AUTHOR.to_string()),
            deleted: bool_field(map, DELETED_KEYS).unwrap_or(false),
            owner_email: string_field(map, OWNER_KEYS).unwrap_or_default(),
            created_at: string_field(map, &["created_at"]).unwrap_or_default(),
            updated_at: string_field(map, &["updated_at"]).unwrap_or_default(),
            report_id,
        })
    }

    /// Stand-in record for scripts that do not come from the catalog
    pub fn local(report_id: &str, title: &str) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            report_id: report_id.to_string(),
            storage_path: format!("{}/", report_id),
            title: title.to_string(),
            description: "Rendered outside the catalog; nothing here is published.".to_string(),
            author: "Local developer".to_string(),
            deleted: false,
            owner_email: String::new(),
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// Storage key of a file inside this report's folder
    pub fn object_key(&self, file: &str) -> String {
        format!("{}{}", self.storage_path, file.trim_start_matches('/'))
    }
}

fn normalize_prefix(path: &str) -> String {
    let trimmed = path.trim().trim_start_matches('/');
    if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{}/", trimmed)
    }
}

fn lookup<'a>(map: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| map.get(*k))
        .find(|v| !v.is_null())
}

fn string_field(map: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    match lookup(map, keys)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn bool_field(map: &Map<String, Value>, keys: &[&str]) -> Option<bool> {
    match lookup(map, keys)? {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" | "" => Some(false),
            _ => None,
        },
        _ => None,
    }
}
