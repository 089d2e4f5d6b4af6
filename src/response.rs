//! Wire envelopes shared by every endpoint, and the bulk save payload.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One field-level problem reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationIssue {
    pub property: String,
    pub issue: String,
}

/// Envelope for endpoints returning a single value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemResult<T> {
    pub was_successful: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<T>,
    /// Maps client-assigned stable ids to server-assigned primary keys
    /// after a bulk save.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_map: Option<HashMap<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validation_issues: Vec<ValidationIssue>,
}

impl<T> ItemResult<T> {
    pub fn success(object: T) -> Self {
        ItemResult {
            was_successful: true,
            message: None,
            object: Some(object),
            ref_map: None,
            validation_issues: Vec::new(),
        }
    }

    pub fn success_empty() -> Self {
        ItemResult {
            was_successful: true,
            message: None,
            object: None,
            ref_map: None,
            validation_issues: Vec::new(),
        }
    }

    pub fn failure(message: &str) -> Self {
        ItemResult {
            was_successful: false,
            message: Some(message.to_string()),
            object: None,
            ref_map: None,
            validation_issues: Vec::new(),
        }
    }
}

/// Envelope for endpoints returning a page of values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResult<T> {
    pub was_successful: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub list: Vec<T>,
    #[serde(default = "default_page")]
    pub page: i64,
    #[serde(default)]
    pub page_size: i64,
    #[serde(default)]
    pub page_count: i64,
    /// -1 means the server skipped counting.
    #[serde(default)]
    pub total_count: i64,
}

fn default_page() -> i64 {
    1
}

impl<T> ListResult<T> {
    pub fn success(list: Vec<T>, page: i64, page_size: i64, total_count: i64) -> Self {
        let page_count = if total_count < 0 || page_size <= 0 {
            -1
        } else {
            (total_count + page_size - 1) / page_size
        };
        ListResult {
            was_successful: true,
            message: None,
            list,
            page,
            page_size,
            page_count,
            total_count,
        }
    }

    pub fn failure(message: &str) -> Self {
        ListResult {
            was_successful: false,
            message: Some(message.to_string()),
            list: Vec::new(),
            page: 1,
            page_size: 0,
            page_count: 0,
            total_count: 0,
        }
    }
}

/// What the server should do with one bulk save entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BulkSaveAction {
    Save,
    Delete,
    None,
}

/// One entry in a bulk save request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkSaveItem {
    #[serde(rename = "type")]
    pub type_name: String,
    pub action: BulkSaveAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<bool>,
    pub data: serde_json::Value,
    /// Property name to stable id: the entry's own key plus any foreign
    /// keys pointing at not-yet-saved principals in the same payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refs: Option<HashMap<String, u32>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkSavePayload {
    pub items: Vec<BulkSaveItem>,
}
