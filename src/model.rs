use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use ts_rs::TS;
use uuid::Uuid;

use crate::{AppError, AppResult};

/// Field values of a queued mutation, as the API client handed them over.
pub type Payload = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export, export_to = "bindings/")]
pub enum SyncStatus {
    Pending,
    Synced,
    Conflict,
}

impl SyncStatus {
    pub const ALL: [SyncStatus; 3] = [SyncStatus::Pending, SyncStatus::Synced, SyncStatus::Conflict];

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Synced => "synced",
            SyncStatus::Conflict => "conflict",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = AppError;

    fn from_str(raw: &str) -> AppResult<Self> {
        match raw {
            "pending" => Ok(SyncStatus::Pending),
            "synced" => Ok(SyncStatus::Synced),
            "conflict" => Ok(SyncStatus::Conflict),
            other => Err(AppError::new("MODEL/BAD_STATUS", "Unknown sync status")
                .with_context("value", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export, export_to = "bindings/")]
pub enum SyncAction {
    Create,
    Update,
    Delete,
}

impl SyncAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncAction::Create => "create",
            SyncAction::Update => "update",
            SyncAction::Delete => "delete",
        }
    }
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncAction {
    type Err = AppError;

    fn from_str(raw: &str) -> AppResult<Self> {
        match raw {
            "create" => Ok(SyncAction::Create),
            "update" => Ok(SyncAction::Update),
            "delete" => Ok(SyncAction::Delete),
            other => Err(AppError::new("MODEL/BAD_ACTION", "Unknown sync action")
                .with_context("value", other)),
        }
    }
}

/// One queued mutation intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct PendingOperation {
    #[ts(type = "string")]
    pub local_id: Uuid,
    #[serde(default)]
    #[ts(type = "number | null")]
    pub server_id: Option<i64>,
    pub table_name: String,
    pub sync_status: SyncStatus,
    pub sync_action: SyncAction,
    #[ts(type = "string")]
    pub updated_at: DateTime<Utc>,
    pub composite_key: String,
    #[ts(type = "Record<string, unknown>")]
    pub data: Payload,
}

/// Local identity to server identity, once the remote side has assigned one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct IdMapping {
    #[ts(type = "string")]
    pub local_id: Uuid,
    #[ts(type = "number")]
    pub server_id: i64,
    pub table_name: String,
}

/// Row counts per lifecycle state, for the host's pending indicator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct StatusCounts {
    #[ts(type = "number")]
    pub pending: u64,
    #[ts(type = "number")]
    pub synced: u64,
    #[ts(type = "number")]
    pub conflict: u64,
}

impl StatusCounts {
    pub fn add(&mut self, status: SyncStatus, n: u64) {
        match status {
            SyncStatus::Pending => self.pending += n,
            SyncStatus::Synced => self.synced += n,
            SyncStatus::Conflict => self.conflict += n,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.synced + self.conflict
    }
}
