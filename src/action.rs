//! Pending mutation types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Column that identifies an existing remote record inside a payload.
pub const IDENTITY_FIELD: &str = "id";

/// Kind of remote write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
  Insert,
  Update,
  Delete,
}

impl fmt::Display for ActionKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      ActionKind::Insert => "insert",
      ActionKind::Update => "update",
      ActionKind::Delete => "delete",
    };
    f.write_str(name)
  }
}

impl FromStr for ActionKind {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().as_str() {
      "insert" | "add" => Ok(ActionKind::Insert),
      "update" | "edit" => Ok(ActionKind::Update),
      "delete" | "remove" => Ok(ActionKind::Delete),
      other => Err(format!("unknown action kind: {}", other)),
    }
  }
}

/// Remote collections the outbox can write to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
  Children,
  Records,
  GrowthRecords,
  Announcements,
  CalendarEvents,
  Messages,
  Attendance,
}

impl Target {
  pub const ALL: &'static [Target] = &[
    Target::Children,
    Target::Records,
    Target::GrowthRecords,
    Target::Announcements,
    Target::CalendarEvents,
    Target::Messages,
    Target::Attendance,
  ];

  /// Remote table name.
  pub fn table(&self) -> &'static str {
    match self {
      Target::Children => "children",
      Target::Records => "records",
      Target::GrowthRecords => "growth_records",
      Target::Announcements => "announcements",
      Target::CalendarEvents => "calendar_events",
      Target::Messages => "messages",
      Target::Attendance => "attendance",
    }
  }
}

impl fmt::Display for Target {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.table())
  }
}

impl FromStr for Target {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let wanted = s.trim().to_lowercase().replace('-', "_");
    Target::ALL
      .iter()
      .find(|t| t.table() == wanted)
      .copied()
      .ok_or_else(|| format!("unknown target collection: {}", s))
  }
}

/// A mutation as requested by feature code, before it is stamped for the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionTemplate {
  pub kind: ActionKind,
  pub target: Target,
  pub payload: Value,
  pub owner: String,
}

impl ActionTemplate {
  pub fn new(kind: ActionKind, target: Target, payload: Value, owner: impl Into<String>) -> Self {
    Self {
      kind,
      target,
      payload,
      owner: owner.into(),
    }
  }

  pub fn insert(target: Target, payload: Value, owner: impl Into<String>) -> Self {
    Self::new(ActionKind::Insert, target, payload, owner)
  }

  pub fn update(target: Target, payload: Value, owner: impl Into<String>) -> Self {
    Self::new(ActionKind::Update, target, payload, owner)
  }

  pub fn delete(target: Target, payload: Value, owner: impl Into<String>) -> Self {
    Self::new(ActionKind::Delete, target, payload, owner)
  }

  /// Assign a fresh id and enqueue timestamp.
  pub fn stamp(self) -> OfflineAction {
    OfflineAction {
      id: Uuid::new_v4(),
      kind: self.kind,
      target: self.target,
      payload: self.payload,
      enqueued_at: Utc::now(),
      owner: self.owner,
    }
  }
}

/// A single pending write, as persisted in the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineAction {
  pub id: Uuid,
  pub kind: ActionKind,
  pub target: Target,
  pub payload: Value,
  pub enqueued_at: DateTime<Utc>,
  pub owner: String,
}

impl OfflineAction {
  /// Identity of the addressed remote record, rendered for a query filter.
  pub fn identity(&self) -> Option<String> {
    match self.payload.get(IDENTITY_FIELD)? {
      Value::String(s) if !s.is_empty() => Some(s.clone()),
      Value::Number(n) => Some(n.to_string()),
      _ => None,
    }
  }

  /// Short description for log lines.
  pub fn describe(&self) -> String {
    format!("{} {} ({})", self.kind, self.target, self.id)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_target_parse() {
    assert_eq!("children".parse::<Target>(), Ok(Target::Children));
    assert_eq!("growth-records".parse::<Target>(), Ok(Target::GrowthRecords));
    assert_eq!(" Calendar_Events ".parse::<Target>(), Ok(Target::CalendarEvents));
    assert!("invoices".parse::<Target>().is_err());
  }

  #[test]
  fn test_target_serializes_as_table_name() {
    for target in Target::ALL {
      let encoded = serde_json::to_value(target).unwrap();
      assert_eq!(encoded, json!(target.table()));
    }
  }

  #[test]
  fn test_kind_aliases() {
    assert_eq!("add".parse::<ActionKind>(), Ok(ActionKind::Insert));
    assert_eq!("UPDATE".parse::<ActionKind>(), Ok(ActionKind::Update));
    assert_eq!("remove".parse::<ActionKind>(), Ok(ActionKind::Delete));
    assert!("upsert".parse::<ActionKind>().is_err());
  }

  #[test]
  fn test_stamp_assigns_unique_ids() {
    let template = ActionTemplate::insert(Target::Children, json!({"name": "Aoi"}), "staff-1");
    let a = template.clone().stamp();
    let b = template.stamp();
    assert_ne!(a.id, b.id);
    assert_eq!(a.owner, "staff-1");
    assert_eq!(a.payload, json!({"name": "Aoi"}));
  }

  #[test]
  fn test_identity() {
    let action =
      ActionTemplate::update(Target::Children, json!({"id": "c-1", "name": "Ren"}), "u").stamp();
    assert_eq!(action.identity().as_deref(), Some("c-1"));

    let action = ActionTemplate::delete(Target::Records, json!({"id": 42}), "u").stamp();
    assert_eq!(action.identity().as_deref(), Some("42"));

    let action = ActionTemplate::delete(Target::Records, json!({"id": ""}), "u").stamp();
    assert_eq!(action.identity(), None);

    let action = ActionTemplate::delete(Target::Records, json!({}), "u").stamp();
    assert_eq!(action.identity(), None);
  }
}
