//! Change descriptors delivered by the host persistence layer.
//!
//! The state machine never interprets a [`ChangedObject`]; it only forwards it
//! to the cached instance so the instance can decide whether it survives the
//! change (see [`crate::CacheImplementation::on_change`]).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Kind of mutation that was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeType {
    Create,
    Update,
    Delete,
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeType::Create => "create",
            ChangeType::Update => "update",
            ChangeType::Delete => "delete",
        };
        write!(f, "{}", s)
    }
}

/// Description of one persistent object mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangedObject {
    /// Host-defined name of the mutated entity type.
    pub entity_type: String,
    pub entity_id: Option<Uuid>,
    pub change_type: ChangeType,
    /// Names of the properties covered by `previous_state` / `current_state`.
    pub property_names: Vec<String>,
    /// Property values before the change (`Null` on create).
    pub previous_state: Value,
    /// Property values after the change (`Null` on delete).
    pub current_state: Value,
}

impl ChangedObject {
    pub fn new(entity_type: impl Into<String>, change_type: ChangeType) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: None,
            change_type,
            property_names: Vec::new(),
            previous_state: Value::Null,
            current_state: Value::Null,
        }
    }

    pub fn with_entity_id(mut self, id: Uuid) -> Self {
        self.entity_id = Some(id);
        self
    }

    /// Attach the changed properties and their before/after values.
    pub fn with_states(
        mut self,
        property_names: Vec<String>,
        previous_state: Value,
        current_state: Value,
    ) -> Self {
        self.property_names = property_names;
        self.previous_state = previous_state;
        self.current_state = current_state;
        self
    }

    /// Whether the named property is part of this change.
    pub fn touches(&self, property: &str) -> bool {
        self.property_names.iter().any(|p| p == property)
    }
}

impl fmt::Display for ChangedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.entity_id {
            Some(id) => write!(f, "{} {} {}", self.change_type, self.entity_type, id),
            None => write!(f, "{} {}", self.change_type, self.entity_type),
        }
    }
}
