use serde::{Deserialize, Serialize};
use std::fmt;

/// Who initiated a ledger operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Actor {
    #[default]
    System,
    User(String),
    Admin(String),
}

impl Actor {
    /// Admin id, if the actor is an admin
    pub fn admin_id(&self) -> Option<&str> {
        match self {
            Actor::Admin(id) => Some(id),
            _ => None,
        }
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::System => write!(f, "system"),
            Actor::User(id) => write!(f, "user:{}", id),
            Actor::Admin(id) => write!(f, "admin:{}", id),
        }
    }
}
