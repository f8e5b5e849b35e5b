// Entity types for the template's built-in "users" resource

use crate::db::backend::TableSchema;
use crate::db::repositories::Entity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A registered user
///
/// Immutable snapshot once read; write operations return a new snapshot.
/// The password is stored as a bcrypt hash and never serialized back out to
/// API responses (that mapping is the HTTP layer's concern).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub username: String,
    pub hashed_password: String,
    #[serde(default)]
    pub full_name: Option<String>,
    pub is_active: bool,
    pub is_superuser: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity for User {
    const TABLE: &'static str = "users";

    fn table_schema() -> TableSchema {
        TableSchema::new(Self::TABLE)
            .with_unique("email")
            .with_unique("username")
    }

    fn id(&self) -> i64 {
        self.id
    }
}

/// Input for creating a user; the service hashes the plain password
#[derive(Debug, Clone, Deserialize)]
pub struct UserCreate {
    pub email: String,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub is_superuser: bool,
}

fn default_active() -> bool {
    true
}

/// Partial update; unset fields leave the stored value untouched
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserUpdate {
    pub email: Option<String>,
    pub username: Option<String>,
    /// Plain password; re-hashed by the service when present
    pub password: Option<String>,
    pub full_name: Option<String>,
    pub is_active: Option<bool>,
    pub is_superuser: Option<bool>,
}

impl UserUpdate {
    pub fn is_empty(&self) -> bool {
        self.email.is_none()
            && self.username.is_none()
            && self.password.is_none()
            && self.full_name.is_none()
            && self.is_active.is_none()
            && self.is_superuser.is_none()
    }
}
