// User repository: generic CRUD base plus user-specific lookups

use crate::db::backend::Backend;
use crate::db::repositories::query::{Filter, Page, Sort};
use crate::db::repositories::Repository;
use crate::db::session::Session;
use crate::errors::StoreError;
use crate::models::User;
use serde::Serialize;
use tracing::instrument;

/// Row payload for inserting a user; the password arrives already hashed
#[derive(Debug, Clone, Serialize)]
pub struct InsertUser {
    pub email: String,
    pub username: String,
    pub hashed_password: String,
    pub full_name: Option<String>,
    pub is_active: bool,
    pub is_superuser: bool,
}

/// Row payload for patching a user; unset fields stay untouched
#[derive(Debug, Clone, Default, Serialize)]
pub struct PatchUser {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hashed_password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_superuser: Option<bool>,
}

/// Repository for user rows
///
/// Thin wrapper over the generic base with the lookups the template's
/// service layer needs.
#[derive(Debug, Clone, Copy, Default)]
pub struct UserRepository {
    base: Repository<User>,
}

impl UserRepository {
    pub const fn new() -> Self {
        Self {
            base: Repository::new(),
        }
    }

    pub async fn get<B: Backend>(
        &self,
        session: &mut Session<B>,
        id: i64,
    ) -> Result<User, StoreError> {
        self.base.get(session, id).await
    }

    pub async fn find<B: Backend>(
        &self,
        session: &mut Session<B>,
        id: i64,
    ) -> Result<Option<User>, StoreError> {
        self.base.find(session, id).await
    }

    pub async fn list<B: Backend>(
        &self,
        session: &mut Session<B>,
        filter: &Filter,
        page: &Page,
    ) -> Result<Vec<User>, StoreError> {
        self.base
            .list(session, filter, &Sort::primary_key(), page)
            .await
    }

    pub async fn create<B: Backend>(
        &self,
        session: &mut Session<B>,
        row: &InsertUser,
    ) -> Result<User, StoreError> {
        self.base.create(session, row).await
    }

    pub async fn update<B: Backend>(
        &self,
        session: &mut Session<B>,
        id: i64,
        patch: &PatchUser,
    ) -> Result<User, StoreError> {
        self.base.update(session, id, patch).await
    }

    pub async fn delete<B: Backend>(
        &self,
        session: &mut Session<B>,
        id: i64,
    ) -> Result<bool, StoreError> {
        self.base.delete(session, id).await
    }

    /// Find a user by email
    #[instrument(skip(self, session))]
    pub async fn find_by_email<B: Backend>(
        &self,
        session: &mut Session<B>,
        email: &str,
    ) -> Result<Option<User>, StoreError> {
        let mut matches = self
            .base
            .list(
                session,
                &Filter::new().eq("email", email),
                &Sort::primary_key(),
                &Page::new(0, 1),
            )
            .await?;
        Ok(matches.pop())
    }

    /// Find a user by username
    #[instrument(skip(self, session))]
    pub async fn find_by_username<B: Backend>(
        &self,
        session: &mut Session<B>,
        username: &str,
    ) -> Result<Option<User>, StoreError> {
        let mut matches = self
            .base
            .list(
                session,
                &Filter::new().eq("username", username),
                &Sort::primary_key(),
                &Page::new(0, 1),
            )
            .await?;
        Ok(matches.pop())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::backend::{Connection as _, SchemaChange};
    use crate::db::memory::MemoryBackend;
    use crate::db::pool::{Pool, PoolOptions};
    use crate::db::repositories::Entity;
    use crate::db::session::SessionManager;

    async fn manager() -> SessionManager<MemoryBackend> {
        let backend = MemoryBackend::new();
        let mut conn = backend.connect().await.unwrap();
        conn.apply_schema(
            1,
            "create users",
            &[SchemaChange::CreateTable(User::table_schema())],
        )
        .await
        .unwrap();
        let pool = Pool::new(backend, PoolOptions::default()).await.unwrap();
        SessionManager::new(pool)
    }

    fn insert_row(email: &str, username: &str) -> InsertUser {
        InsertUser {
            email: email.to_string(),
            username: username.to_string(),
            hashed_password: "$2b$04$hash".to_string(),
            full_name: None,
            is_active: true,
            is_superuser: false,
        }
    }

    #[tokio::test]
    async fn test_find_by_email_and_username() {
        let manager = manager().await;
        let repo = UserRepository::new();
        let mut session = manager.open().await.unwrap();

        let created = repo
            .create(&mut session, &insert_row("a@example.com", "alice"))
            .await
            .unwrap();

        let by_email = repo
            .find_by_email(&mut session, "a@example.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_email.id, created.id);

        let by_username = repo
            .find_by_username(&mut session, "alice")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_username.id, created.id);

        assert!(repo
            .find_by_email(&mut session, "nobody@example.com")
            .await
            .unwrap()
            .is_none());
        session.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_email_rejected_by_store() {
        let manager = manager().await;
        let repo = UserRepository::new();
        let mut session = manager.open().await.unwrap();

        repo.create(&mut session, &insert_row("a@example.com", "alice"))
            .await
            .unwrap();
        let err = repo
            .create(&mut session, &insert_row("a@example.com", "bob"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::UniqueConstraintViolation { ref field, .. } if field == "email"
        ));
        session.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_patch_changes_only_provided_fields() {
        let manager = manager().await;
        let repo = UserRepository::new();
        let mut session = manager.open().await.unwrap();

        let created = repo
            .create(&mut session, &insert_row("a@example.com", "alice"))
            .await
            .unwrap();
        let patched = repo
            .update(
                &mut session,
                created.id,
                &PatchUser {
                    full_name: Some("Alice A.".to_string()),
                    ..PatchUser::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(patched.full_name.as_deref(), Some("Alice A."));
        assert_eq!(patched.email, "a@example.com");
        assert_eq!(patched.username, "alice");
        session.commit().await.unwrap();
    }
}
