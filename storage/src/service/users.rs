// User service: business operations over the users resource

use crate::db::backend::Backend;
use crate::db::repositories::query::{Filter, Page};
use crate::db::repositories::user::{InsertUser, PatchUser};
use crate::db::repositories::UserRepository;
use crate::db::session::{Session, SessionManager};
use crate::errors::StoreError;
use crate::models::{User, UserCreate, UserUpdate};
use tracing::{debug, instrument, warn};

fn hash_password(plain: &str) -> Result<String, StoreError> {
    bcrypt::hash(plain, bcrypt::DEFAULT_COST).map_err(|e| StoreError::PasswordHash(e.to_string()))
}

/// Business operations for the template's built-in users resource
///
/// Every public method is one unit of work: commit on success, rollback on
/// any failure.
pub struct UserService<B: Backend> {
    sessions: SessionManager<B>,
    repo: UserRepository,
}

impl<B: Backend> Clone for UserService<B> {
    fn clone(&self) -> Self {
        Self {
            sessions: self.sessions.clone(),
            repo: self.repo,
        }
    }
}

impl<B: Backend> UserService<B> {
    pub fn new(sessions: SessionManager<B>) -> Self {
        Self {
            sessions,
            repo: UserRepository::new(),
        }
    }

    /// Commit on success, roll back on failure; the session is finalized
    /// exactly once either way
    async fn finalize<T>(
        mut session: Session<B>,
        result: Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        match result {
            Ok(value) => {
                session.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if session.is_open() {
                    if let Err(rollback_err) = session.rollback().await {
                        warn!(error = %rollback_err, "Rollback failed while handling an error");
                    }
                }
                Err(err)
            }
        }
    }

    /// Create a user with a hashed password
    ///
    /// Checks email uniqueness by reading first, so the caller gets the
    /// typed conflict even when another non-unique store field would fail
    /// later in the same request; the store's own constraint still backs
    /// this up against concurrent creates.
    #[instrument(skip(self, input), fields(email = %input.email, username = %input.username))]
    pub async fn create_user(&self, input: UserCreate) -> Result<User, StoreError> {
        let hashed_password = hash_password(&input.password)?;
        let mut session = self.sessions.open().await?;
        let result = self
            .create_user_in(&mut session, input, hashed_password)
            .await;
        Self::finalize(session, result).await
    }

    async fn create_user_in(
        &self,
        session: &mut Session<B>,
        input: UserCreate,
        hashed_password: String,
    ) -> Result<User, StoreError> {
        if self
            .repo
            .find_by_email(session, &input.email)
            .await?
            .is_some()
        {
            return Err(StoreError::UniqueConstraintViolation {
                table: "users".to_string(),
                field: "email".to_string(),
            });
        }

        let user = self
            .repo
            .create(
                session,
                &InsertUser {
                    email: input.email,
                    username: input.username,
                    hashed_password,
                    full_name: input.full_name,
                    is_active: input.is_active,
                    is_superuser: input.is_superuser,
                },
            )
            .await?;
        debug!(user_id = user.id, "User created");
        Ok(user)
    }

    /// Fetch one user; `NotFound` when absent
    #[instrument(skip(self))]
    pub async fn get_user(&self, id: i64) -> Result<User, StoreError> {
        let mut session = self.sessions.open().await?;
        let result = self.repo.get(&mut session, id).await;
        Self::finalize(session, result).await
    }

    /// List users ordered by id ascending
    #[instrument(skip(self))]
    pub async fn list_users(&self, offset: u64, limit: u64) -> Result<Vec<User>, StoreError> {
        let mut session = self.sessions.open().await?;
        let result = self
            .repo
            .list(&mut session, &Filter::new(), &Page::new(offset, limit))
            .await;
        Self::finalize(session, result).await
    }

    /// Apply a partial update; a password change is re-hashed
    #[instrument(skip(self, update), fields(user_id = id))]
    pub async fn update_user(&self, id: i64, update: UserUpdate) -> Result<User, StoreError> {
        let hashed_password = match &update.password {
            Some(plain) => Some(hash_password(plain)?),
            None => None,
        };
        let patch = PatchUser {
            email: update.email,
            username: update.username,
            hashed_password,
            full_name: update.full_name,
            is_active: update.is_active,
            is_superuser: update.is_superuser,
        };

        let mut session = self.sessions.open().await?;
        let result = self.repo.update(&mut session, id, &patch).await;
        Self::finalize(session, result).await
    }

    /// Delete a user; returns whether one existed
    #[instrument(skip(self))]
    pub async fn delete_user(&self, id: i64) -> Result<bool, StoreError> {
        let mut session = self.sessions.open().await?;
        let result = self.repo.delete(&mut session, id).await;
        Self::finalize(session, result).await
    }

    /// Verify credentials; `None` on unknown email or wrong password
    #[instrument(skip(self, password))]
    pub async fn authenticate(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Option<User>, StoreError> {
        let mut session = self.sessions.open().await?;
        let result = self.repo.find_by_email(&mut session, email).await;
        let user = Self::finalize(session, result).await?;

        let Some(user) = user else {
            return Ok(None);
        };
        let valid = bcrypt::verify(password, &user.hashed_password)
            .map_err(|e| StoreError::PasswordHash(e.to_string()))?;
        Ok(valid.then_some(user))
    }
}
