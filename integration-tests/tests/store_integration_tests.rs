// End-to-end tests for the data layer: pool, sessions, repositories and
// the user service working together against the in-process store

use std::time::Duration;
use storage::db::memory::MemoryBackend;
use storage::db::migrations::{builtin_migrations, MigrationTracker};
use storage::db::pool::{Pool, PoolOptions};
use storage::db::repositories::query::{Filter, Page};
use storage::db::repositories::UserRepository;
use storage::db::session::SessionManager;
use storage::errors::StoreError;
use storage::models::{User, UserCreate};
use storage::service::UserService;
use tokio::time::{sleep, Instant};

/// Pool with the users schema applied
async fn setup_pool(max_size: u32, max_overflow: u32, timeout_ms: u64) -> Pool<MemoryBackend> {
    let opts = PoolOptions {
        min_size: 0,
        max_size,
        max_overflow,
        acquire_timeout: Duration::from_millis(timeout_ms),
        health_check_on_release: true,
        shutdown_grace: Duration::from_millis(500),
    };
    let pool = Pool::new(MemoryBackend::new(), opts)
        .await
        .expect("pool init");
    MigrationTracker::new(pool.clone())
        .apply_all(&builtin_migrations())
        .await
        .expect("migrations");
    pool
}

fn user_input(email: &str, username: &str) -> UserCreate {
    UserCreate {
        email: email.to_string(),
        username: username.to_string(),
        password: "secret123".to_string(),
        full_name: None,
        is_active: true,
        is_superuser: false,
    }
}

async fn committed_users(manager: &SessionManager<MemoryBackend>) -> Vec<User> {
    let repo = UserRepository::new();
    let mut session = manager.open().await.expect("open session");
    let users = repo
        .list(&mut session, &Filter::new(), &Page::default())
        .await
        .expect("list users");
    session.rollback().await.expect("finalize read session");
    users
}

#[tokio::test]
async fn test_exhausted_pool_fails_within_timeout_window() {
    let pool = setup_pool(2, 0, 100).await;
    let manager = SessionManager::new(pool);

    let _first = manager.open().await.unwrap();
    let _second = manager.open().await.unwrap();

    let started = Instant::now();
    let err = manager.open().await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, StoreError::PoolExhausted { waited_ms: 100 }));
    assert!(elapsed >= Duration::from_millis(90), "failed too early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(1000), "hung too long: {elapsed:?}");
}

#[tokio::test]
async fn test_checked_out_never_exceeds_capacity_under_load() {
    let pool = setup_pool(2, 1, 2_000).await;
    let manager = SessionManager::new(pool.clone());
    let service = UserService::new(manager);

    let mut tasks = Vec::new();
    for i in 0..12 {
        let service = service.clone();
        tasks.push(tokio::spawn(async move {
            service
                .create_user(user_input(&format!("u{i}@example.com"), &format!("user{i}")))
                .await
        }));
    }

    // Sample the pool while the workers run
    let sampler = {
        let pool = pool.clone();
        tokio::spawn(async move {
            let mut peak = 0;
            for _ in 0..200 {
                peak = peak.max(pool.status().checked_out);
                sleep(Duration::from_millis(1)).await;
            }
            peak
        })
    };

    for task in tasks {
        task.await.unwrap().unwrap();
    }
    let peak = sampler.await.unwrap();
    assert!(peak <= 3, "checked out {peak} connections on capacity 3");
    assert_eq!(pool.status().checked_out, 0);
}

#[tokio::test]
async fn test_concurrent_creates_with_colliding_email() {
    let pool = setup_pool(4, 0, 1_000).await;
    let manager = SessionManager::new(pool);
    let service = UserService::new(manager.clone());

    let a = {
        let service = service.clone();
        tokio::spawn(async move {
            service
                .create_user(user_input("shared@example.com", "first"))
                .await
        })
    };
    let b = {
        let service = service.clone();
        tokio::spawn(async move {
            service
                .create_user(user_input("shared@example.com", "second"))
                .await
        })
    };

    let results = [a.await.unwrap(), b.await.unwrap()];
    let ok = results.iter().filter(|r| r.is_ok()).count();
    let conflicts = results
        .iter()
        .filter(|r| {
            matches!(
                r,
                Err(StoreError::UniqueConstraintViolation { ref field, .. }) if field == "email"
            )
        })
        .count();

    assert_eq!(ok, 1, "exactly one create must win");
    assert_eq!(conflicts, 1, "the loser must get the typed conflict");

    // No half-written row
    let users = committed_users(&manager).await;
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].email, "shared@example.com");
}

#[tokio::test]
async fn test_multi_step_operation_rolls_back_entirely() {
    let pool = setup_pool(2, 0, 500).await;
    let manager = SessionManager::new(pool);

    // First step writes, second step fails: nothing may stay visible
    let result: Result<(), StoreError> = manager
        .with_session(|session| {
            Box::pin(async move {
                let repo = UserRepository::new();
                repo.create(
                    session,
                    &storage::db::repositories::user::InsertUser {
                        email: "step1@example.com".to_string(),
                        username: "step1".to_string(),
                        hashed_password: "$2b$04$x".to_string(),
                        full_name: None,
                        is_active: true,
                        is_superuser: false,
                    },
                )
                .await?;
                // Second step: lookup that must exist but does not
                repo.get(session, 9_999).await?;
                Ok(())
            })
        })
        .await;

    assert!(matches!(result, Err(StoreError::NotFound { .. })));
    assert!(committed_users(&manager).await.is_empty());

    // The same unit of work pattern commits when every step succeeds
    manager
        .with_session(|session| {
            Box::pin(async move {
                let repo = UserRepository::new();
                repo.create(
                    session,
                    &storage::db::repositories::user::InsertUser {
                        email: "ok@example.com".to_string(),
                        username: "ok".to_string(),
                        hashed_password: "$2b$04$x".to_string(),
                        full_name: None,
                        is_active: true,
                        is_superuser: false,
                    },
                )
                .await?;
                Ok(())
            })
        })
        .await
        .unwrap();
    assert_eq!(committed_users(&manager).await.len(), 1);
}

#[tokio::test]
async fn test_commit_visibility_ordering() {
    let pool = setup_pool(3, 0, 500).await;
    let manager = SessionManager::new(pool);
    let service = UserService::new(manager.clone());

    let created = service
        .create_user(user_input("seen@example.com", "seen"))
        .await
        .unwrap();

    // A session beginning after the commit returned must see the row
    let repo = UserRepository::new();
    let mut session = manager.open().await.unwrap();
    let fetched = repo.get(&mut session, created.id).await.unwrap();
    assert_eq!(fetched.email, "seen@example.com");
    session.rollback().await.unwrap();
}

#[tokio::test]
async fn test_cancelled_request_releases_connection_and_discards_writes() {
    let pool = setup_pool(1, 0, 300).await;
    let manager = SessionManager::new(pool.clone());

    let stuck = {
        let manager = manager.clone();
        tokio::spawn(async move {
            let mut session = manager.open().await.unwrap();
            UserRepository::new()
                .create(
                    &mut session,
                    &storage::db::repositories::user::InsertUser {
                        email: "doomed@example.com".to_string(),
                        username: "doomed".to_string(),
                        hashed_password: "$2b$04$x".to_string(),
                        full_name: None,
                        is_active: true,
                        is_superuser: false,
                    },
                )
                .await
                .unwrap();
            // Request "hangs" here until the client gives up
            sleep(Duration::from_secs(30)).await;
            session.commit().await.unwrap();
        })
    };

    // Let the task reach the hang point, then cancel it
    sleep(Duration::from_millis(50)).await;
    stuck.abort();
    assert!(stuck.await.unwrap_err().is_cancelled());

    // The single connection is back and the write is gone
    assert_eq!(pool.status().checked_out, 0);
    assert!(committed_users(&manager).await.is_empty());
}

#[tokio::test]
async fn test_list_on_empty_store_is_an_empty_sequence() {
    let pool = setup_pool(2, 0, 500).await;
    let service = UserService::new(SessionManager::new(pool));
    let users = service.list_users(0, 10).await.unwrap();
    assert!(users.is_empty());
}

#[tokio::test]
async fn test_shutdown_after_traffic_leaves_no_connections() {
    let pool = setup_pool(2, 1, 500).await;
    let service = UserService::new(SessionManager::new(pool.clone()));

    for i in 0..5 {
        service
            .create_user(user_input(&format!("s{i}@example.com"), &format!("s{i}")))
            .await
            .unwrap();
    }

    pool.shutdown().await;
    let status = pool.status();
    assert_eq!(status.total, 0);
    assert_eq!(status.idle, 0);
    assert!(matches!(
        pool.acquire().await.unwrap_err(),
        StoreError::StoreUnavailable(_)
    ));
}
