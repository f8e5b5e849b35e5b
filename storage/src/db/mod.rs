// Database layer: pool, sessions, repositories, migrations

pub mod backend;
pub mod memory;
pub mod migrations;
pub mod pool;
pub mod repositories;
pub mod session;

pub use memory::MemoryBackend;
pub use pool::{Pool, PoolOptions, PoolStatus};
pub use session::{Session, SessionManager};
