// Service layer: business operations with a single commit boundary
//
// A service operation opens exactly one session, performs its repository
// calls, commits on success and rolls back on any failure. Partial writes
// are never visible to other sessions. Business-rule checks that read one
// entity before writing another live here, not in the repositories.

pub mod users;

pub use users::UserService;
