//! Role-based access control.
//!
//! Roles own sets of `resource:action` permissions; users receive roles through
//! assignments that may be scoped (`project`/`p1`) and time-bounded. The
//! [`RbacPolicyEngine`] reads assignments through an [`RbacStore`] and caches the
//! resolved grants per user; [`RbacService`] manages the data and keeps that cache
//! honest.

pub mod cache;
pub mod engine;
pub mod memory;
pub mod models;
pub mod service;
pub mod sqlite;
pub mod store;

pub use cache::{Grant, PermissionCache};
pub use engine::{RbacEngineOptions, RbacPolicyEngine, RBAC_ENGINE};
pub use memory::MemoryRbacStore;
pub use models::{NewAssignment, NewRole, Permission, Role, RoleUpdate, UserRole};
pub use service::RbacService;
pub use sqlite::SqliteRbacStore;
pub use store::RbacStore;
