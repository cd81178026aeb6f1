pub mod app;
pub mod authz;
pub mod config;
pub mod db;
pub mod errors;
pub mod events;
pub mod rbac;
