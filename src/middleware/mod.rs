//! Middleware for request logging and admin access control.

pub mod admin_auth;
pub mod logging;

pub use admin_auth::{require_admin, AdminAuthError, AdminToken};
pub use logging::{request_logging, ErrorKind};
