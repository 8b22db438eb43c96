// Middleware 模块 - Axum 中间件

pub mod access_log;
pub mod auth;

pub use access_log::access_log_middleware;
pub use auth::{admin_auth_middleware, AdminSecurity};
