pub mod auth;
pub mod config;

pub use auth::{Auther, AuthError, Manager, Permission, Role, User};
pub use config::AuthConfig;
