pub mod auth;
pub mod error_handling;

pub use auth::{bearer_token, AuthUser, Claims, JwtVerifier};
