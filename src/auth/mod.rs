//! Credential hashing and bearer tokens

mod password;
mod token;

pub use password::PasswordHasher;
pub use token::{TokenError, TokenService};
