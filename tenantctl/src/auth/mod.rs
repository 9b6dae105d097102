//! Credentials and capability tokens.
//!
//! Tenants have no sessions. An admin proves who they are once (password login) and receives a
//! short-lived access token; sensitive one-time actions are authorized by purpose-scoped tokens
//! that arrive by e-mail instead.
//!
//! # Modules
//!
//! - [`password`]: Admin password hashing and verification using Argon2
//! - [`tokens`]: Capability token issuer (access, reset, email change, download)

pub mod password;
pub mod tokens;
