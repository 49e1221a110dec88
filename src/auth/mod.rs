//! Delegated OAuth token acquisition against Entra ID.
//!
//! Resolves the authority and scopes for a principal, serves and refreshes
//! tokens from the persisted cache, and falls back to an interactive browser
//! sign-in (authorization code with PKCE) when silent refresh is not possible.

pub mod authority;
pub mod callback_server;
pub mod claims;
pub mod interactive;
pub mod oauth;
pub mod scopes;
pub mod silent;
pub mod token_manager;

pub use claims::DecodedClaims;
pub use oauth::TokenResult;
pub use token_manager::{BearerTokenProvider, Principal, TokenAuthority};
