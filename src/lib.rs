//! Delegated credential acquisition for Microsoft 365.
//!
//! Two credential kinds are provided: OAuth access tokens obtained through
//! Entra ID ([`auth`]), and Forms session cookies harvested from a real
//! browser sign-in ([`forms`]). Both persist through [`cache`].

#![deny(clippy::all)]

pub mod auth;
pub mod browser;
pub mod cache;
pub mod client_ids;
pub mod config;
pub mod error;
pub mod forms;
