//! Microsoft Forms web API access through a browser-harvested session.

pub mod antiforgery;
pub mod harvester;
pub mod session;

pub use harvester::{CapturedBearer, CookieCredential, CookieSessionHarvester, HarvestSettings};
pub use session::{FormsClient, HttpSession};
