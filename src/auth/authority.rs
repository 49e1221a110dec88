//! Authority derivation from a tenant identifier.

use once_cell::sync::Lazy;
use regex::Regex;

/// Base URL of the Microsoft identity platform.
pub const LOGIN_BASE_URL: &str = "https://login.microsoftonline.com";

/// Suffix appended to short tenant names.
pub const TENANT_DOMAIN_SUFFIX: &str = ".onmicrosoft.com";

/// Multi-tenant keywords accepted verbatim.
///
/// `common` covers personal and work accounts, `organizations` work accounts only,
/// `consumers` personal accounts only.
pub const RESERVED_TENANTS: [&str; 3] = ["common", "organizations", "consumers"];

static UUID_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^[0-9a-f]{8}-([0-9a-f]{4}-){3}[0-9a-f]{12}$").expect("valid uuid pattern")
});

/// True if the tenant is a directory id rather than a name.
pub fn is_uuid(tenant: &str) -> bool {
    UUID_PATTERN.is_match(tenant)
}

/// Tenant segment used inside the authority URL.
pub fn tenant_name(tenant: &str) -> String {
    if is_uuid(tenant) || RESERVED_TENANTS.contains(&tenant) {
        tenant.to_string()
    } else {
        format!("{}{}", tenant, TENANT_DOMAIN_SUFFIX)
    }
}

/// Full authority URL for the tenant.
pub fn authority_url(tenant: &str) -> String {
    format!("{}/{}", LOGIN_BASE_URL, tenant_name(tenant))
}
