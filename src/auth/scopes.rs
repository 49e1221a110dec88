//! Scope resolution for Graph and SharePoint targets.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

/// Scope prefix used when no server is given.
pub const GRAPH_SCOPE_BASE: &str = "https://graph.microsoft.com/";

/// Permission requested when the caller does not name any.
pub const DEFAULT_PERMISSION: &str = ".default";

static SHAREPOINT_HOST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^https://(?P<tenant>\w+(-my)?)\.sharepoint\.com/").expect("valid sharepoint pattern")
});

/// Build fully-qualified scopes for `permissions` against `server`.
///
/// `None` targets Microsoft Graph. SharePoint tenant hosts (including the `-my`
/// OneDrive host) are reduced to their origin. Any other server URL is used as
/// the prefix verbatim.
pub fn resolve_scopes(server: Option<&str>, permissions: &[String]) -> Vec<String> {
    let default_permissions = [DEFAULT_PERMISSION.to_string()];
    let permissions = if permissions.is_empty() {
        &default_permissions[..]
    } else {
        permissions
    };

    let prefix = match server {
        None => GRAPH_SCOPE_BASE.to_string(),
        Some(server) => match SHAREPOINT_HOST.captures(server) {
            Some(caps) => format!("https://{}.sharepoint.com/", &caps["tenant"]),
            None => {
                debug!(
                    "Server {} is not a SharePoint host, using it as scope prefix",
                    server
                );
                format!("{}/", server.trim_end_matches('/'))
            }
        },
    };

    let scopes: Vec<String> = permissions
        .iter()
        .map(|p| format!("{}{}", prefix, p))
        .collect();
    debug!("Resolved scopes: {:?}", scopes);
    scopes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn perms(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_graph_default() {
        let scopes = resolve_scopes(None, &perms(&["User.Read", "Files.ReadWrite"]));
        assert_eq!(
            scopes,
            vec![
                "https://graph.microsoft.com/User.Read",
                "https://graph.microsoft.com/Files.ReadWrite"
            ]
        );
    }

    #[test]
    fn test_empty_permissions_use_default() {
        assert_eq!(
            resolve_scopes(None, &[]),
            vec!["https://graph.microsoft.com/.default"]
        );
    }

    #[test]
    fn test_sharepoint_onedrive_host() {
        let scopes = resolve_scopes(
            Some("https://contoso-my.sharepoint.com/sites/x"),
            &perms(&[".default"]),
        );
        assert_eq!(scopes, vec!["https://contoso-my.sharepoint.com/.default"]);
    }

    #[test]
    fn test_sharepoint_site_host() {
        let scopes = resolve_scopes(
            Some("https://contoso.sharepoint.com/sites/team/Shared Documents"),
            &perms(&["AllSites.Read"]),
        );
        assert_eq!(scopes, vec!["https://contoso.sharepoint.com/AllSites.Read"]);
    }

    #[test]
    fn test_unknown_server_falls_back() {
        let scopes = resolve_scopes(Some("https://intranet.example.org/"), &perms(&[".default"]));
        assert_eq!(scopes, vec!["https://intranet.example.org/.default"]);
    }
}
