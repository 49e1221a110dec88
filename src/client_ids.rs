//! Candidate client IDs for `check-client-ids`.
//!
//! Input is either the Enterprise applications CSV export from the Entra
//! admin center (`displayName`, `appId`, `applicationType` columns) or a plain
//! list with one client ID or app launcher URL per line. Outcomes go to a
//! results CSV that is rewritten after every check, so an interrupted run
//! resumes where it stopped.

use crate::error::AppError;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use url::Url;

/// Application type of Microsoft first-party apps in the export. Those cannot
/// be used as a client for a third-party sign-in and are never tried.
pub const FIRST_PARTY_APPLICATION: &str = "Microsoft Application";

/// One client ID to try.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub display_name: String,
    pub client_id: String,
    pub application_type: Option<String>,
}

impl Candidate {
    pub fn is_first_party(&self) -> bool {
        self.application_type
            .as_deref()
            .is_some_and(|t| t.eq_ignore_ascii_case(FIRST_PARTY_APPLICATION))
    }
}

/// Row of the Enterprise applications export. Other columns are ignored.
#[derive(Debug, Deserialize)]
struct EnterpriseApp {
    #[serde(rename = "displayName", default)]
    display_name: String,
    #[serde(rename = "appId", alias = "appID", alias = "AppId")]
    app_id: Option<String>,
    #[serde(rename = "applicationType", default)]
    application_type: Option<String>,
}

/// Parse candidates from an export or a plain list.
pub fn read_candidates(contents: &str) -> Result<Vec<Candidate>, AppError> {
    let contents = contents.trim_start_matches('\u{feff}');
    let header = contents.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    if !(header.contains(',') && header.to_ascii_lowercase().contains("appid")) {
        return Ok(contents
            .lines()
            .filter_map(parse_client_id)
            .map(|client_id| Candidate {
                display_name: client_id.clone(),
                client_id,
                application_type: None,
            })
            .collect());
    }

    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(contents.as_bytes());

    let mut candidates = Vec::new();
    for row in reader.deserialize::<EnterpriseApp>() {
        let row = row?;
        let Some(client_id) = row.app_id.filter(|id| !id.is_empty()) else {
            continue;
        };
        candidates.push(Candidate {
            display_name: row.display_name,
            client_id,
            application_type: row.application_type.filter(|t| !t.is_empty()),
        });
    }
    Ok(candidates)
}

/// Extract a client id from a bare id or an app launcher URL carrying
/// `client_id`, `clientId` or `appId` in its query string.
pub fn parse_client_id(input: &str) -> Option<String> {
    let input = input.trim();
    if input.is_empty() || input.starts_with('#') {
        return None;
    }

    match Url::parse(input) {
        Ok(url) => url
            .query_pairs()
            .find(|(k, _)| {
                k.eq_ignore_ascii_case("client_id")
                    || k.eq_ignore_ascii_case("clientid")
                    || k.eq_ignore_ascii_case("appid")
            })
            .map(|(_, v)| v.into_owned()),
        Err(_) => Some(input.to_string()),
    }
}

/// Outcome of trying one client ID. No error means the client works.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub display_name: String,
    pub client_id: String,
    pub error: Option<String>,
}

impl CheckResult {
    pub fn is_usable(&self) -> bool {
        self.error.is_none()
    }
}

/// Results CSV of a (possibly interrupted) run.
#[derive(Debug)]
pub struct ResultLog {
    path: PathBuf,
    results: Vec<CheckResult>,
}

impl ResultLog {
    /// Load earlier results from `path`; a missing file starts an empty log.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, AppError> {
        let path = path.into();
        let results = match csv::Reader::from_path(&path) {
            Ok(mut reader) => reader.deserialize().collect::<Result<Vec<_>, _>>()?,
            Err(e) if matches!(e.kind(), csv::ErrorKind::Io(io) if io.kind() == ErrorKind::NotFound) => {
                Vec::new()
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, results })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn results(&self) -> &[CheckResult] {
        &self.results
    }

    pub fn is_checked(&self, client_id: &str) -> bool {
        self.results
            .iter()
            .any(|r| r.client_id.eq_ignore_ascii_case(client_id))
    }

    pub fn usable(&self) -> impl Iterator<Item = &CheckResult> {
        self.results.iter().filter(|r| r.is_usable())
    }

    /// Add a result and rewrite the file.
    pub fn record(&mut self, result: CheckResult) -> Result<(), AppError> {
        self.results.push(result);
        let mut writer = csv::Writer::from_path(&self.path)?;
        for result in &self.results {
            writer.serialize(result)?;
        }
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXPORT: &str = "\u{feff}id,displayName,appId,applicationType,createdDateTime\n\
        1,\"Contoso Reports, Internal\",11111111-1111-1111-1111-111111111111,Enterprise Application,2023-01-01\n\
        2,Office 365 Management,00b41c95-dab0-4487-9791-b9d2c32c80f2,Microsoft Application,2020-01-01\n\
        3,No Id,,Enterprise Application,2021-01-01\n";

    #[test]
    fn test_reads_enterprise_apps_export() {
        let candidates = read_candidates(EXPORT).unwrap();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].display_name, "Contoso Reports, Internal");
        assert_eq!(candidates[0].client_id, "11111111-1111-1111-1111-111111111111");
        assert!(!candidates[0].is_first_party());
        assert!(candidates[1].is_first_party());
    }

    #[test]
    fn test_app_id_column_spelling() {
        let export = "displayName,appID\nLegacy,22222222-2222-2222-2222-222222222222\n";
        let candidates = read_candidates(export).unwrap();
        assert_eq!(candidates[0].client_id, "22222222-2222-2222-2222-222222222222");
        assert_eq!(candidates[0].application_type, None);
    }

    #[test]
    fn test_reads_plain_list() {
        let list = "# candidates\n\
            d3590ed6-52b3-4102-aeff-aad2292ab01c\n\
            \n\
            https://launcher.myapps.microsoft.com/api/signin/x?tenantId=t&appId=abc\n";
        let candidates = read_candidates(list).unwrap();
        let ids: Vec<_> = candidates.iter().map(|c| c.client_id.as_str()).collect();
        assert_eq!(ids, vec!["d3590ed6-52b3-4102-aeff-aad2292ab01c", "abc"]);
    }

    #[test]
    fn test_parse_client_id() {
        assert_eq!(
            parse_client_id("  d3590ed6-52b3-4102-aeff-aad2292ab01c "),
            Some("d3590ed6-52b3-4102-aeff-aad2292ab01c".into())
        );
        assert_eq!(
            parse_client_id("https://login.microsoftonline.com/common/oauth2/v2.0/authorize?client_id=xyz"),
            Some("xyz".into())
        );
        assert_eq!(parse_client_id("https://example.com/no-id"), None);
        assert_eq!(parse_client_id("# comment"), None);
        assert_eq!(parse_client_id("   "), None);
    }

    #[test]
    fn test_result_log_resumes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client_ids_alice.csv");

        let mut log = ResultLog::open(&path).unwrap();
        assert!(log.results().is_empty());
        log.record(CheckResult {
            display_name: "Contoso Reports, Internal".into(),
            client_id: "11111111-1111-1111-1111-111111111111".into(),
            error: None,
        })
        .unwrap();
        log.record(CheckResult {
            display_name: "Office 365 Management".into(),
            client_id: "00b41c95-dab0-4487-9791-b9d2c32c80f2".into(),
            error: Some(FIRST_PARTY_APPLICATION.into()),
        })
        .unwrap();

        let reopened = ResultLog::open(&path).unwrap();
        assert_eq!(reopened.results(), log.results());
        assert!(reopened.is_checked("00B41C95-DAB0-4487-9791-B9D2C32C80F2"));
        assert!(!reopened.is_checked("33333333-3333-3333-3333-333333333333"));
        let usable: Vec<_> = reopened.usable().map(|r| r.display_name.as_str()).collect();
        assert_eq!(usable, vec!["Contoso Reports, Internal"]);
    }
}
