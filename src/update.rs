//!
//! Update check collaborator.
//!
//! Decides whether the installed software should look for a newer release today, picks the
//! release to install from a package index, and stops the background wallet process before
//! installed files are replaced. Installing packages is left to the caller.

use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Release requested when no explicit version is given
pub const LATEST: &str = "latest";

static STABLE_VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d\.\d(\.\d)?$").expect("valid stable version pattern"));
static VERSION_COMPONENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+|[A-Za-z]+").expect("valid version component pattern"));

/// Update check errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpdateError {
    #[error("Cannot reach the package index: {0}")]
    Connection(String),

    #[error("Version {0} not found in the package index")]
    VersionNotFound(String),

    #[error("Installed version could not be detected")]
    VersionNotDetected,

    #[error("Malformed package index response: {0}")]
    Data(String),
}

impl From<reqwest::Error> for UpdateError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            UpdateError::Data(e.to_string())
        } else {
            UpdateError::Connection(e.to_string())
        }
    }
}

/// Persistent state of the update check
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateCheckConfig {
    /// Day of the last check, serialized as `%Y-%m-%d`
    pub last_update_check: Option<NaiveDate>,
}

/// Whether an update check already happened on `today`.
pub fn checked_for_update_today(last_update_check: Option<NaiveDate>, today: NaiveDate) -> bool {
    match last_update_check {
        Some(last) => today <= last,
        None => false,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum VersionComponent {
    Alpha(String),
    Number(u64),
}

/// Version compared component-wise, numeric runs numerically and letter runs
/// lexicographically. Letter runs sort below numbers, so `1.0rc1 < 1.0.1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LooseVersion {
    raw: String,
    components: Vec<VersionComponent>,
}

impl LooseVersion {
    pub fn parse(raw: &str) -> Self {
        let components = VERSION_COMPONENT
            .find_iter(raw)
            .map(|m| match m.as_str().parse::<u64>() {
                Ok(n) => VersionComponent::Number(n),
                Err(_) => VersionComponent::Alpha(m.as_str().to_ascii_lowercase()),
            })
            .collect();
        Self {
            raw: raw.to_string(),
            components,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl PartialOrd for LooseVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LooseVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.components.cmp(&other.components)
    }
}

impl fmt::Display for LooseVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// One release listed by the package index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRelease {
    pub version: String,
}

#[derive(Debug, Deserialize)]
struct PackageListing {
    packages: Vec<PackageRelease>,
}

/// Pick the release matching `requested` from `packages`, listed newest first.
///
/// `latest` selects the first stable `major.minor[.patch]` release. Anything else is a
/// version, commit or tag: an exact match wins over the first release containing it.
pub fn select_release(packages: &[PackageRelease], requested: &str) -> Result<String, UpdateError> {
    let found = if requested == LATEST {
        packages.iter().find(|p| STABLE_VERSION.is_match(&p.version))
    } else {
        packages
            .iter()
            .find(|p| p.version == requested)
            .or_else(|| packages.iter().find(|p| p.version.contains(requested)))
    };

    found
        .map(|p| p.version.clone())
        .ok_or_else(|| UpdateError::VersionNotFound(requested.to_string()))
}

/// Source of published releases
#[async_trait::async_trait]
pub trait PackageIndex: Send + Sync {
    async fn releases(&self) -> Result<Vec<PackageRelease>, UpdateError>;
}

/// Package index served over HTTP at `{host}/api/package/{name}/`
pub struct HttpPackageIndex {
    http_client: reqwest::Client,
    url: String,
}

impl HttpPackageIndex {
    pub fn new(host: &str, package: &str, timeout: Duration) -> Result<Self, UpdateError> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| UpdateError::Connection(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            http_client,
            url: format!("{}/api/package/{}/", host.trim_end_matches('/'), package),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait::async_trait]
impl PackageIndex for HttpPackageIndex {
    async fn releases(&self) -> Result<Vec<PackageRelease>, UpdateError> {
        debug!("GET {}", self.url);
        let body = self.http_client.get(&self.url).send().await?.text().await?;
        let listing: PackageListing =
            serde_json::from_str(&body).map_err(|e| UpdateError::Data(e.to_string()))?;
        Ok(listing.packages)
    }
}

/// Result of an update check
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateStatus {
    /// Whether the index was consulted at all
    pub checked: bool,
    pub update_available: bool,
    pub latest_version: Option<String>,
}

/// Compares the installed version against a package index
pub struct UpdateChecker<I> {
    index: I,
    installed_version: String,
}

impl<I: PackageIndex> UpdateChecker<I> {
    pub fn new(index: I, installed_version: impl Into<String>) -> Self {
        Self {
            index,
            installed_version: installed_version.into(),
        }
    }

    /// Check for an update, at most once per day unless `force` is set.
    ///
    /// Today's date is recorded in `config` before the index is queried, so a failing
    /// index is not retried until tomorrow. An explicitly requested version always counts
    /// as an available update.
    pub async fn check(
        &self,
        config: &mut UpdateCheckConfig,
        today: NaiveDate,
        requested: &str,
        force: bool,
    ) -> Result<UpdateStatus, UpdateError> {
        if !force && checked_for_update_today(config.last_update_check, today) {
            debug!("Already checked for an update on {}", today);
            return Ok(UpdateStatus::default());
        }
        config.last_update_check = Some(today);

        if self.installed_version.is_empty() {
            return Err(UpdateError::VersionNotDetected);
        }

        let releases = self.index.releases().await?;
        let latest = select_release(&releases, requested)?;
        let update_available = requested != LATEST
            || LooseVersion::parse(&latest) > LooseVersion::parse(&self.installed_version);

        if update_available {
            info!("Version {} is available (installed {})", latest, self.installed_version);
        } else {
            info!("Installed version {} is up to date", self.installed_version);
        }

        Ok(UpdateStatus {
            checked: true,
            update_available,
            latest_version: Some(latest),
        })
    }
}

/// Errors reported by a wallet daemon controller
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Daemon error: {0}")]
    Daemon(String),
}

/// Control over the background wallet process
pub trait WalletDaemon {
    fn started(&self) -> Result<bool, DaemonError>;

    /// Stop the process, returning whether it stopped
    fn stop(&self) -> Result<bool, DaemonError>;
}

/// Stop the background wallet process if it is running. Returns `false` only when the
/// daemon is known to still be running; OS-level errors count as success.
pub fn stop_background_wallet_process(daemon: &dyn WalletDaemon) -> bool {
    let result = daemon
        .started()
        .and_then(|started| if started { daemon.stop() } else { Ok(true) });

    match result {
        Ok(stopped) => stopped,
        Err(DaemonError::Io(e)) => {
            debug!("Ignoring OS error while stopping the wallet daemon: {}", e);
            true
        }
        Err(e) => {
            warn!("Failed to stop the wallet daemon: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn releases(versions: &[&str]) -> Vec<PackageRelease> {
        versions
            .iter()
            .map(|v| PackageRelease {
                version: v.to_string(),
            })
            .collect()
    }

    #[test]
    fn test_checked_today() {
        let today = day("2016-03-10");
        assert!(!checked_for_update_today(None, today));
        assert!(!checked_for_update_today(Some(day("2016-03-09")), today));
        assert!(checked_for_update_today(Some(today), today));
        // a date in the future also counts as checked
        assert!(checked_for_update_today(Some(day("2016-03-11")), today));
    }

    #[test]
    fn test_config_date_format() {
        let config = UpdateCheckConfig {
            last_update_check: Some(day("2016-03-10")),
        };
        assert_eq!(
            serde_json::to_string(&config).unwrap(),
            r#"{"last_update_check":"2016-03-10"}"#
        );
    }

    #[test]
    fn test_loose_version_ordering() {
        let v = LooseVersion::parse;
        assert!(v("3.10.0") > v("3.9.8"));
        assert!(v("1.0.1") > v("1.0"));
        assert!(v("1.0.1") > v("1.0rc1"));
        assert!(v("2.0") == v("2.0"));
        assert_eq!(v("3.2.1").to_string(), "3.2.1");
    }

    #[test]
    fn test_select_release() {
        let packages = releases(&["3.10.0rc1", "3.9.8", "3.9.7", "8e15eb1-dev"]);
        assert_eq!(select_release(&packages, LATEST).unwrap(), "3.9.8");
        assert_eq!(select_release(&packages, "3.9.7").unwrap(), "3.9.7");
        assert_eq!(select_release(&packages, "8e15eb1").unwrap(), "8e15eb1-dev");
        assert_eq!(
            select_release(&packages, "4.0").unwrap_err(),
            UpdateError::VersionNotFound("4.0".into())
        );
        // exact match preferred over an earlier containing match
        let packages = releases(&["3.9.70", "3.9.7"]);
        assert_eq!(select_release(&packages, "3.9.7").unwrap(), "3.9.7");
    }

    struct StaticIndex {
        releases: Vec<PackageRelease>,
        calls: Mutex<usize>,
    }

    #[async_trait::async_trait]
    impl PackageIndex for StaticIndex {
        async fn releases(&self) -> Result<Vec<PackageRelease>, UpdateError> {
            *self.calls.lock().unwrap() += 1;
            Ok(self.releases.clone())
        }
    }

    fn checker(installed: &str) -> UpdateChecker<StaticIndex> {
        UpdateChecker::new(
            StaticIndex {
                releases: releases(&["3.10.0", "3.9.8"]),
                calls: Mutex::new(0),
            },
            installed,
        )
    }

    #[tokio::test]
    async fn test_update_check_once_per_day() {
        let checker = checker("3.9.8");
        let mut config = UpdateCheckConfig::default();
        let today = day("2016-03-10");

        let status = checker.check(&mut config, today, LATEST, false).await.unwrap();
        assert!(status.checked);
        assert!(status.update_available);
        assert_eq!(status.latest_version.as_deref(), Some("3.10.0"));
        assert_eq!(config.last_update_check, Some(today));

        let again = checker.check(&mut config, today, LATEST, false).await.unwrap();
        assert!(!again.checked);
        assert_eq!(*checker.index.calls.lock().unwrap(), 1);

        let forced = checker.check(&mut config, today, LATEST, true).await.unwrap();
        assert!(forced.checked);
        assert_eq!(*checker.index.calls.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_up_to_date_and_explicit_request() {
        let checker = checker("3.10.0");
        let mut config = UpdateCheckConfig::default();
        let today = day("2016-03-10");

        let status = checker.check(&mut config, today, LATEST, true).await.unwrap();
        assert!(!status.update_available);

        let pinned = checker.check(&mut config, today, "3.9.8", true).await.unwrap();
        assert!(pinned.update_available);
        assert_eq!(pinned.latest_version.as_deref(), Some("3.9.8"));
    }

    #[tokio::test]
    async fn test_missing_installed_version() {
        let checker = checker("");
        let mut config = UpdateCheckConfig::default();
        let err = checker
            .check(&mut config, day("2016-03-10"), LATEST, false)
            .await
            .unwrap_err();
        assert_eq!(err, UpdateError::VersionNotDetected);
        assert!(config.last_update_check.is_some());
    }

    #[test]
    fn test_http_index_url() {
        let index = HttpPackageIndex::new("https://pypi.example.com/", "two1", Duration::from_secs(5)).unwrap();
        assert_eq!(index.url(), "https://pypi.example.com/api/package/two1/");
    }

    enum Behaviour {
        NotRunning,
        Stops,
        Refuses,
        OsError,
        DaemonFailure,
    }

    struct FakeDaemon(Behaviour);

    impl WalletDaemon for FakeDaemon {
        fn started(&self) -> Result<bool, DaemonError> {
            match self.0 {
                Behaviour::NotRunning => Ok(false),
                Behaviour::OsError => Err(DaemonError::Io(std::io::Error::other("no pid file"))),
                _ => Ok(true),
            }
        }

        fn stop(&self) -> Result<bool, DaemonError> {
            match self.0 {
                Behaviour::Stops => Ok(true),
                Behaviour::DaemonFailure => Err(DaemonError::Daemon("systemd unavailable".into())),
                _ => Ok(false),
            }
        }
    }

    #[test]
    fn test_stop_background_wallet_process() {
        assert!(stop_background_wallet_process(&FakeDaemon(Behaviour::NotRunning)));
        assert!(stop_background_wallet_process(&FakeDaemon(Behaviour::Stops)));
        assert!(!stop_background_wallet_process(&FakeDaemon(Behaviour::Refuses)));
        assert!(stop_background_wallet_process(&FakeDaemon(Behaviour::OsError)));
        assert!(!stop_background_wallet_process(&FakeDaemon(Behaviour::DaemonFailure)));
    }
}
