//! External acquisition of clearance cookies.
//!
//! [`ScraperBroker`] runs the CF-Clearance-Scraper script once per call:
//!
//! ```text
//! <program> main.py <target> --timeout 60 [--proxy <url>] --all-cookies --file <tmp>
//! ```
//!
//! The result file is a JSON object keyed by cookie domain (`example.com` or
//! `.example.com`), each mapping to a list of `{cf_clearance, user_agent,
//! cookies[]}` records. When the file is absent the broker falls back to the
//! script's stdout.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use process_utils::{ChildOutcome, run_supervised, tokio_command};
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info, warn};
use url::Url;

use super::error::BrokerError;
use super::types::{AcquiredClearance, EgressPath};

/// Script file name inside the scraper checkout.
pub const SCRAPER_SCRIPT: &str = "main.py";

/// `--timeout` handed to the scraper.
pub const DEFAULT_SCRAPER_TIMEOUT: Duration = Duration::from_secs(60);

/// Hard limit after which the scraper is killed.
pub const DEFAULT_HARD_TIMEOUT: Duration = Duration::from_secs(90);

static CLEARANCE_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Cookie: cf_clearance=([^\s]+)").expect("valid regex"));

static USER_AGENT_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"User agent: (.+)").expect("valid regex"));

/// Disambiguates temp files created within the same millisecond.
static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Obtains a fresh clearance for a target, optionally through a proxy.
#[async_trait]
pub trait AcquisitionBroker: Send + Sync {
    async fn acquire(
        &self,
        egress: Option<&EgressPath>,
        target: &Url,
    ) -> Result<AcquiredClearance, BrokerError>;
}

/// How to run the scraper.
#[derive(Debug, Clone)]
pub struct ScraperConfig {
    /// Interpreter, e.g. `python`.
    pub program: String,
    /// Scraper checkout; also the child's working directory.
    pub script_dir: PathBuf,
    /// Where temp result files are written.
    pub work_dir: PathBuf,
    pub scraper_timeout: Duration,
    pub hard_timeout: Duration,
}

impl ScraperConfig {
    pub fn new(
        program: impl Into<String>,
        script_dir: impl Into<PathBuf>,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            program: program.into(),
            script_dir: script_dir.into(),
            work_dir: work_dir.into(),
            scraper_timeout: DEFAULT_SCRAPER_TIMEOUT,
            hard_timeout: DEFAULT_HARD_TIMEOUT,
        }
    }

    pub fn with_hard_timeout(mut self, timeout: Duration) -> Self {
        self.hard_timeout = timeout;
        self
    }

    pub fn script_path(&self) -> PathBuf {
        self.script_dir.join(SCRAPER_SCRIPT)
    }
}

/// [`AcquisitionBroker`] backed by the scraper subprocess.
#[derive(Debug, Clone)]
pub struct ScraperBroker {
    config: ScraperConfig,
}

impl ScraperBroker {
    pub fn new(config: ScraperConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScraperConfig {
        &self.config
    }

    fn temp_file(&self) -> PathBuf {
        let millis = chrono::Utc::now().timestamp_millis();
        let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
        let path = self.config.work_dir.join(format!("cf_temp_{millis}_{seq}.json"));
        std::path::absolute(&path).unwrap_or(path)
    }
}

#[async_trait]
impl AcquisitionBroker for ScraperBroker {
    async fn acquire(
        &self,
        egress: Option<&EgressPath>,
        target: &Url,
    ) -> Result<AcquiredClearance, BrokerError> {
        let script = self.config.script_path();
        if !tokio::fs::try_exists(&script).await.unwrap_or(false) {
            return Err(BrokerError::ScriptMissing(
                std::path::absolute(&script).unwrap_or(script),
            ));
        }

        if let Err(e) = tokio::fs::create_dir_all(&self.config.work_dir).await {
            warn!(
                path = %self.config.work_dir.display(),
                error = %e,
                "Failed to create scraper work directory"
            );
        }

        let temp_file = self.temp_file();
        let mut cmd = tokio_command(&self.config.program);
        cmd.arg(SCRAPER_SCRIPT)
            .arg(target.as_str())
            .arg("--timeout")
            .arg(self.config.scraper_timeout.as_secs().to_string());
        if let Some(proxy) = egress {
            cmd.arg("--proxy").arg(proxy.proxy_url());
        }
        cmd.arg("--all-cookies")
            .arg("--file")
            .arg(&temp_file)
            .current_dir(&self.config.script_dir);

        info!(
            target = %target,
            proxy = %egress.map_or_else(|| "direct".to_string(), |p| p.to_string()),
            "Running clearance scraper"
        );

        let outcome = run_supervised(&mut cmd, self.config.hard_timeout).await;
        let result = match outcome {
            ChildOutcome::SpawnFailed(e) => Err(BrokerError::SpawnFailed(e)),
            ChildOutcome::WaitFailed(e) => Err(BrokerError::Wait(e)),
            ChildOutcome::TimedOut { output } => {
                debug!(stdout = %output.stdout, "Scraper output before timeout");
                Err(BrokerError::Timeout(self.config.hard_timeout))
            }
            ChildOutcome::Completed { status, output } if !status.success() => {
                Err(BrokerError::NonZeroExit {
                    code: status.code(),
                    output: output.diagnostic().to_string(),
                })
            }
            ChildOutcome::Completed { output, .. } => {
                match tokio::fs::read_to_string(&temp_file).await {
                    Ok(json) => parse_result_file(&json, target.host_str().unwrap_or_default()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        debug!("Scraper wrote no result file, scanning stdout");
                        scan_stdout(&output.stdout)
                    }
                    Err(e) => Err(BrokerError::Malformed(e.to_string())),
                }
            }
        };

        remove_temp_file(&temp_file).await;
        result
    }
}

async fn remove_temp_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => debug!(path = %path.display(), error = %e, "Failed to remove scraper temp file"),
    }
}

#[derive(Debug, Deserialize)]
struct ScrapedRecord {
    #[serde(default)]
    cf_clearance: Option<String>,
    #[serde(default)]
    user_agent: Option<String>,
    #[serde(default)]
    cookies: Vec<ScrapedCookie>,
}

#[derive(Debug, Deserialize)]
struct ScrapedCookie {
    #[serde(default)]
    name: String,
    #[serde(default)]
    value: String,
}

/// Extract the clearance for `domain` from the scraper's result file.
///
/// Looks under `domain` first, then `.domain`, and uses the last record.
pub fn parse_result_file(json: &str, domain: &str) -> Result<AcquiredClearance, BrokerError> {
    let mut by_domain: HashMap<String, Vec<ScrapedRecord>> =
        serde_json::from_str(json).map_err(|e| BrokerError::Malformed(e.to_string()))?;

    let records = [domain.to_string(), format!(".{domain}")]
        .into_iter()
        .find_map(|key| by_domain.remove(&key).filter(|records| !records.is_empty()))
        .ok_or_else(|| BrokerError::MissingDomain(domain.to_string()))?;

    let latest = records
        .into_iter()
        .last()
        .ok_or_else(|| BrokerError::MissingDomain(domain.to_string()))?;

    let cf_clearance = latest
        .cf_clearance
        .filter(|v| !v.is_empty())
        .ok_or_else(|| BrokerError::Malformed("record has no cf_clearance".to_string()))?;

    let cookies = latest
        .cookies
        .into_iter()
        .filter(|c| !c.name.is_empty() && !c.value.is_empty())
        .map(|c| (c.name, c.value))
        .collect();

    Ok(AcquiredClearance {
        cf_clearance,
        user_agent: latest.user_agent.unwrap_or_default(),
        cookies,
    })
}

/// Pull `Cookie: cf_clearance=…` and `User agent: …` out of the scraper's stdout.
pub fn scan_stdout(stdout: &str) -> Result<AcquiredClearance, BrokerError> {
    let clearance = CLEARANCE_LINE
        .captures(stdout)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string());
    let user_agent = USER_AGENT_LINE
        .captures(stdout)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string());

    match (clearance, user_agent) {
        (Some(cf_clearance), Some(user_agent)) => Ok(AcquiredClearance {
            cookies: BTreeMap::from([("cf_clearance".to_string(), cf_clearance.clone())]),
            cf_clearance,
            user_agent,
        }),
        _ => Err(BrokerError::UnparsableOutput),
    }
}
