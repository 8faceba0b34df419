use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crm_storage::{BackoffPolicy, HttpClientConfig};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OrgType {
    #[default]
    Original,
    B2b,
    B2c,
}

impl OrgType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Original => "original",
            Self::B2b => "b2b",
            Self::B2c => "b2c",
        }
    }

    /// Prefix of the `*_INSTANCE_URL` / `*_ACCESS_TOKEN` credential variables.
    pub fn credential_prefix(self) -> &'static str {
        match self {
            Self::Original => "SALESFORCE",
            Self::B2b => "SALESFORCE_B2B",
            Self::B2c => "SALESFORCE_B2C",
        }
    }

    pub fn default_source_db(self) -> &'static str {
        match self {
            Self::Original => "crmarena_data.db",
            Self::B2b => "crmarenapro_b2b_data.db",
            Self::B2c => "crmarenapro_b2c_data.db",
        }
    }
}

impl fmt::Display for OrgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrgType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "original" => Ok(Self::Original),
            "b2b" => Ok(Self::B2b),
            "b2c" => Ok(Self::B2c),
            other => Err(format!("unknown org type {other:?} (expected original, b2b or b2c)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOptions {
    pub dry_run: bool,
    pub limit_per_object: Option<usize>,
    pub only: Vec<String>,
    pub skip: Vec<String>,
    pub chunk_size: usize,
    /// Worker pool size for concurrent chunks and record-by-record fallback.
    pub concurrency: usize,
    pub error_log_limit: usize,
    pub prune_unknown_fields: bool,
    pub convert_leads: bool,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            limit_per_object: None,
            only: Vec::new(),
            skip: Vec::new(),
            chunk_size: 200,
            concurrency: 4,
            error_log_limit: 5,
            prune_unknown_fields: false,
            convert_leads: true,
        }
    }
}

impl UploadOptions {
    pub fn selects(&self, object: &str) -> bool {
        (self.only.is_empty() || self.only.iter().any(|o| o == object))
            && !self.skip.iter().any(|o| o == object)
    }
}

#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub org: OrgType,
    pub source_db: PathBuf,
    pub mapping_db: PathBuf,
    pub reports_dir: PathBuf,
    pub rules_dir: Option<PathBuf>,
    pub api_version: String,
    pub http: HttpClientConfig,
    pub options: UploadOptions,
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

impl UploadConfig {
    pub fn from_env(org: OrgType) -> Self {
        let defaults = UploadOptions::default();
        let concurrency = env_parse("CRM_CONCURRENCY").unwrap_or(defaults.concurrency).max(1);
        Self {
            org,
            source_db: std::env::var("CRM_SOURCE_DB")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("local_data").join(org.default_source_db())),
            mapping_db: std::env::var("CRM_MAPPING_DB")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("local_data/id_mappings.db")),
            reports_dir: std::env::var("CRM_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("reports")),
            rules_dir: std::env::var("CRM_RULES_DIR").ok().map(PathBuf::from),
            api_version: std::env::var("SALESFORCE_API_VERSION")
                .unwrap_or_else(|_| "60.0".to_string()),
            http: HttpClientConfig {
                timeout: Duration::from_secs(env_parse("CRM_HTTP_TIMEOUT_SECS").unwrap_or(120)),
                user_agent: Some(
                    std::env::var("CRM_USER_AGENT")
                        .unwrap_or_else(|_| "crm-migrate/0.1".to_string()),
                ),
                concurrency,
                backoff: BackoffPolicy::default(),
            },
            options: UploadOptions {
                chunk_size: env_parse("CRM_CHUNK_SIZE")
                    .unwrap_or(defaults.chunk_size)
                    .max(1),
                concurrency,
                error_log_limit: env_parse("CRM_ERROR_LOG_LIMIT")
                    .unwrap_or(defaults.error_log_limit),
                ..defaults
            },
        }
    }
}
