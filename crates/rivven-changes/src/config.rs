//! Changes stream configuration
//!
//! A stream needs a target database and nothing else; everything else has a
//! default. Configuration can be built in code, from a bare target string,
//! or from YAML:
//!
//! ```yaml
//! db: https://skimdb.npmjs.com/registry
//! since: 1283832
//! limit: 10
//! include_docs: true
//! heartbeat_ms: ${CHANGES_HEARTBEAT_MS:-30000}
//! ```

use crate::error::{ChangesError, Result};
use crate::event::Seq;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;
use validator::Validate;

/// Pre-compiled regex for environment variable expansion
/// Pattern: ${VAR} or ${VAR:-default}
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

/// Changes stream configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate, JsonSchema)]
pub struct ChangesConfig {
    /// Database URL to read changes from (required)
    #[serde(default)]
    #[validate(url)]
    pub db: Option<String>,

    /// Sequence to resume after; this seq itself is not replayed
    /// (default: start of the feed)
    #[serde(default)]
    pub since: Option<Seq>,

    /// Maximum number of records to emit (absent or negative = unbounded)
    #[serde(default)]
    pub limit: Option<i64>,

    /// Ask the feed to include full documents (default: true)
    #[serde(default = "default_true")]
    pub include_docs: bool,

    /// Heartbeat interval requested from the feed in milliseconds (default: 30000)
    #[serde(default = "default_heartbeat_ms")]
    #[validate(range(min = 1000, max = 300_000))]
    pub heartbeat_ms: u64,

    /// Request timeout for the baseline fetch in seconds (default: 30)
    #[serde(default = "default_request_timeout")]
    #[validate(range(min = 1, max = 300))]
    pub request_timeout_secs: u64,

    /// Server-side filter function (`design/filter`)
    #[serde(default)]
    #[validate(length(min = 1))]
    pub filter: Option<String>,

    /// Which revisions each change row lists
    #[serde(default)]
    pub style: FeedStyle,

    /// Extra query parameters passed to the feed (e.g. filter arguments)
    #[serde(default)]
    pub query_params: BTreeMap<String, String>,

    /// What to do when a change cannot be adapted into a record
    #[serde(default)]
    pub on_adapt_error: AdaptErrorPolicy,
}

fn default_true() -> bool {
    true
}

fn default_heartbeat_ms() -> u64 {
    30_000
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for ChangesConfig {
    fn default() -> Self {
        Self {
            db: None,
            since: None,
            limit: None,
            include_docs: true,
            heartbeat_ms: default_heartbeat_ms(),
            request_timeout_secs: default_request_timeout(),
            filter: None,
            style: FeedStyle::default(),
            query_params: BTreeMap::new(),
            on_adapt_error: AdaptErrorPolicy::default(),
        }
    }
}

/// Revision style of change rows
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FeedStyle {
    /// Only the winning revision
    #[default]
    MainOnly,
    /// All leaf revisions, including conflicts
    AllDocs,
}

impl FeedStyle {
    /// Query parameter value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MainOnly => "main_only",
            Self::AllDocs => "all_docs",
        }
    }
}

/// Behaviour after a change fails to adapt into a record.
///
/// The error is always surfaced on the stream; the policy only decides
/// whether later changes are still processed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AdaptErrorPolicy {
    /// Skip the failing change and keep going
    #[default]
    Continue,
    /// End the stream after surfacing the error
    Halt,
}

impl ChangesConfig {
    /// Create a configuration for a target database
    pub fn new(db: impl Into<String>) -> Self {
        Self {
            db: Some(db.into()),
            ..Default::default()
        }
    }

    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&content)
    }

    /// Parse configuration from YAML, expanding `${VAR}` references
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let expanded = Self::expand_env_vars(content);
        let config: Self = serde_yaml::from_str(&expanded)?;
        Ok(config)
    }

    /// Expand environment variables in the format ${VAR} or ${VAR:-default}
    fn expand_env_vars(content: &str) -> String {
        ENV_VAR_REGEX
            .replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                let default = caps.get(2).map(|m| m.as_str());

                std::env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
            })
            .to_string()
    }

    /// Set the resume point (builder-style)
    pub fn with_since(mut self, since: impl Into<Seq>) -> Self {
        self.since = Some(since.into());
        self
    }

    /// Set the record limit (builder-style)
    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Set whether documents are included (builder-style)
    pub fn with_include_docs(mut self, include_docs: bool) -> Self {
        self.include_docs = include_docs;
        self
    }

    /// Set the adaptation error policy (builder-style)
    pub fn with_adapt_error_policy(mut self, policy: AdaptErrorPolicy) -> Self {
        self.on_adapt_error = policy;
        self
    }

    /// Set a server-side filter (builder-style)
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Add a feed query parameter (builder-style)
    pub fn with_query_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_params.insert(key.into(), value.into());
        self
    }

    /// The effective record limit. Absent and negative limits mean unbounded.
    pub fn effective_limit(&self) -> Option<u64> {
        self.limit.and_then(|limit| u64::try_from(limit).ok())
    }

    /// Request timeout for the baseline fetch
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Heartbeat interval requested from the feed
    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    /// Validate the configuration and return the target database.
    ///
    /// Performs no I/O.
    pub fn check(&self) -> Result<&str> {
        let db = match self.db.as_deref().map(str::trim) {
            Some(db) if !db.is_empty() => db,
            _ => return Err(ChangesError::config("expected `db` to be set")),
        };

        let parsed = url::Url::parse(db)
            .map_err(|e| ChangesError::config(format!("Invalid database URL '{}': {}", db, e)))?;
        match parsed.scheme() {
            "http" | "https" => {}
            scheme => {
                return Err(ChangesError::config(format!(
                    "Database URL must use http or https scheme, got '{}'",
                    scheme
                )));
            }
        }

        Validate::validate(self)
            .map_err(|e| ChangesError::config(format!("Config validation failed: {}", e)))?;

        Ok(db)
    }

    /// JSON schema of this configuration
    pub fn json_schema() -> serde_json::Value {
        let schema = schemars::schema_for!(ChangesConfig);
        serde_json::to_value(schema).unwrap_or_default()
    }
}

impl From<&str> for ChangesConfig {
    fn from(db: &str) -> Self {
        Self::new(db)
    }
}

impl From<String> for ChangesConfig {
    fn from(db: String) -> Self {
        Self::new(db)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ChangesConfig::default();
        assert!(config.db.is_none());
        assert!(config.include_docs);
        assert_eq!(config.heartbeat_ms, 30_000);
        assert_eq!(config.request_timeout_secs, 30);
        assert_eq!(config.style, FeedStyle::MainOnly);
        assert_eq!(config.on_adapt_error, AdaptErrorPolicy::Continue);
        assert_eq!(config.effective_limit(), None);
    }

    #[test]
    fn test_from_bare_string() {
        let config: ChangesConfig = "https://skimdb.npmjs.com/registry".into();
        assert_eq!(
            config.check().unwrap(),
            "https://skimdb.npmjs.com/registry"
        );
        assert!(config.include_docs);
    }

    #[test]
    fn test_missing_db_fails() {
        let err = ChangesConfig::default().check().unwrap_err();
        assert!(matches!(err, ChangesError::Config(_)));
        assert!(err.to_string().contains("expected `db` to be set"));

        let err = ChangesConfig::new("   ").check().unwrap_err();
        assert!(matches!(err, ChangesError::Config(_)));
    }

    #[test]
    fn test_invalid_db_url() {
        assert!(ChangesConfig::new("not a url").check().is_err());
        assert!(ChangesConfig::new("ftp://host/db").check().is_err());
    }

    #[test]
    fn test_effective_limit() {
        let config = ChangesConfig::new("http://localhost:5984/db");
        assert_eq!(config.clone().with_limit(10).effective_limit(), Some(10));
        assert_eq!(config.clone().with_limit(0).effective_limit(), Some(0));
        assert_eq!(config.with_limit(-1).effective_limit(), None);
    }

    #[test]
    fn test_yaml_config() {
        let yaml = r#"
db: http://localhost:5984/registry
since: 1283832
limit: 10
include_docs: false
style: all_docs
on_adapt_error: halt
query_params:
  name: left-pad
"#;
        let config = ChangesConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.db.as_deref(), Some("http://localhost:5984/registry"));
        assert_eq!(config.since, Some(Seq::Number(1283832)));
        assert_eq!(config.effective_limit(), Some(10));
        assert!(!config.include_docs);
        assert_eq!(config.style, FeedStyle::AllDocs);
        assert_eq!(config.on_adapt_error, AdaptErrorPolicy::Halt);
        assert_eq!(config.query_params["name"], "left-pad");
        assert!(config.check().is_ok());
    }

    #[test]
    fn test_yaml_without_db_fails_check() {
        let config = ChangesConfig::from_yaml_str("limit: 3\n").unwrap();
        assert!(config.check().is_err());
    }

    #[test]
    fn test_yaml_opaque_since() {
        let config =
            ChangesConfig::from_yaml_str("db: http://localhost:5984/db\nsince: now\n").unwrap();
        assert_eq!(config.since, Some(Seq::Opaque("now".into())));
    }

    #[test]
    fn test_env_var_with_default() {
        std::env::remove_var("RIVVEN_CHANGES_TEST_MISSING");
        let yaml = "db: ${RIVVEN_CHANGES_TEST_MISSING:-http://localhost:5984/fallback}\n";
        let config = ChangesConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(
            config.db.as_deref(),
            Some("http://localhost:5984/fallback")
        );
    }

    #[test]
    fn test_heartbeat_out_of_range() {
        let mut config = ChangesConfig::new("http://localhost:5984/db");
        config.heartbeat_ms = 10;
        assert!(config.check().is_err());
    }

    #[test]
    fn test_json_schema() {
        let schema = ChangesConfig::json_schema();
        let properties = schema.get("properties").unwrap();
        assert!(properties.get("db").is_some());
        assert!(properties.get("include_docs").is_some());
    }
}
