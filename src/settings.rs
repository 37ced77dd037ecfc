use config::{Config, Environment, File};
use serde::Deserialize;

use crate::CLIENT_NAME;

const CONFIG_NAME: &str = "config.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub db_file: String,
    #[serde(default)]
    pub sync: SyncOpts,
    pub bank: Provider,
    pub mailbox: Provider,
}

/// OAuth2 provider endpoints and client credentials. The client secret lives
/// here (it identifies the application); user tokens never do, those belong
/// to the credential vault.
#[derive(Debug, Clone, Deserialize)]
pub struct Provider {
    pub client_id: String,
    pub secret: String,
    pub auth_url: String,
    pub token_url: String,
    pub api_url: String,
    pub redirect_uri: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncOpts {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_session_timeout")]
    pub session_timeout_secs: u64,
    /// Tokens within this many seconds of expiry are refreshed proactively.
    #[serde(default = "default_refresh_skew")]
    pub refresh_skew_secs: i64,
    #[serde(default = "default_page_limit")]
    pub page_limit: u32,
}

impl Default for SyncOpts {
    fn default() -> Self {
        SyncOpts {
            workers: default_workers(),
            request_timeout_secs: default_request_timeout(),
            session_timeout_secs: default_session_timeout(),
            refresh_skew_secs: default_refresh_skew(),
            page_limit: default_page_limit(),
        }
    }
}

fn default_workers() -> usize {
    4
}

fn default_request_timeout() -> u64 {
    60
}

fn default_session_timeout() -> u64 {
    300
}

fn default_refresh_skew() -> i64 {
    300
}

fn default_page_limit() -> u32 {
    500
}

impl Settings {
    pub fn new(config_path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut s = Config::builder()
            .set_default("db_file", default_data_path())?
            .add_source(Environment::with_prefix("BURSAR").separator("__"));

        if let Some(path) = config_path {
            s = s.add_source(File::with_name(path));
        } else {
            s = s.add_source(File::with_name(&default_config_path()));
        }

        s.build()?.try_deserialize()
    }
}

fn default_data_path() -> String {
    dirs::data_dir()
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| std::env::temp_dir()))
        .join(CLIENT_NAME)
        .join(format!("{}.db", CLIENT_NAME))
        .display()
        .to_string()
}

pub fn default_config_path() -> String {
    dirs::config_dir()
        .unwrap_or_else(|| std::env::current_dir().expect("read current working dir"))
        .join(CLIENT_NAME)
        .join(CONFIG_NAME)
        .display()
        .to_string()
}

/// Starter config written by `bursar init`.
pub const CONFIG_TEMPLATE: &str = r#"# bursar configuration
#
# db_file = "/path/to/bursar.db"

[bank]
client_id = ""
secret = ""
auth_url = "https://auth.example-aggregator.com/authorize"
token_url = "https://auth.example-aggregator.com/token"
api_url = "https://api.example-aggregator.com"
redirect_uri = "http://127.0.0.1:4545/callback"
scopes = ["transactions"]

[mailbox]
client_id = ""
secret = ""
auth_url = "https://accounts.example-mail.com/o/oauth2/auth"
token_url = "https://accounts.example-mail.com/o/oauth2/token"
api_url = "https://mail.example-mail.com/v1"
redirect_uri = "http://127.0.0.1:4545/callback"
scopes = ["mail.readonly"]

[sync]
workers = 4
request_timeout_secs = 60
session_timeout_secs = 300
refresh_skew_secs = 300
page_limit = 500
"#;
