use clap::Parser;
use serde::Deserialize;
use sqlx::mysql::MySqlConnectOptions;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::dispatcher::PipelineSettings;
use crate::guard::{GuardPolicy, StatementKind};

/// Natural-language and raw SQL access to a MySQL database over MCP.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "mcp-nl2sql", version, about)]
pub struct Args {
    /// Config file (default: ~/.config/mcp-nl2sql/config.toml)
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    #[arg(long, env = "DB_HOST")]
    pub host: Option<String>,

    #[arg(long, env = "DB_PORT")]
    pub port: Option<u16>,

    #[arg(long, env = "DB_USER")]
    pub username: Option<String>,

    #[arg(long, env = "DB_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    #[arg(long, env = "DB_NAME")]
    pub database: Option<String>,

    /// Ollama base URL
    #[arg(long, env = "OLLAMA_URL")]
    pub ollama_url: Option<String>,

    #[arg(long, env = "OLLAMA_MODEL")]
    pub ollama_model: Option<String>,

    /// Permit INSERT, UPDATE and DELETE statements
    #[arg(long)]
    pub allow_writes: bool,
}

fn default_host() -> String {
    "localhost".into()
}

fn default_port() -> u16 {
    3306
}

fn default_username() -> String {
    "root".into()
}

fn default_database() -> String {
    "test_db".into()
}

fn default_row_limit() -> u64 {
    1000
}

fn default_sample_limit() -> u64 {
    10
}

fn default_query_timeout() -> u64 {
    30
}

fn default_request_timeout() -> u64 {
    120
}

fn default_schema_ttl() -> u64 {
    300
}

fn default_schema_budget() -> usize {
    6000
}

fn default_max_value_bytes() -> usize {
    4096
}

fn default_max_connections() -> u32 {
    5
}

fn default_ollama_url() -> String {
    "http://localhost:11434".into()
}

fn default_ollama_model() -> String {
    "llama3.2".into()
}

fn default_llm_timeout() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_username")]
    pub username: String,

    #[serde(default)]
    pub password: String,

    #[serde(default = "default_database")]
    pub database: String,

    #[serde(default, alias = "allow_dangerous_queries")]
    pub allow_writes: bool,

    /// Explicit statement whitelist, e.g. `["select", "show"]`. Write kinds
    /// listed here still require `allow_writes`.
    #[serde(default)]
    pub allowed_statements: Option<Vec<String>>,

    #[serde(default = "default_row_limit", alias = "max_rows")]
    pub row_limit: u64,

    #[serde(default = "default_sample_limit")]
    pub sample_limit: u64,

    #[serde(default = "default_query_timeout")]
    pub query_timeout_secs: u64,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_schema_ttl")]
    pub schema_ttl_secs: u64,

    /// Characters of schema description allowed in a prompt.
    #[serde(default = "default_schema_budget")]
    pub schema_prompt_budget: usize,

    #[serde(default = "default_max_value_bytes")]
    pub max_value_bytes: usize,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_ollama_url")]
    pub ollama_url: String,

    #[serde(default = "default_ollama_model")]
    pub ollama_model: String,

    #[serde(default = "default_llm_timeout")]
    pub llm_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            username: default_username(),
            password: String::new(),
            database: default_database(),
            allow_writes: false,
            allowed_statements: None,
            row_limit: default_row_limit(),
            sample_limit: default_sample_limit(),
            query_timeout_secs: default_query_timeout(),
            request_timeout_secs: default_request_timeout(),
            schema_ttl_secs: default_schema_ttl(),
            schema_prompt_budget: default_schema_budget(),
            max_value_bytes: default_max_value_bytes(),
            max_connections: default_max_connections(),
            ollama_url: default_ollama_url(),
            ollama_model: default_ollama_model(),
            llm_timeout_secs: default_llm_timeout(),
        }
    }
}

impl Config {
    /// Command-line and environment values win over the file.
    pub fn apply_args(&mut self, args: &Args) {
        if let Some(host) = &args.host {
            self.host = host.clone();
        }
        if let Some(port) = args.port {
            self.port = port;
        }
        if let Some(username) = &args.username {
            self.username = username.clone();
        }
        if let Some(password) = &args.password {
            self.password = password.clone();
        }
        if let Some(database) = &args.database {
            self.database = database.clone();
        }
        if let Some(url) = &args.ollama_url {
            self.ollama_url = url.clone();
        }
        if let Some(model) = &args.ollama_model {
            self.ollama_model = model.clone();
        }
        if args.allow_writes {
            self.allow_writes = true;
        }
    }

    pub fn connect_options(&self) -> MySqlConnectOptions {
        MySqlConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.username)
            .password(&self.password)
            .database(&self.database)
    }

    /// Connection target for logs, without the password.
    pub fn database_label(&self) -> String {
        format!("mysql://{}@{}:{}/{}", self.username, self.host, self.port, self.database)
    }

    pub fn policy(&self) -> Result<GuardPolicy, String> {
        let mut policy = if self.allow_writes {
            GuardPolicy::with_writes(self.row_limit)
        } else {
            GuardPolicy::read_only(self.row_limit)
        };

        if let Some(names) = &self.allowed_statements {
            let mut allowed = std::collections::HashSet::new();
            for name in names {
                let kind = StatementKind::from_name(name)
                    .ok_or_else(|| format!("Unknown statement kind in allowed_statements: {name}"))?;
                if kind.is_read_only() || self.allow_writes {
                    allowed.insert(kind);
                }
            }
            policy.allowed = allowed;
        }
        Ok(policy)
    }

    pub fn pipeline_settings(&self) -> Result<PipelineSettings, String> {
        if self.row_limit == 0 {
            return Err("row_limit must be at least 1".into());
        }
        Ok(PipelineSettings {
            policy: self.policy()?,
            schema_ttl: Duration::from_secs(self.schema_ttl_secs),
            schema_budget: self.schema_prompt_budget,
            query_timeout: Duration::from_secs(self.query_timeout_secs),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            max_value_bytes: self.max_value_bytes,
            sample_limit: self.sample_limit,
        })
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm_timeout_secs)
    }
}

pub fn config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/root".into());
    PathBuf::from(home)
        .join(".config")
        .join("mcp-nl2sql")
        .join("config.toml")
}

fn read_file(path: &Path) -> Result<Config, Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        format!(
            "Failed to read config file: {}\n\
             Example:\n\n\
             host = \"localhost\"\n\
             port = 3306\n\
             username = \"admin\"\n\
             password = \"\"\n\
             database = \"mydb\"\n\
             allow_writes = false\n\
             row_limit = 1000\n\
             ollama_model = \"llama3.2\"\n\n\
             Error: {e}",
            path.display()
        )
    })?;
    let config: Config = toml::from_str(&content).map_err(|e| format!("Failed to parse {}: {e}", path.display()))?;
    Ok(config)
}

/// Resolve configuration: an explicit `--config` file must exist; the default
/// location is optional. Arguments and environment are layered on top.
pub fn load(args: &Args) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => read_file(path)?,
        None => {
            let path = config_path();
            if path.exists() {
                read_file(&path)?
            } else {
                Config::default()
            }
        }
    };
    config.apply_args(args);
    config.pipeline_settings()?;
    Ok(config)
}
