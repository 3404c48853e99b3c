use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
};

use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use thiserror::Error;

use dualentry_core::Currency;

#[derive(Parser, Debug)]
#[command(name = "dualentry", about = "DualEntry - double-entry ledger engine")]
pub struct CliArgs {
    /// Path to config file
    #[arg(short, long, default_value = "dualentry.toml")]
    pub config: String,

    /// Database URL or path (overrides config file)
    #[arg(short, long)]
    pub database: Option<String>,

    /// Log level (overrides config file)
    #[arg(short, long)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Move money between two configured accounts
    Transfer {
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        /// Amount in minor units
        #[arg(long)]
        amount: i64,
        #[arg(long)]
        code: String,
        #[arg(long)]
        currency: Option<String>,
        #[arg(long)]
        from_scope: Option<String>,
        #[arg(long)]
        to_scope: Option<String>,
        /// JSON object stored on both lines
        #[arg(long)]
        metadata: Option<String>,
    },
    /// Print an account's balance
    Balance(AccountArgs),
    /// Print an account's ledger lines
    Lines(AccountArgs),
}

#[derive(Args, Debug)]
pub struct AccountArgs {
    #[arg(long)]
    pub account: String,
    #[arg(long)]
    pub currency: Option<String>,
    #[arg(long)]
    pub scope: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub ledger: LedgerConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default = "default_logging")]
    pub logging: LoggingConfig,
}

/// Static ledger rules, loaded once and never mutated afterwards.
#[derive(Debug, Deserialize, Clone)]
pub struct LedgerConfig {
    #[serde(default = "default_currency")]
    pub default_currency: Currency,

    #[serde(default)]
    pub accounts: BTreeMap<String, AccountSettings>,

    /// Transfer code to the `(from, to)` identifier pairs it may move between.
    #[serde(default)]
    pub transfers: BTreeMap<String, BTreeSet<(String, String)>>,
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct AccountSettings {
    #[serde(default)]
    pub positive_only: bool,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Memory,
    Sqlite,
    Postgres,
}

impl Backend {
    /// The persistent backend a database URL names: a PostgreSQL connection
    /// string or URI, otherwise a SQLite file path.
    pub fn from_url(url: &str) -> Self {
        if url.starts_with("postgres://") || url.starts_with("postgresql://") || url.contains("host=") {
            Backend::Postgres
        } else {
            Backend::Sqlite
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub backend: Backend,

    /// File path for SQLite, connection string for PostgreSQL.
    #[serde(default = "default_database_url")]
    pub url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,
}

fn default_currency() -> Currency {
    Currency::new("USD")
}

fn default_database_url() -> String {
    "dualentry.db".to_string()
}

fn default_logging() -> LoggingConfig {
    LoggingConfig {
        level: default_log_level(),
        json: false,
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LedgerConfig {
    fn default() -> Self {
        LedgerConfig {
            default_currency: default_currency(),
            accounts: BTreeMap::new(),
            transfers: BTreeMap::new(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            backend: Backend::default(),
            url: default_database_url(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        default_logging()
    }
}

impl LedgerConfig {
    pub fn builder() -> LedgerConfigBuilder {
        LedgerConfigBuilder::default()
    }

    pub fn positive_only(&self, identifier: &str) -> bool {
        self.accounts
            .get(identifier)
            .map(|settings| settings.positive_only)
            .unwrap_or(false)
    }

    pub fn allowed_pairs(&self, code: &str) -> Option<&BTreeSet<(String, String)>> {
        self.transfers.get(code)
    }
}

#[derive(Debug, Default)]
pub struct LedgerConfigBuilder {
    config: LedgerConfig,
}

impl LedgerConfigBuilder {
    pub fn default_currency(mut self, currency: &str) -> Self {
        self.config.default_currency = Currency::new(currency);
        self
    }

    pub fn account(mut self, identifier: &str, positive_only: bool) -> Self {
        self.config
            .accounts
            .insert(identifier.to_string(), AccountSettings { positive_only });
        self
    }

    pub fn transfer(mut self, code: &str, from: &str, to: &str) -> Self {
        self.config
            .transfers
            .entry(code.to_string())
            .or_default()
            .insert((from.to_string(), to.to_string()));
        self
    }

    pub fn build(self) -> LedgerConfig {
        self.config
    }
}

impl Config {
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Reads the config file named on the command line, falling back to
    /// defaults when it does not exist, then applies CLI overrides.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let mut config = if Path::new(&cli.config).exists() {
            Self::from_toml(&std::fs::read_to_string(&cli.config)?)?
        } else {
            Config::default()
        };

        // CLI overrides
        if let Some(ref url) = cli.database {
            config.database.backend = Backend::from_url(url);
            config.database.url = url.clone();
        }
        if let Some(ref level) = cli.log_level {
            config.logging.level = level.clone();
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let config = Config::from_toml(
            r#"
            [ledger]
            default_currency = "AUD"

            [ledger.accounts.checking]
            positive_only = true

            [ledger.accounts.savings]

            [ledger.transfers]
            deposit = [["checking", "savings"]]
            withdraw = [["savings", "checking"], ["savings", "cash"]]

            [database]
            backend = "sqlite"
            url = "/tmp/ledger.db"

            [logging]
            level = "debug"
            json = true
            "#,
        )
        .unwrap();

        assert_eq!(config.ledger.default_currency, Currency::new("AUD"));
        assert!(config.ledger.positive_only("checking"));
        assert!(!config.ledger.positive_only("savings"));
        assert!(!config.ledger.positive_only("unknown"));
        assert_eq!(config.ledger.allowed_pairs("withdraw").unwrap().len(), 2);
        assert!(config
            .ledger
            .allowed_pairs("deposit")
            .unwrap()
            .contains(&("checking".to_string(), "savings".to_string())));
        assert_eq!(config.database.backend, Backend::Sqlite);
        assert!(config.logging.json);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.ledger.default_currency, Currency::new("USD"));
        assert!(config.ledger.transfers.is_empty());
        assert_eq!(config.database.backend, Backend::Memory);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_malformed_config_is_an_error() {
        assert!(matches!(
            Config::from_toml("[ledger]\ntransfers = 3"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_database_flag_selects_backend() {
        let load = |url: &str| {
            let cli = CliArgs::parse_from([
                "dualentry",
                "-c",
                "/nonexistent/dualentry.toml",
                "-d",
                url,
                "balance",
                "--account",
                "cash",
            ]);
            Config::load(&cli).unwrap().database
        };

        let sqlite = load("ledger.db");
        assert_eq!(sqlite.backend, Backend::Sqlite);
        assert_eq!(sqlite.url, "ledger.db");
        assert_eq!(load("postgres://ledger@localhost/ledger").backend, Backend::Postgres);
        assert_eq!(load("postgresql://localhost/ledger").backend, Backend::Postgres);
        assert_eq!(load("host=localhost user=ledger").backend, Backend::Postgres);

        let cli = CliArgs::parse_from(["dualentry", "-c", "/nonexistent/dualentry.toml", "lines", "--account", "cash"]);
        assert_eq!(Config::load(&cli).unwrap().database.backend, Backend::Memory);
    }

    #[test]
    fn test_builder_registers_pairs() {
        let config = LedgerConfig::builder()
            .default_currency("EUR")
            .account("checking", true)
            .transfer("deposit", "checking", "savings")
            .transfer("deposit", "cash", "savings")
            .build();
        assert_eq!(config.allowed_pairs("deposit").unwrap().len(), 2);
        assert!(config.positive_only("checking"));
        assert_eq!(config.default_currency.code(), "EUR");
    }
}
