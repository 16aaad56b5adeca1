//! Settings for talking to one database account.
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! `MVQUERY__SECTION__KEY` environment variables.

use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;

use crate::batched::{QueryConfig, SelectStrategy};
use crate::decode::Charset;
use crate::error::{MvQueryError, Result};

pub const DEFAULT_CONFIG_FILE: &str = "mvquery.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteEnv {
    /// `$UDTBIN`, the directory holding the `udt` executable.
    pub bin: String,
    /// `$UDTHOME`.
    pub home: String,
    /// Account directory; remote paths are resolved relative to it.
    pub account: String,
    /// Directory file in the account receiving generated programs.
    #[serde(default = "default_program_file")]
    pub program_file: String,
}

fn default_program_file() -> String {
    "BP".to_string()
}

impl RemoteEnv {
    pub fn new(bin: impl Into<String>, home: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            bin: bin.into(),
            home: home.into(),
            account: account.into(),
            program_file: default_program_file(),
        }
    }
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("bin", &self.bin),
            ("home", &self.home),
            ("account", &self.account),
            ("program_file", &self.program_file),
        ] {
            if value.trim().is_empty() {
                return Err(MvQueryError::Usage(format!("remote.{name} must not be blank")));
            }
        }
        Ok(())
    }
    /// Path of `relative` inside the account directory.
    pub fn account_path(&self, relative: &str) -> String {
        format!("{}/{}", self.account.trim_end_matches('/'), relative)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DecoderSettings {
    #[serde(default)]
    pub charset: Charset,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct QuerySettings {
    pub select: Vec<String>,
    pub file: String,
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub batch_size: i64,
    #[serde(default)]
    pub strategy: SelectStrategy,
}

impl From<QuerySettings> for QueryConfig {
    fn from(q: QuerySettings) -> Self {
        QueryConfig {
            select: q.select,
            file: q.file,
            fields: q.fields,
            batch_size: q.batch_size,
            strategy: q.strategy,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Settings {
    pub remote: RemoteEnv,
    #[serde(default)]
    pub decoder: DecoderSettings,
    #[serde(default)]
    pub query: Option<QuerySettings>,
}

impl Settings {
    /// Loads settings from `path` (missing file allowed) and the environment.
    pub fn load(path: &str) -> Result<Self> {
        Self::build(File::with_name(path).format(FileFormat::Toml).required(false))
    }
    /// Loads settings from TOML text and the environment.
    pub fn from_toml(text: &str) -> Result<Self> {
        Self::build(File::from_str(text, FileFormat::Toml))
    }
    fn build<S>(source: S) -> Result<Self>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let settings: Settings = Config::builder()
            .set_default("remote.bin", "/usr/udthome/bin")?
            .set_default("remote.home", "/usr/udthome")?
            .set_default("remote.account", "/usr/udthome/demo")?
            .add_source(source)
            .add_source(Environment::with_prefix("MVQUERY").prefix_separator("__").separator("__"))
            .build()?
            .try_deserialize()?;
        settings.remote.validate()?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_in_missing_roots() {
        let settings = Settings::from_toml("[remote]\naccount = \"/data/acct\"\n").expect("settings");
        assert_eq!(settings.remote.bin, "/usr/udthome/bin");
        assert_eq!(settings.remote.account, "/data/acct");
        assert_eq!(settings.remote.program_file, "BP");
        assert_eq!(settings.decoder.charset, Charset::Latin1);
        assert!(settings.query.is_none());
    }

    #[test]
    fn query_section_becomes_query_config() {
        let text = r#"
[remote]
account = "/data/acct"

[decoder]
charset = "utf8"

[query]
select = ['SELECT ORDERS WITH ORD_DATE="10/25/2000"']
file = "ORDERS"
fields = ["ID", "ORD_DATE", "ORD_TIME"]
batch_size = 25
strategy = "status_lines"
"#;
        let settings = Settings::from_toml(text).expect("settings");
        assert_eq!(settings.decoder.charset, Charset::Utf8);
        let query: QueryConfig = settings.query.expect("query").into();
        assert_eq!(query.file, "ORDERS");
        assert_eq!(query.batch_size, 25);
        assert_eq!(query.strategy, SelectStrategy::StatusLines);
    }

    #[test]
    fn blank_root_is_rejected() {
        let err = Settings::from_toml("[remote]\naccount = \"  \"\n").expect_err("blank account");
        assert!(matches!(err, MvQueryError::Usage(_)));
    }

    #[test]
    fn account_paths_join_cleanly() {
        let env = RemoteEnv::new("/b", "/h", "/acct/");
        assert_eq!(env.account_path("_PH_/x"), "/acct/_PH_/x");
    }
}
