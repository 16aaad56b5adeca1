use std::io::{self, Write};
use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use mvquery::batched::QueryConfig;
use mvquery::config::{Settings, DEFAULT_CONFIG_FILE};
use mvquery::error::{MvQueryError, Result};
use mvquery::interface::{Outcome, QueryInterface, QueryOptions};
use mvquery::transport::LocalTransport;

fn run() -> Result<usize> {
    let path = std::env::var("MVQUERY_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
    let settings = Settings::load(&path)?;
    let Some(query) = settings.query else {
        return Err(MvQueryError::Usage(format!("no [query] section in {path} or MVQUERY__QUERY__*")));
    };
    let config: QueryConfig = query.into();
    info!(account = %settings.remote.account, file = %config.file, strategy = ?config.strategy, "starting query");

    let interface = QueryInterface::new(Arc::new(LocalTransport::new()), settings.remote)?;
    let options = QueryOptions { charset: settings.decoder.charset, ..QueryOptions::default() };
    let handle = interface.start_query(config, options);

    let stdout = io::stdout();
    let mut out = stdout.lock();
    for record in handle.results.iter() {
        let record = record?;
        let line = serde_json::to_string(&record).map_err(io::Error::from)?;
        writeln!(out, "{line}")?;
    }
    out.flush()?;
    match handle.join() {
        Outcome::Completed { records } => Ok(records),
        Outcome::Failed(e) => Err(e),
        other => Err(MvQueryError::Worker(format!("query ended early: {other:?}"))),
    }
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // logs go to stderr so stdout stays one JSON record per line
    fmt().with_env_filter(filter).with_writer(io::stderr).init();

    match run() {
        Ok(records) => {
            info!(records, "query complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "query failed");
            ExitCode::FAILURE
        }
    }
}
