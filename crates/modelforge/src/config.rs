use std::fs;
use std::io;
use std::path::PathBuf;

use etcetera::{choose_app_strategy, AppStrategy, AppStrategyArgs};
use once_cell::sync::Lazy;

pub static APP_STRATEGY: Lazy<AppStrategyArgs> = Lazy::new(|| AppStrategyArgs {
    top_level_domain: "dev".to_string(),
    author: "modelforge".to_string(),
    app_name: "modelforge".to_string(),
});

/// Maximum number of log lines retained per job; oldest lines are evicted.
pub const MAX_LOG_LINES: usize = 1000;

/// Number of trailing log lines returned in a status view.
pub const LOG_TAIL_LINES: usize = 20;

fn data_dir() -> Result<PathBuf, io::Error> {
    let strategy = choose_app_strategy(APP_STRATEGY.clone())
        .map_err(|e| io::Error::new(io::ErrorKind::NotFound, e.to_string()))?;
    let data_dir = strategy.data_dir();
    fs::create_dir_all(&data_dir)?;
    Ok(data_dir)
}

/// Default location of the durable job store file.
pub fn default_store_path() -> Result<PathBuf, io::Error> {
    Ok(data_dir()?.join("jobs.json"))
}

/// Default directory under which pipeline stages place model artifacts.
pub fn default_models_dir() -> Result<PathBuf, io::Error> {
    let models_dir = data_dir()?.join("models");
    fs::create_dir_all(&models_dir)?;
    Ok(models_dir)
}
