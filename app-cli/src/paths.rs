use std::path::PathBuf;

use wgtunnel_core::platform::AppPaths;

/// Platform locations, with optional command-line overrides.
#[derive(Debug, Default, Clone)]
pub struct CliPaths {
    pub config: Option<PathBuf>,
    pub credentials: Option<PathBuf>,
}

impl AppPaths for CliPaths {
    fn config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(|| {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("wgtunnel")
                .join("config.toml")
        })
    }

    fn credentials_path(&self) -> PathBuf {
        self.credentials.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .or_else(dirs::data_dir)
                .unwrap_or_else(|| PathBuf::from("."))
                .join("wgtunnel")
                .join("credentials.json")
        })
    }
}
