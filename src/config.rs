//! Persistent settings. Loaded once at start-up; the engine only reads them.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::tls::{config_dir, TlsSettings};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub tls: TlsSettings,

    /// Where the control server listens; empty means every interface.
    pub control_server_address: String,
    pub control_server_service: String,
    /// Local endpoint control connections dial from; empty lets the OS pick.
    pub control_client_address: String,
    pub control_client_service: String,

    /// Local address data connections bind to.
    pub data_local_address: String,
    /// Address and service announced to peers for data connections.
    pub data_wide_address: String,
    pub data_wide_service: String,
    pub data_output_path: PathBuf,

    pub logging_enabled: bool,
    pub logging_path: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            tls: TlsSettings::default(),
            control_server_address: String::new(),
            control_server_service: "5200".into(),
            control_client_address: String::new(),
            control_client_service: String::new(),
            data_local_address: String::new(),
            data_wide_address: String::new(),
            data_wide_service: String::new(),
            data_output_path: PathBuf::from("."),
            logging_enabled: false,
            logging_path: config_dir().join("sdispatch.log"),
        }
    }
}

pub fn default_path() -> PathBuf {
    config_dir().join("sdispatch.toml")
}

impl Settings {
    /// Read `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(data) => toml::from_str(&data).with_context(|| format!("parse {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("read {}", path.display())),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        let data = toml::to_string_pretty(self)?;
        // atomic write
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        use std::io::Write as _;
        tmp.write_all(data.as_bytes())?;
        tmp.flush()?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o600));
        }
        tmp.persist(path).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }
}
