//! Agent configuration: `/etc/mender/mender.conf` overlaid on the fallback
//! `/var/lib/mender/mender.conf`, both JSON with PascalCase keys. Missing
//! files are fine; every option has a default.

use crate::error::{self, Error, Result};
use log::{debug, warn};
use mender_artifact::VerifyKey;
use serde::Deserialize;
use snafu::{ensure, ResultExt};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct ConfigFile {
    #[serde(rename = "ServerURL")]
    server_url: Option<String>,
    servers: Option<Vec<ServerEntry>>,
    tenant_token: Option<String>,
    artifact_verify_key: Option<PathBuf>,
    artifact_verify_keys: Option<Vec<PathBuf>>,
    https_client: Option<HttpsClient>,
    security: Option<Security>,
    server_certificate: Option<PathBuf>,
    skip_verify: Option<bool>,
    update_poll_interval_seconds: Option<u64>,
    inventory_poll_interval_seconds: Option<u64>,
    retry_poll_interval_seconds: Option<u64>,
    retry_poll_count: Option<u32>,
    state_script_timeout_seconds: Option<u64>,
    state_script_retry_timeout_seconds: Option<u64>,
    state_script_retry_interval_seconds: Option<u64>,
    module_timeout_seconds: Option<u64>,
    update_log_path: Option<PathBuf>,
    device_type_file: Option<PathBuf>,
    daemon_log_level: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct ServerEntry {
    #[serde(rename = "ServerURL")]
    pub server_url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct HttpsClient {
    pub certificate: Option<PathBuf>,
    pub key: Option<PathBuf>,
    #[serde(rename = "SSLEngine")]
    pub ssl_engine: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Security {
    pub auth_private_key: Option<PathBuf>,
    #[serde(rename = "SSLEngine")]
    pub ssl_engine: Option<String>,
}

/// The resolved configuration the rest of the agent works from.
#[derive(Debug, Clone)]
pub struct MenderConfig {
    pub servers: Vec<String>,
    pub tenant_token: String,
    pub artifact_verify_keys: Vec<PathBuf>,
    pub https_client: HttpsClient,
    pub security: Security,
    pub server_certificate: Option<PathBuf>,
    pub skip_verify: bool,
    pub update_poll_interval: Duration,
    pub inventory_poll_interval: Duration,
    pub retry_poll_interval: Duration,
    pub retry_poll_count: u32,
    pub state_script_timeout: Duration,
    pub state_script_retry_timeout: Duration,
    pub state_script_retry_interval: Duration,
    pub module_timeout: Duration,
    pub daemon_log_level: Option<String>,

    pub data_store_dir: PathBuf,
    pub update_log_path: PathBuf,
    pub device_type_file: PathBuf,
    pub modules_path: PathBuf,
    pub modules_work_path: PathBuf,
    pub rootfs_scripts_path: PathBuf,
    pub artifact_scripts_path: PathBuf,
    pub inventory_generators_dir: PathBuf,
    pub auth_socket_path: PathBuf,
}

impl Default for MenderConfig {
    fn default() -> Self {
        let data_store_dir = PathBuf::from(constants::DEFAULT_DATA_STORE_DIR);
        Self {
            servers: vec![],
            tenant_token: String::new(),
            artifact_verify_keys: vec![],
            https_client: HttpsClient::default(),
            security: Security::default(),
            server_certificate: None,
            skip_verify: false,
            update_poll_interval: Duration::from_secs(1800),
            inventory_poll_interval: Duration::from_secs(28800),
            retry_poll_interval: Duration::from_secs(300),
            retry_poll_count: 5,
            state_script_timeout: Duration::from_secs(3600),
            state_script_retry_timeout: Duration::from_secs(1800),
            state_script_retry_interval: Duration::from_secs(60),
            module_timeout: Duration::from_secs(14400),
            daemon_log_level: None,
            update_log_path: data_store_dir.clone(),
            device_type_file: PathBuf::from(constants::DEFAULT_DEVICE_TYPE_FILE),
            modules_path: PathBuf::from(constants::DEFAULT_MODULES_PATH),
            modules_work_path: PathBuf::from(constants::DEFAULT_MODULES_WORK_PATH),
            rootfs_scripts_path: PathBuf::from(constants::DEFAULT_ROOTFS_SCRIPTS_PATH),
            artifact_scripts_path: PathBuf::from(constants::DEFAULT_ARTIFACT_SCRIPTS_PATH),
            inventory_generators_dir: PathBuf::from(constants::DEFAULT_INVENTORY_GENERATORS_DIR),
            auth_socket_path: PathBuf::from(constants::DEFAULT_AUTH_SOCKET),
            data_store_dir,
        }
    }
}

impl MenderConfig {
    /// Loads the fallback file first, then the main file on top of it.
    /// `explicit` marks a path given on the command line, whose absence is
    /// an error; default paths may be missing.
    pub fn load(
        main_path: &Path,
        main_explicit: bool,
        fallback_path: &Path,
        fallback_explicit: bool,
    ) -> Result<Self> {
        let mut merged = ConfigFile::default();
        for (path, explicit) in [(fallback_path, fallback_explicit), (main_path, main_explicit)] {
            match load_file(path, explicit)? {
                Some(file) => overlay(&mut merged, file),
                None => {}
            }
        }

        ensure!(
            !(merged.artifact_verify_key.is_some() && merged.artifact_verify_keys.is_some()),
            error::ConflictingVerifyKeysSnafu
        );

        let mut config = MenderConfig::default();

        let mut servers: Vec<String> = merged
            .servers
            .unwrap_or_default()
            .into_iter()
            .map(|s| s.server_url)
            .collect();
        if let Some(url) = merged.server_url {
            if servers.is_empty() {
                servers.push(url);
            } else {
                warn!("Both ServerURL and Servers are set; ignoring ServerURL");
            }
        }
        config.servers = servers;

        config.tenant_token = merged.tenant_token.unwrap_or_default();
        config.artifact_verify_keys = match (merged.artifact_verify_key, merged.artifact_verify_keys)
        {
            (Some(key), None) => vec![key],
            (None, Some(keys)) => keys,
            _ => vec![],
        };
        config.https_client = merged.https_client.unwrap_or_default();
        config.security = merged.security.unwrap_or_default();
        config.server_certificate = merged.server_certificate;
        config.skip_verify = merged.skip_verify.unwrap_or(false);

        let secs = Duration::from_secs;
        if let Some(v) = merged.update_poll_interval_seconds {
            config.update_poll_interval = secs(v);
        }
        if let Some(v) = merged.inventory_poll_interval_seconds {
            config.inventory_poll_interval = secs(v);
        }
        if let Some(v) = merged.retry_poll_interval_seconds {
            config.retry_poll_interval = secs(v);
        }
        if let Some(v) = merged.retry_poll_count {
            config.retry_poll_count = v;
        }
        if let Some(v) = merged.state_script_timeout_seconds {
            config.state_script_timeout = secs(v);
        }
        if let Some(v) = merged.state_script_retry_timeout_seconds {
            config.state_script_retry_timeout = secs(v);
        }
        if let Some(v) = merged.state_script_retry_interval_seconds {
            config.state_script_retry_interval = secs(v);
        }
        if let Some(v) = merged.module_timeout_seconds {
            config.module_timeout = secs(v);
        }
        if let Some(v) = merged.update_log_path {
            config.update_log_path = v;
        }
        if let Some(v) = merged.device_type_file {
            config.device_type_file = v;
        }
        config.daemon_log_level = merged.daemon_log_level;

        Ok(config)
    }

    /// Re-derives the paths that live under the data store dir. Used when
    /// `--data` overrides the default location.
    pub fn set_data_store_dir(&mut self, dir: PathBuf) {
        self.update_log_path = dir.clone();
        self.device_type_file = dir.join("device_type");
        self.modules_work_path = dir.join("modules/v3");
        self.artifact_scripts_path = dir.join("scripts");
        self.data_store_dir = dir;
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_store_dir.join(constants::STORE_FILE_NAME)
    }

    /// The server URL API requests go to when the auth daemon hasn't
    /// supplied a proxy URL.
    pub fn server_url(&self) -> Option<&str> {
        self.servers.first().map(String::as_str)
    }

    /// Loads and parses the configured artifact verification keys.
    pub fn verify_keys(&self) -> Result<Vec<VerifyKey>> {
        let mut keys = Vec::new();
        for path in &self.artifact_verify_keys {
            let pem = std::fs::read(path).context(error::VerifyKeyReadSnafu { path })?;
            keys.push(VerifyKey::from_pem(&pem)?);
        }
        Ok(keys)
    }

    /// Reads the device type from its file: a single `device_type=<value>`
    /// line.
    pub fn device_type(&self) -> Result<String> {
        let path = &self.device_type_file;
        let raw = std::fs::read_to_string(path).context(error::DeviceTypeReadSnafu { path })?;
        raw.lines()
            .find_map(|line| line.strip_prefix("device_type="))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::DeviceTypeParse { path: path.clone() })
    }
}

fn load_file(path: &Path, explicit: bool) -> Result<Option<ConfigFile>> {
    let raw = match std::fs::read_to_string(path) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && !explicit => {
            debug!("No config file at '{}'", path.display());
            return Ok(None);
        }
        Err(e) => return Err(Error::ConfigRead {
            path: path.to_path_buf(),
            source: e,
        }),
        Ok(raw) => raw,
    };
    let file = serde_json::from_str(&raw).context(error::ConfigParseSnafu { path })?;
    Ok(Some(file))
}

/// Later files override earlier ones, option by option.
fn overlay(base: &mut ConfigFile, other: ConfigFile) {
    macro_rules! take {
        ($($field:ident),* $(,)?) => {
            $(if other.$field.is_some() { base.$field = other.$field; })*
        };
    }
    take!(
        server_url,
        servers,
        tenant_token,
        artifact_verify_key,
        artifact_verify_keys,
        https_client,
        security,
        server_certificate,
        skip_verify,
        update_poll_interval_seconds,
        inventory_poll_interval_seconds,
        retry_poll_interval_seconds,
        retry_poll_count,
        state_script_timeout_seconds,
        state_script_retry_timeout_seconds,
        state_script_retry_interval_seconds,
        module_timeout_seconds,
        update_log_path,
        device_type_file,
        daemon_log_level,
    );
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::TempDir;

    fn write_config(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn defaults_apply_without_any_file() {
        let dir = TempDir::new().unwrap();
        let config = MenderConfig::load(
            &dir.path().join("absent.conf"),
            false,
            &dir.path().join("absent-fallback.conf"),
            false,
        )
        .unwrap();
        assert_eq!(config.update_poll_interval, Duration::from_secs(1800));
        assert_eq!(config.inventory_poll_interval, Duration::from_secs(28800));
        assert_eq!(config.module_timeout, Duration::from_secs(14400));
        assert_eq!(config.state_script_timeout, Duration::from_secs(3600));
        assert!(config.servers.is_empty());
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let err = MenderConfig::load(
            &dir.path().join("absent.conf"),
            true,
            &dir.path().join("absent-fallback.conf"),
            false,
        )
        .unwrap_err();
        assert!(matches!(err, Error::ConfigRead { .. }));
    }

    #[test]
    fn main_file_overrides_fallback() {
        let dir = TempDir::new().unwrap();
        let fallback = write_config(
            &dir,
            "fallback.conf",
            r#"{"ServerURL": "https://fallback.example", "UpdatePollIntervalSeconds": 60}"#,
        );
        let main = write_config(
            &dir,
            "main.conf",
            r#"{"ServerURL": "https://hosted.example"}"#,
        );
        let config = MenderConfig::load(&main, true, &fallback, false).unwrap();
        assert_eq!(config.servers, vec!["https://hosted.example"]);
        // The fallback's value survives where the main file is silent.
        assert_eq!(config.update_poll_interval, Duration::from_secs(60));
    }

    #[test]
    fn conflicting_verify_key_options_are_rejected() {
        let dir = TempDir::new().unwrap();
        let main = write_config(
            &dir,
            "main.conf",
            r#"{"ArtifactVerifyKey": "/a.pem", "ArtifactVerifyKeys": ["/b.pem"]}"#,
        );
        let err =
            MenderConfig::load(&main, true, &dir.path().join("absent"), false).unwrap_err();
        assert!(matches!(err, Error::ConflictingVerifyKeys));
    }

    #[test]
    fn servers_list_wins_over_server_url() {
        let dir = TempDir::new().unwrap();
        let main = write_config(
            &dir,
            "main.conf",
            r#"{"ServerURL": "https://single.example",
                "Servers": [{"ServerURL": "https://one.example"}, {"ServerURL": "https://two.example"}]}"#,
        );
        let config = MenderConfig::load(&main, true, &dir.path().join("absent"), false).unwrap();
        assert_eq!(
            config.servers,
            vec!["https://one.example", "https://two.example"]
        );
    }

    #[test]
    fn garbage_config_is_a_parse_error() {
        let dir = TempDir::new().unwrap();
        let main = write_config(&dir, "main.conf", "not json");
        let err =
            MenderConfig::load(&main, true, &dir.path().join("absent"), false).unwrap_err();
        assert!(matches!(err, Error::ConfigParse { .. }));
    }

    #[test]
    fn device_type_parses_its_file() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "device_type", "device_type=raspberrypi4\n");
        let mut config = MenderConfig::default();
        config.device_type_file = path;
        assert_eq!(config.device_type().unwrap(), "raspberrypi4");

        config.device_type_file = write_config(&dir, "bad", "something else\n");
        assert!(matches!(
            config.device_type().unwrap_err(),
            Error::DeviceTypeParse { .. }
        ));
    }

    #[test]
    fn data_store_override_rederives_paths() {
        let mut config = MenderConfig::default();
        config.set_data_store_dir(PathBuf::from("/tmp/test-data"));
        assert_eq!(config.store_path(), PathBuf::from("/tmp/test-data/mender-store"));
        assert_eq!(
            config.artifact_scripts_path,
            PathBuf::from("/tmp/test-data/scripts")
        );
        assert_eq!(
            config.modules_work_path,
            PathBuf::from("/tmp/test-data/modules/v3")
        );
    }
}
