use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

const DEFAULT_SHARED_QUEUE_ADDR: &str = "10.1.253.10:6379";
const DEFAULT_LOCAL_QUEUE_ADDR: &str = "127.0.0.1:6379";
const DEFAULT_SHARED_QUEUE_KEY: &str = "ISREQUESTS";
const DEFAULT_N_WORKER_THREADS: u32 = 8;
const DEFAULT_AUTH_KEY_PATH: &str = "is-kernel.auth.seed";

fn config_string(value: Option<String>, default: &str) -> String {
    value.unwrap_or_else(|| default.to_string())
}

fn config_u32(value: Option<u32>, default: u32) -> u32 {
    value.unwrap_or(default)
}

#[derive(Debug, Deserialize, Default)]
struct ConfigFile {
    queue: Option<QueueConfigFile>,
    supervisor: Option<SupervisorConfigFile>,
    auth: Option<AuthConfigFile>,
    metadata: Option<MetadataConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct QueueConfigFile {
    shared_addr: Option<String>,
    shared_key: Option<String>,
    local_addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct SupervisorConfigFile {
    n_worker_threads: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct AuthConfigFile {
    key_path: Option<PathBuf>,
    key_seed: Option<String>,
    verifying_key_hex: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct MetadataConfigFile {
    property_table_path: Option<PathBuf>,
}

/// Dispatcher- and supervisor-facing configuration, assembled from an
/// optional config file overlaid with environment variables.
///
/// Mirrors the two-stage `*ConfigFile` -> strongly-typed `Config`
/// pattern used throughout this codebase: an all-`Option` file struct is
/// read first, then defaults/env overrides are folded in and the result
/// is validated once.
#[derive(Debug, Clone)]
pub struct Config {
    pub queue: QueueSettings,
    pub supervisor: SupervisorSettings,
    pub auth: AuthSettings,
    pub metadata: MetadataSettings,
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub shared_addr: String,
    pub shared_key: String,
    pub local_addr: String,
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub n_worker_threads: u32,
}

#[derive(Debug, Clone)]
pub struct AuthSettings {
    pub key_path: PathBuf,
    pub key_seed: Option<String>,
    /// Hex-encoded ed25519 public key of the external signer whose
    /// `isAuth` assertions the dispatcher verifies. Required at
    /// startup; there is no embedded default since it is deployment
    /// key material, not a structural constant.
    pub verifying_key_hex: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MetadataSettings {
    pub property_table_path: Option<PathBuf>,
}

impl AuthSettings {
    /// Decode the configured verifying key, if present. Callers that
    /// need to authenticate requests (the dispatcher) should treat a
    /// `None` here as a fatal startup error; other binaries that never
    /// touch `isAuth` blobs can ignore it.
    pub fn verifying_key(&self) -> Result<Option<ed25519_dalek::VerifyingKey>> {
        let Some(hex_key) = &self.verifying_key_hex else {
            return Ok(None);
        };
        let bytes = hex::decode(hex_key)
            .map_err(|e| anyhow!("auth.verifying_key_hex is not valid hex: {}", e))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow!("auth.verifying_key_hex must decode to 32 bytes"))?;
        let key = ed25519_dalek::VerifyingKey::from_bytes(&arr)
            .map_err(|e| anyhow!("auth.verifying_key_hex is not a valid ed25519 key: {}", e))?;
        Ok(Some(key))
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("IS_KERNEL_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ConfigFile) -> Result<Self> {
        let queue = QueueSettings {
            shared_addr: config_string(
                file.queue.as_ref().and_then(|q| q.shared_addr.clone()),
                DEFAULT_SHARED_QUEUE_ADDR,
            ),
            shared_key: config_string(
                file.queue.as_ref().and_then(|q| q.shared_key.clone()),
                DEFAULT_SHARED_QUEUE_KEY,
            ),
            local_addr: config_string(
                file.queue.as_ref().and_then(|q| q.local_addr.clone()),
                DEFAULT_LOCAL_QUEUE_ADDR,
            ),
        };
        let supervisor = SupervisorSettings {
            n_worker_threads: config_u32(
                file.supervisor.and_then(|s| s.n_worker_threads),
                DEFAULT_N_WORKER_THREADS,
            ),
        };
        let auth = AuthSettings {
            key_path: file
                .auth
                .as_ref()
                .and_then(|a| a.key_path.clone())
                .unwrap_or_else(|| PathBuf::from(DEFAULT_AUTH_KEY_PATH)),
            key_seed: file.auth.as_ref().and_then(|a| a.key_seed.clone()),
            verifying_key_hex: file.auth.and_then(|a| a.verifying_key_hex),
        };
        let metadata = MetadataSettings {
            property_table_path: file.metadata.and_then(|m| m.property_table_path),
        };
        Ok(Self {
            queue,
            supervisor,
            auth,
            metadata,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var("IS_KERNEL_SHARED_QUEUE_ADDR") {
            if !addr.trim().is_empty() {
                self.queue.shared_addr = addr;
            }
        }
        if let Ok(addr) = std::env::var("IS_KERNEL_LOCAL_QUEUE_ADDR") {
            if !addr.trim().is_empty() {
                self.queue.local_addr = addr;
            }
        }
        if let Ok(n) = std::env::var("IS_KERNEL_N_WORKER_THREADS") {
            if !n.trim().is_empty() {
                self.supervisor.n_worker_threads = n
                    .parse()
                    .map_err(|_| anyhow!("IS_KERNEL_N_WORKER_THREADS must be an integer"))?;
            }
        }
        if let Ok(path) = std::env::var("IS_KERNEL_AUTH_KEY_PATH") {
            if !path.trim().is_empty() {
                self.auth.key_path = PathBuf::from(path);
            }
        }
        if let Ok(seed) = std::env::var("IS_KERNEL_AUTH_KEY_SEED") {
            if !seed.trim().is_empty() {
                self.auth.key_seed = Some(seed);
            }
        }
        if let Ok(hex_key) = std::env::var("IS_KERNEL_VERIFYING_KEY_HEX") {
            if !hex_key.trim().is_empty() {
                self.auth.verifying_key_hex = Some(hex_key);
            }
        }
        if let Ok(path) = std::env::var("IS_KERNEL_PROPERTY_TABLE_PATH") {
            if !path.trim().is_empty() {
                self.metadata.property_table_path = Some(PathBuf::from(path));
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.supervisor.n_worker_threads == 0 {
            return Err(anyhow!("supervisor.n_worker_threads must be greater than zero"));
        }
        if self.queue.shared_addr.trim().is_empty() {
            return Err(anyhow!("queue.shared_addr must not be empty"));
        }
        if self.queue.local_addr.trim().is_empty() {
            return Err(anyhow!("queue.local_addr must not be empty"));
        }
        if self.queue.shared_key.trim().is_empty() {
            return Err(anyhow!("queue.shared_key must not be empty"));
        }
        if let Some(hex_key) = &self.auth.verifying_key_hex {
            let bytes = hex::decode(hex_key)
                .map_err(|e| anyhow!("auth.verifying_key_hex is not valid hex: {}", e))?;
            if bytes.len() != 32 {
                return Err(anyhow!(
                    "auth.verifying_key_hex must decode to 32 bytes, got {}",
                    bytes.len()
                ));
            }
        }
        Ok(())
    }
}

fn read_config_file<T>(path: &Path) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
{
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;

    let cfg = if path.extension().map(|e| e == "toml").unwrap_or(false) {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid TOML config file {}: {}", path.display(), e))?
    } else if path.extension().map(|e| e == "json").unwrap_or(false) {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid JSON config file {}: {}", path.display(), e))?
    } else {
        match serde_json::from_str(&raw) {
            Ok(cfg) => cfg,
            Err(json_err) => match toml::from_str(&raw) {
                Ok(cfg) => cfg,
                Err(toml_err) => {
                    return Err(anyhow!(
                        "invalid config file {} (tried JSON and TOML): json error: {}; toml error: {}",
                        path.display(),
                        json_err,
                        toml_err
                    ));
                }
            },
        }
    };
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, Deserialize, PartialEq)]
    struct TestConfig {
        name: String,
        count: u32,
    }

    fn write_file(path: &std::path::Path, contents: &str) {
        std::fs::write(path, contents).expect("write temp config");
    }

    fn assert_reads_config(filename: &str, contents: &str, expected: &TestConfig) {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join(filename);
        write_file(&path, contents);

        let cfg: TestConfig = read_config_file(&path).expect("read config");
        assert_eq!(&cfg, expected);
    }

    #[test]
    fn reads_toml_config_by_extension() {
        assert_reads_config(
            "config.toml",
            "name = \"alpha\"\ncount = 3\n",
            &TestConfig {
                name: "alpha".to_string(),
                count: 3,
            },
        );
    }

    #[test]
    fn reads_json_config_by_extension() {
        assert_reads_config(
            "config.json",
            r#"{"name":"beta","count":7}"#,
            &TestConfig {
                name: "beta".to_string(),
                count: 7,
            },
        );
    }

    #[test]
    fn auto_detects_toml_without_extension() {
        assert_reads_config(
            "config",
            "name = \"gamma\"\ncount = 11\n",
            &TestConfig {
                name: "gamma".to_string(),
                count: 11,
            },
        );
    }

    #[test]
    fn defaults_populate_every_field() {
        let config = Config::from_file(ConfigFile::default()).expect("config should parse");
        assert_eq!(config.queue.shared_addr, DEFAULT_SHARED_QUEUE_ADDR);
        assert_eq!(config.queue.local_addr, DEFAULT_LOCAL_QUEUE_ADDR);
        assert_eq!(config.supervisor.n_worker_threads, DEFAULT_N_WORKER_THREADS);
        assert!(config.metadata.property_table_path.is_none());
    }

    #[test]
    fn rejects_zero_worker_threads() {
        let mut file = ConfigFile::default();
        file.supervisor = Some(SupervisorConfigFile {
            n_worker_threads: Some(0),
        });
        let mut config = Config::from_file(file).expect("config should parse");
        assert!(config.validate().is_err());
    }

    #[test]
    fn reports_errors_when_parsing_fails_for_both_formats() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("config");
        write_file(&path, "{not: json");

        let err = read_config_file::<TestConfig>(&path).expect_err("parse should fail");
        let message = err.to_string();
        assert!(message.contains("invalid config file"));
        assert!(message.contains("json error"));
        assert!(message.contains("toml error"));
    }
}
