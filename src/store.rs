//! Encrypted declarative tunnel configuration.
//!
//! [`ConfigStore`] is the single authority for loading, mutating, and
//! persisting the tunnel declarations. The on-disk format is lowercase hex
//! of `AES-128-CBC(PKCS#7(pretty-JSON(Config)))` in a single file.
//!
//! Persistence rules:
//!
//! - A missing or empty file materializes the default config and writes it.
//! - An unreadable file (bad hex, failed decryption, malformed JSON) is
//!   moved aside to `<path>.corrupt` and replaced by the default config —
//!   the user's bytes survive for manual recovery.
//! - Every mutation re-encrypts and overwrites the file; mutations that
//!   reference an unknown id are silent no-ops and skip the write.
//! - I/O and crypto failures are logged here and never propagated to the
//!   tunnel supervisor.
//!
//! The store is not internally locked. It is expected to be driven from the
//! host's control thread; concurrent callers must serialize externally.

use std::fs;
use std::path::{Path, PathBuf};

use hex_literal::hex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::crypto::{self, CryptoError};

/// Cipher key for the config blob, compiled into the binary.
const CONFIG_KEY: [u8; 16] = hex!("68e4da8059897460a2e2eef0f8f04aea");
/// CBC initialization vector for the config blob.
const CONFIG_IV: [u8; 16] = hex!("aec61a049d064ea7d0dc0f5ed070d42e");

/// Root of the declarative configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Server groups, each carrying the tunnels that share its credentials.
    #[serde(rename = "config")]
    pub servers: Vec<ServerGroup>,
    /// UI theme flag (dark when true).
    pub is_dark: bool,
    /// UI language flag (english when true).
    pub is_english: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            is_dark: true,
            is_english: true,
        }
    }
}

/// A set of tunnels sharing one SSH endpoint and its credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerGroup {
    /// Stable identity; reorderings are not semantic changes.
    pub id: String,
    pub username: String,
    pub password: String,
    /// Display name, cosmetic only.
    pub server_name: String,
    pub server_host: String,
    pub server_port: u16,
    /// Tunnels declared under this server.
    pub link_group: Vec<Link>,
    /// Gate for the entire group; closed groups run nothing.
    pub is_open: bool,
    pub notes: String,
}

/// One declared tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    /// Stable identity within the owning group.
    pub id: String,
    /// Display name, cosmetic only.
    pub name: String,
    pub local_host: String,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    /// false = forward (local listener), true = reverse (remote listener).
    pub is_penetrate: bool,
    /// Per-tunnel gate.
    pub is_open: bool,
    pub notes: String,
}

/// Persistence failure kinds. Logged at the store boundary, never returned
/// to supervisor-facing callers.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("config file i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("config decryption: {0}")]
    Crypto(#[from] CryptoError),
    #[error("config decoding: {0}")]
    Decode(String),
}

/// Owner of the config file and its in-memory image.
pub struct ConfigStore {
    path: PathBuf,
    config: Config,
}

impl ConfigStore {
    /// Open the store at `path`, loading the existing config or
    /// materializing the default one.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let config = match load_file(&path) {
            Ok(Some(config)) => {
                info!(
                    "Loaded config from {} ({} server group(s))",
                    path.display(),
                    config.servers.len()
                );
                config
            }
            Ok(None) => {
                let config = Config::default();
                match persist(&path, &config) {
                    Ok(()) => info!("Initialized default config at {}", path.display()),
                    Err(e) => error!("Failed to write default config: {e}"),
                }
                config
            }
            Err(StoreError::Io(e)) => {
                // Unreadable but present-looking file: keep it, run on defaults.
                warn!("Failed to read config file, using defaults: {e}");
                Config::default()
            }
            Err(e) => {
                error!("Config file is unreadable ({e}), moving it aside");
                backup_corrupt(&path);
                Config::default()
            }
        };
        Self { path, config }
    }

    /// The current in-memory configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-encrypt and overwrite the backing file with the current config.
    pub fn save(&self) {
        match persist(&self.path, &self.config) {
            Ok(()) => info!("Config saved"),
            Err(e) => error!("Failed to persist config: {e}"),
        }
    }

    /// Append a server group and persist.
    pub fn add_server_group(&mut self, group: ServerGroup) {
        self.config.servers.push(group);
        self.save();
    }

    /// Replace the group with the given id. Unknown id is a no-op.
    pub fn modify_server_group(&mut self, id: &str, group: ServerGroup) {
        let Some(existing) = self.config.servers.iter_mut().find(|g| g.id == id) else {
            return;
        };
        *existing = group;
        self.save();
    }

    /// Remove the group with the given id. Unknown id is a no-op.
    pub fn remove_server_group(&mut self, id: &str) {
        let before = self.config.servers.len();
        self.config.servers.retain(|g| g.id != id);
        if self.config.servers.len() != before {
            self.save();
        }
    }

    /// Append a link to the group with `server_id`. Unknown group is a no-op.
    pub fn add_link(&mut self, server_id: &str, link: Link) {
        let Some(group) = self.config.servers.iter_mut().find(|g| g.id == server_id) else {
            return;
        };
        group.link_group.push(link);
        self.save();
    }

    /// Replace a link inside a group. Unknown group or link id is a no-op.
    pub fn modify_link(&mut self, server_id: &str, link_id: &str, link: Link) {
        let Some(group) = self.config.servers.iter_mut().find(|g| g.id == server_id) else {
            return;
        };
        let Some(existing) = group.link_group.iter_mut().find(|l| l.id == link_id) else {
            return;
        };
        *existing = link;
        self.save();
    }

    /// Remove a link from a group. Unknown group or link id is a no-op.
    pub fn remove_link(&mut self, server_id: &str, link_id: &str) {
        let Some(group) = self.config.servers.iter_mut().find(|g| g.id == server_id) else {
            return;
        };
        let before = group.link_group.len();
        group.link_group.retain(|l| l.id != link_id);
        if group.link_group.len() != before {
            self.save();
        }
    }

    /// Set the theme flag and persist.
    pub fn set_theme(&mut self, dark: bool) {
        self.config.is_dark = dark;
        self.save();
    }

    /// Set the language flag and persist.
    pub fn set_language(&mut self, english: bool) {
        self.config.is_english = english;
        self.save();
    }
}

/// Read and decode the config file.
///
/// `Ok(None)` means the file is missing or empty (caller materializes the
/// default); errors distinguish plain I/O from decode failures because only
/// the latter trigger the corrupt-file backup.
fn load_file(path: &Path) -> Result<Option<Config>, StoreError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::Io(e)),
    };
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    let blob = hex::decode(text).map_err(|e| StoreError::Decode(e.to_string()))?;
    let plain = crypto::decrypt(&blob, &CONFIG_KEY, &CONFIG_IV)?;
    let config = serde_json::from_slice(&plain).map_err(|e| StoreError::Decode(e.to_string()))?;
    Ok(Some(config))
}

/// Serialize, encrypt, hex-encode, and write the config file.
fn persist(path: &Path, config: &Config) -> Result<(), StoreError> {
    let json =
        serde_json::to_vec_pretty(config).map_err(|e| StoreError::Decode(e.to_string()))?;
    let blob = crypto::encrypt(&json, &CONFIG_KEY, &CONFIG_IV)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, hex::encode(blob))?;
    Ok(())
}

/// Move an undecodable config file to `<path>.corrupt` so the default can
/// take its place without destroying the user's data.
fn backup_corrupt(path: &Path) {
    let mut backup = path.as_os_str().to_os_string();
    backup.push(".corrupt");
    let backup = PathBuf::from(backup);
    match fs::rename(path, &backup) {
        Ok(()) => warn!("Unreadable config moved to {}", backup.display()),
        Err(e) => error!("Failed to move unreadable config aside: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_link(id: &str) -> Link {
        Link {
            id: id.to_string(),
            name: format!("link-{id}"),
            local_host: "127.0.0.1".to_string(),
            local_port: 8080,
            remote_host: "127.0.0.1".to_string(),
            remote_port: 80,
            is_penetrate: false,
            is_open: true,
            notes: String::new(),
        }
    }

    fn sample_group(id: &str) -> ServerGroup {
        ServerGroup {
            id: id.to_string(),
            username: "deploy".to_string(),
            password: "hunter2".to_string(),
            server_name: format!("server-{id}"),
            server_host: "203.0.113.10".to_string(),
            server_port: 22,
            link_group: vec![sample_link("l1")],
            is_open: true,
            notes: String::new(),
        }
    }

    fn store_in(dir: &tempfile::TempDir) -> ConfigStore {
        ConfigStore::open(dir.path().join("config.rex"))
    }

    #[test]
    fn test_missing_file_materializes_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        assert_eq!(store.config(), &Config::default());
        assert!(store.config().is_dark);
        assert!(store.config().is_english);
        // The default was persisted and is valid hex.
        let text = fs::read_to_string(store.path()).unwrap();
        assert!(hex::decode(text.trim()).is_ok());
    }

    #[test]
    fn test_empty_file_materializes_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.rex");
        fs::write(&path, "").unwrap();
        let store = ConfigStore::open(&path);
        assert_eq!(store.config(), &Config::default());
        assert!(!fs::read_to_string(&path).unwrap().is_empty());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);
        store.add_server_group(sample_group("s1"));
        store.add_link("s1", sample_link("l2"));
        store.set_theme(false);

        let reopened = ConfigStore::open(store.path());
        assert_eq!(reopened.config(), store.config());
        assert_eq!(reopened.config().servers[0].link_group.len(), 2);
        assert!(!reopened.config().is_dark);
    }

    #[test]
    fn test_unknown_id_mutations_are_noops_without_write() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);
        store.add_server_group(sample_group("s1"));
        let on_disk = fs::read_to_string(store.path()).unwrap();

        store.modify_server_group("nope", sample_group("nope"));
        store.remove_server_group("nope");
        store.add_link("nope", sample_link("lx"));
        store.modify_link("s1", "nope", sample_link("nope"));
        store.modify_link("nope", "l1", sample_link("l1"));
        store.remove_link("s1", "nope");

        assert_eq!(store.config().servers.len(), 1);
        assert_eq!(store.config().servers[0].link_group.len(), 1);
        // No-ops must not churn the file.
        assert_eq!(fs::read_to_string(store.path()).unwrap(), on_disk);
    }

    #[test]
    fn test_modify_and_remove_link() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);
        store.add_server_group(sample_group("s1"));

        let mut changed = sample_link("l1");
        changed.local_port = 9999;
        store.modify_link("s1", "l1", changed);
        assert_eq!(store.config().servers[0].link_group[0].local_port, 9999);

        store.remove_link("s1", "l1");
        assert!(store.config().servers[0].link_group.is_empty());

        let reopened = ConfigStore::open(store.path());
        assert!(reopened.config().servers[0].link_group.is_empty());
    }

    #[test]
    fn test_corrupt_file_backed_up_and_defaulted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.rex");
        fs::write(&path, "zz-definitely-not-hex").unwrap();

        let store = ConfigStore::open(&path);
        assert_eq!(store.config(), &Config::default());
        assert!(!path.exists());
        assert!(dir.path().join("config.rex.corrupt").exists());
    }

    #[test]
    fn test_undecryptable_hex_backed_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.rex");
        // Valid hex, but not a valid ciphertext (wrong length for CBC).
        fs::write(&path, hex::encode([0u8; 17])).unwrap();

        let store = ConfigStore::open(&path);
        assert_eq!(store.config(), &Config::default());
        assert!(!path.exists());
        assert!(dir.path().join("config.rex.corrupt").exists());
    }

    #[test]
    fn test_wire_field_names() {
        let config = Config {
            servers: vec![sample_group("s1")],
            ..Config::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        for key in [
            "\"config\"",
            "\"is_dark\"",
            "\"is_english\"",
            "\"server_host\"",
            "\"link_group\"",
            "\"is_penetrate\"",
            "\"local_port\"",
            "\"remote_port\"",
        ] {
            assert!(json.contains(key), "missing {key} in {json}");
        }
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
