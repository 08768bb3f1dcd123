//! Credential store
//!
//! Secrets are kept out of connection profiles and resolved by key through a
//! `CredentialStore`. The store sits on one backend chosen at startup:
//!
//! - **keyring**: OS keychain (macOS Keychain, Windows Credential Manager,
//!   Secret Service). All secrets live in a SINGLE entry as a JSON map so the
//!   user is prompted at most once.
//! - **encrypted-file**: AES-256-GCM sealed JSON map with a random key file
//!   next to it, for machines without a reachable keyring.
//! - **plaintext**: JSON file, only with explicit consent.
//! - **memory**: nothing persisted (tests, ad-hoc sessions).
//!
//! Reads go through an immutable snapshot; writers build a new map, persist
//! it, then swap the snapshot in.

use crate::config::settings::{CredentialBackendChoice, CredentialSettings};
use crate::error::{CredentialError, CredentialResult};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use parking_lot::{Mutex, RwLock};
use ring::aead::{AES_256_GCM, Aad, LessSafeKey, NONCE_LEN, Nonce, UnboundKey};
use ring::rand::{SecureRandom, SystemRandom};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A secret value. `Debug` never prints the payload and there is no
/// `Serialize` impl, so it cannot leak into logs or profile files.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

/// Storage backend tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendTag {
    Keyring,
    EncryptedFile,
    Plaintext,
    Memory,
}

/// Where the secret map is persisted
pub trait CredentialBackend: Send + Sync {
    fn tag(&self) -> BackendTag;

    /// Read the full secret map; a missing store is an empty map
    fn load(&self) -> CredentialResult<HashMap<String, String>>;

    fn persist(&self, secrets: &HashMap<String, String>) -> CredentialResult<()>;
}

type Snapshot = Arc<HashMap<String, String>>;

/// Key-addressed secret lookup over one backend
pub struct CredentialStore {
    backend: Box<dyn CredentialBackend>,
    /// Loaded lazily on first access
    snapshot: RwLock<Option<Snapshot>>,
    write_lock: Mutex<()>,
}

impl CredentialStore {
    pub fn new(backend: Box<dyn CredentialBackend>) -> Self {
        tracing::debug!(backend = ?backend.tag(), "credential store initialized");
        Self {
            backend,
            snapshot: RwLock::new(None),
            write_lock: Mutex::new(()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryBackend))
    }

    /// Choose the backend once, from settings.
    ///
    /// `Auto` prefers the OS keyring and falls back to the encrypted file
    /// only when the user allowed it.
    pub fn from_settings(settings: &CredentialSettings, dir: &Path) -> CredentialResult<Self> {
        let backend: Box<dyn CredentialBackend> = match settings.backend {
            CredentialBackendChoice::Keyring => Box::new(keyring_backend()?),
            CredentialBackendChoice::EncryptedFile => Box::new(EncryptedFileBackend::new(dir)),
            CredentialBackendChoice::Plaintext => {
                if !settings.plaintext_consent {
                    return Err(CredentialError::ConsentRequired);
                }
                Box::new(PlaintextBackend::new(dir.join("credentials.json")))
            }
            CredentialBackendChoice::Auto => match keyring_backend() {
                Ok(backend) => Box::new(backend),
                Err(e) if settings.allow_file_fallback => {
                    tracing::info!(error = %e, "keyring unavailable, using encrypted file");
                    Box::new(EncryptedFileBackend::new(dir))
                }
                Err(e) => return Err(e),
            },
        };
        Ok(Self::new(backend))
    }

    pub fn backend_tag(&self) -> BackendTag {
        self.backend.tag()
    }

    fn current(&self) -> CredentialResult<Snapshot> {
        if let Some(snapshot) = self.snapshot.read().as_ref() {
            return Ok(snapshot.clone());
        }
        let mut slot = self.snapshot.write();
        if let Some(snapshot) = slot.as_ref() {
            return Ok(snapshot.clone());
        }
        let loaded = Arc::new(self.backend.load()?);
        tracing::debug!(count = loaded.len(), "loaded credentials");
        *slot = Some(loaded.clone());
        Ok(loaded)
    }

    pub fn get(&self, key: &str) -> CredentialResult<Option<Secret>> {
        Ok(self.current()?.get(key).map(|v| Secret::new(v.clone())))
    }

    pub fn set(&self, key: &str, secret: &Secret) -> CredentialResult<()> {
        self.update(|map| {
            map.insert(key.to_string(), secret.expose().to_string());
        })?;
        tracing::debug!(key, "stored credential");
        Ok(())
    }

    pub fn delete(&self, key: &str) -> CredentialResult<()> {
        self.update(|map| {
            map.remove(key);
        })
    }

    fn update(&self, edit: impl FnOnce(&mut HashMap<String, String>)) -> CredentialResult<()> {
        let _guard = self.write_lock.lock();
        let mut next = (*self.current()?).clone();
        edit(&mut next);
        self.backend.persist(&next)?;
        *self.snapshot.write() = Some(Arc::new(next));
        Ok(())
    }
}

/// No persistence
pub struct MemoryBackend;

impl CredentialBackend for MemoryBackend {
    fn tag(&self) -> BackendTag {
        BackendTag::Memory
    }

    fn load(&self) -> CredentialResult<HashMap<String, String>> {
        Ok(HashMap::new())
    }

    fn persist(&self, _secrets: &HashMap<String, String>) -> CredentialResult<()> {
        Ok(())
    }
}

#[cfg(feature = "keyring")]
fn keyring_backend() -> CredentialResult<KeyringBackend> {
    let backend = KeyringBackend::new();
    backend.probe()?;
    Ok(backend)
}

#[cfg(not(feature = "keyring"))]
fn keyring_backend() -> CredentialResult<std::convert::Infallible> {
    Err(CredentialError::Unavailable(
        "built without the `keyring` feature".to_string(),
    ))
}

#[cfg(not(feature = "keyring"))]
impl CredentialBackend for std::convert::Infallible {
    fn tag(&self) -> BackendTag {
        match *self {}
    }

    fn load(&self) -> CredentialResult<HashMap<String, String>> {
        match *self {}
    }

    fn persist(&self, _secrets: &HashMap<String, String>) -> CredentialResult<()> {
        match *self {}
    }
}

/// OS keychain, one JSON-map entry
#[cfg(feature = "keyring")]
pub struct KeyringBackend {
    service: String,
    account: String,
}

#[cfg(feature = "keyring")]
impl KeyringBackend {
    const SERVICE_NAME: &'static str = "dev.vizdb.connections";
    const ACCOUNT_NAME: &'static str = "credentials";

    pub fn new() -> Self {
        Self {
            service: Self::SERVICE_NAME.to_string(),
            account: Self::ACCOUNT_NAME.to_string(),
        }
    }

    fn entry(&self) -> CredentialResult<keyring::Entry> {
        keyring::Entry::new(&self.service, &self.account)
            .map_err(|e| CredentialError::Unavailable(format!("keyring entry: {}", e)))
    }

    /// Check that the keychain answers at all
    fn probe(&self) -> CredentialResult<()> {
        match self.entry()?.get_password() {
            Ok(_) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(CredentialError::Unavailable(e.to_string())),
        }
    }
}

#[cfg(feature = "keyring")]
impl Default for KeyringBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "keyring")]
impl CredentialBackend for KeyringBackend {
    fn tag(&self) -> BackendTag {
        BackendTag::Keyring
    }

    fn load(&self) -> CredentialResult<HashMap<String, String>> {
        match self.entry()?.get_password() {
            Ok(json) => serde_json::from_str(&json)
                .map_err(|e| CredentialError::Storage(format!("corrupt keyring entry: {}", e))),
            Err(keyring::Error::NoEntry) => Ok(HashMap::new()),
            Err(e) => Err(CredentialError::Unavailable(e.to_string())),
        }
    }

    fn persist(&self, secrets: &HashMap<String, String>) -> CredentialResult<()> {
        let entry = self.entry()?;
        if secrets.is_empty() {
            return match entry.delete_credential() {
                Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
                Err(e) => Err(CredentialError::Storage(e.to_string())),
            };
        }
        let json = serde_json::to_string(secrets)
            .map_err(|e| CredentialError::Storage(e.to_string()))?;
        entry
            .set_password(&json)
            .map_err(|e| CredentialError::Storage(e.to_string()))
    }
}

/// AES-256-GCM sealed file with a random key stored alongside
pub struct EncryptedFileBackend {
    data_path: PathBuf,
    key_path: PathBuf,
}

impl EncryptedFileBackend {
    pub fn new(dir: &Path) -> Self {
        Self {
            data_path: dir.join("credentials.enc"),
            key_path: dir.join("credentials.key"),
        }
    }

    fn key(&self, create: bool) -> CredentialResult<Option<LessSafeKey>> {
        let bytes = if self.key_path.exists() {
            let encoded = std::fs::read_to_string(&self.key_path)
                .map_err(|e| CredentialError::Storage(e.to_string()))?;
            BASE64
                .decode(encoded.trim())
                .map_err(|e| CredentialError::Decrypt(format!("bad key file: {}", e)))?
        } else if create {
            let mut bytes = vec![0u8; AES_256_GCM.key_len()];
            SystemRandom::new()
                .fill(&mut bytes)
                .map_err(|_| CredentialError::Storage("no randomness available".into()))?;
            write_private(&self.key_path, BASE64.encode(&bytes).as_bytes())?;
            bytes
        } else {
            return Ok(None);
        };
        let unbound = UnboundKey::new(&AES_256_GCM, &bytes)
            .map_err(|_| CredentialError::Decrypt("bad key length".into()))?;
        Ok(Some(LessSafeKey::new(unbound)))
    }
}

impl CredentialBackend for EncryptedFileBackend {
    fn tag(&self) -> BackendTag {
        BackendTag::EncryptedFile
    }

    fn load(&self) -> CredentialResult<HashMap<String, String>> {
        if !self.data_path.exists() {
            return Ok(HashMap::new());
        }
        let Some(key) = self.key(false)? else {
            return Err(CredentialError::Decrypt("key file is missing".into()));
        };
        let encoded = std::fs::read_to_string(&self.data_path)
            .map_err(|e| CredentialError::Storage(e.to_string()))?;
        let mut sealed = BASE64
            .decode(encoded.trim())
            .map_err(|e| CredentialError::Decrypt(e.to_string()))?;
        if sealed.len() < NONCE_LEN {
            return Err(CredentialError::Decrypt("truncated file".into()));
        }
        let mut ciphertext = sealed.split_off(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(&sealed)
            .map_err(|_| CredentialError::Decrypt("bad nonce".into()))?;
        let plain = key
            .open_in_place(nonce, Aad::empty(), &mut ciphertext)
            .map_err(|_| CredentialError::Decrypt("authentication failed".into()))?;
        serde_json::from_slice(plain).map_err(|e| CredentialError::Decrypt(e.to_string()))
    }

    fn persist(&self, secrets: &HashMap<String, String>) -> CredentialResult<()> {
        let Some(key) = self.key(true)? else {
            return Err(CredentialError::Storage("could not create key".into()));
        };
        let mut nonce_bytes = [0u8; NONCE_LEN];
        SystemRandom::new()
            .fill(&mut nonce_bytes)
            .map_err(|_| CredentialError::Storage("no randomness available".into()))?;
        let mut buf =
            serde_json::to_vec(secrets).map_err(|e| CredentialError::Storage(e.to_string()))?;
        key.seal_in_place_append_tag(Nonce::assume_unique_for_key(nonce_bytes), Aad::empty(), &mut buf)
            .map_err(|_| CredentialError::Storage("encryption failed".into()))?;

        let mut sealed = nonce_bytes.to_vec();
        sealed.extend_from_slice(&buf);
        write_private(&self.data_path, BASE64.encode(sealed).as_bytes())
    }
}

/// Unencrypted JSON file; only constructed after explicit consent
pub struct PlaintextBackend {
    path: PathBuf,
}

impl PlaintextBackend {
    pub fn new(path: PathBuf) -> Self {
        tracing::warn!(path = %path.display(), "storing credentials in plaintext");
        Self { path }
    }
}

impl CredentialBackend for PlaintextBackend {
    fn tag(&self) -> BackendTag {
        BackendTag::Plaintext
    }

    fn load(&self) -> CredentialResult<HashMap<String, String>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let content = std::fs::read_to_string(&self.path)
            .map_err(|e| CredentialError::Storage(e.to_string()))?;
        serde_json::from_str(&content).map_err(|e| CredentialError::Storage(e.to_string()))
    }

    fn persist(&self, secrets: &HashMap<String, String>) -> CredentialResult<()> {
        let json = serde_json::to_vec_pretty(secrets)
            .map_err(|e| CredentialError::Storage(e.to_string()))?;
        write_private(&self.path, &json)
    }
}

/// Write a file readable only by the owner (on unix)
fn write_private(path: &Path, contents: &[u8]) -> CredentialResult<()> {
    let storage = |e: std::io::Error| CredentialError::Storage(format!("{}: {}", path.display(), e));
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(storage)?;
    }
    std::fs::write(path, contents).map_err(storage)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).map_err(storage)?;
    }
    Ok(())
}
