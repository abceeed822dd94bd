//! # Identity Module
//!
//! Device ID and TLS client credential used to authenticate to the broker.
//!
//! ## Resolution
//!
//! ```text
//! NoIdentity -> Loading -> Found ----------------------> Ready
//!                       \-> Issuing (background task) -> Ready
//! ```
//!
//! - The device ID is generated once (UUID v4) and persisted immediately
//! - A credential persisted under the configured alias is always reused
//! - Otherwise one background task issues a certificate; callers arriving
//!   while it runs do not start another
//! - The identity stream only carries a value once a credential exists

pub mod authority;
pub mod keystore;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::IdentityConfig;
use crate::dispatch::{Dispatcher, Observable};
use crate::error::Result;
use authority::{CertificateAuthority, IssuedCertificate};
use keystore::{Credential, IdentityPersistence};

/// Stable device identity: ID plus client certificate and key.
#[derive(Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub device_id: String,
    /// PEM-encoded client certificate.
    pub certificate: Vec<u8>,
    /// PEM-encoded private key.
    pub private_key: Vec<u8>,
}

impl DeviceIdentity {
    fn from_credential(device_id: String, credential: &Credential) -> Self {
        Self {
            device_id,
            certificate: credential.certificate_pem.as_bytes().to_vec(),
            private_key: credential.private_key_pem.as_bytes().to_vec(),
        }
    }
}

impl std::fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("device_id", &self.device_id)
            .field("certificate", &format_args!("{} bytes", self.certificate.len()))
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// Where identity resolution currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityState {
    NoIdentity,
    Loading,
    Found,
    Issuing,
    Ready,
}

/// Result of a [`IdentityStore::resolve`] call.
#[derive(Debug)]
pub enum Resolution {
    /// A credential was available; the identity is ready.
    Ready(DeviceIdentity),
    /// This call started issuance; the handle completes when it finishes.
    Issuing(JoinHandle<()>),
    /// Another caller's issuance is still running.
    InProgress,
}

type IdGenerator = Box<dyn Fn() -> String + Send + Sync>;

/// Resolves and caches the device identity.
pub struct IdentityStore {
    alias: String,
    policy_name: String,
    persistence: Arc<dyn IdentityPersistence>,
    authority: Arc<dyn CertificateAuthority>,
    generate_id: IdGenerator,
    identity: Observable<DeviceIdentity>,
    state: Mutex<IdentityState>,
    device_id: Mutex<Option<String>>,
    resolving: AtomicBool,
}

impl std::fmt::Debug for IdentityStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityStore")
            .field("alias", &self.alias)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl IdentityStore {
    pub fn new(
        config: &IdentityConfig,
        persistence: Arc<dyn IdentityPersistence>,
        authority: Arc<dyn CertificateAuthority>,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            alias: config.certificate_alias.clone(),
            policy_name: config.policy_name.clone(),
            persistence,
            authority,
            generate_id: Box::new(|| Uuid::new_v4().to_string()),
            identity: Observable::new("identity", dispatcher),
            state: Mutex::new(IdentityState::NoIdentity),
            device_id: Mutex::new(None),
            resolving: AtomicBool::new(false),
        }
    }

    /// Replace the device-ID generator (used only when no ID is persisted).
    #[must_use]
    pub fn with_id_generator<F>(mut self, generate: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.generate_id = Box::new(generate);
        self
    }

    /// Stream carrying the identity once a credential exists.
    pub fn identity(&self) -> &Observable<DeviceIdentity> {
        &self.identity
    }

    pub fn state(&self) -> IdentityState {
        *lock(&self.state)
    }

    /// Resolve the identity; safe to call at every startup.
    ///
    /// Never issues a certificate when one is persisted under the alias,
    /// and never runs two issuances at once. A caller arriving while another
    /// resolution or issuance runs gets [`Resolution::InProgress`] and leaves
    /// the state untouched.
    ///
    /// # Errors
    ///
    /// Returns error if the device ID or keystore cannot be read or written.
    /// Issuance failures are not returned; they are logged by the background
    /// task and leave the identity unresolved.
    pub fn resolve(self: &Arc<Self>) -> Result<Resolution> {
        if let Some(identity) = self.identity.get() {
            return Ok(Resolution::Ready(identity));
        }

        // Held from here until the identity is ready or resolution fails
        if self
            .resolving
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(Resolution::InProgress);
        }

        self.set_state(IdentityState::Loading);
        let device_id = match self.load_device_id() {
            Ok(id) => id,
            Err(e) => {
                self.release(IdentityState::NoIdentity);
                return Err(e);
            }
        };

        match self.persistence.read_credential(&self.alias) {
            Ok(Some(credential)) => {
                self.set_state(IdentityState::Found);
                info!("Using certificate {} from keystore", self.alias);
                let identity = DeviceIdentity::from_credential(device_id, &credential);
                self.identity.set(identity.clone());
                self.release(IdentityState::Ready);
                return Ok(Resolution::Ready(identity));
            }
            Ok(None) => {
                info!("No certificate {} in keystore", self.alias);
            }
            Err(e) => {
                error!("Failed to read certificate {} from keystore: {}", self.alias, e);
                self.release(IdentityState::NoIdentity);
                return Err(e);
            }
        }

        info!("Issuing a new key pair and certificate");
        self.set_state(IdentityState::Issuing);
        let store = Arc::clone(self);
        let handle = tokio::spawn(async move {
            match store.issue(device_id).await {
                Ok(identity) => {
                    store.identity.set(identity);
                    store.release(IdentityState::Ready);
                }
                Err(e) => {
                    error!("Certificate issuance failed; identity stays unresolved: {}", e);
                    store.release(IdentityState::NoIdentity);
                }
            }
        });

        Ok(Resolution::Issuing(handle))
    }

    /// Device ID, once loaded by [`resolve`](Self::resolve).
    pub fn device_id(&self) -> Option<String> {
        lock(&self.device_id).clone()
    }

    fn load_device_id(&self) -> Result<String> {
        let mut cached = lock(&self.device_id);
        if let Some(id) = cached.as_ref() {
            return Ok(id.clone());
        }

        let id = match self.persistence.read_device_id()? {
            Some(id) => id,
            None => {
                let id = (self.generate_id)();
                self.persistence.write_device_id(&id)?;
                info!("Generated device ID {}", id);
                id
            }
        };

        *cached = Some(id.clone());
        Ok(id)
    }

    async fn issue(&self, device_id: String) -> Result<DeviceIdentity> {
        let issued: IssuedCertificate = self.authority.create_keys_and_certificate().await?;

        // Attach before persisting so a stored credential is always authorized
        self.authority
            .attach_policy(&self.policy_name, &issued.certificate_arn)
            .await?;

        let credential = Credential {
            certificate_pem: issued.certificate_pem,
            private_key_pem: issued.private_key_pem,
            certificate_arn: Some(issued.certificate_arn),
        };
        if let Err(e) = self.persistence.write_credential(&self.alias, &credential) {
            warn!(
                "Certificate {} issued but could not be stored: {}",
                issued.certificate_id, e
            );
            return Err(e);
        }

        Ok(DeviceIdentity::from_credential(device_id, &credential))
    }

    fn set_state(&self, next: IdentityState) {
        *lock(&self.state) = next;
    }

    /// Record the final state of this resolution and let the next one run.
    fn release(&self, last: IdentityState) {
        self.set_state(last);
        self.resolving.store(false, Ordering::Release);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::authority::{HttpCertificateAuthority, MockCertificateAuthority};
    use super::keystore::FileIdentityPersistence;
    use super::*;
    use crate::error::TelemetryError;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::Notify;

    fn config() -> IdentityConfig {
        IdentityConfig {
            storage_dir: "unused".into(),
            device_id_file: "device_id".to_string(),
            keystore_name: "iot_keystore".to_string(),
            certificate_alias: "default".to_string(),
            policy_name: "wearable-policy".to_string(),
            control_plane_url: "https://iot.example.com".to_string(),
            access_token_env: None,
            request_timeout_ms: 200,
        }
    }

    fn persistence(dir: &TempDir) -> Arc<FileIdentityPersistence> {
        Arc::new(FileIdentityPersistence::new(dir.path(), "device_id", "iot_keystore"))
    }

    fn issued() -> IssuedCertificate {
        IssuedCertificate {
            certificate_id: "cert-1".to_string(),
            certificate_arn: "arn:aws:iot:ca-central-1:123456789012:cert/cert-1".to_string(),
            certificate_pem: "CERT PEM".to_string(),
            private_key_pem: "KEY PEM".to_string(),
        }
    }

    fn issuing_authority() -> MockCertificateAuthority {
        let mut authority = MockCertificateAuthority::new();
        authority
            .expect_create_keys_and_certificate()
            .times(1)
            .returning(|| Ok(issued()));
        authority
            .expect_attach_policy()
            .withf(|policy, arn| policy.to_string() == "wearable-policy" && arn.ends_with("cert/cert-1"))
            .times(1)
            .returning(|_, _| Ok(()));
        authority
    }

    fn store(
        persistence: Arc<dyn IdentityPersistence>,
        authority: impl CertificateAuthority + 'static,
    ) -> Arc<IdentityStore> {
        Arc::new(IdentityStore::new(
            &config(),
            persistence,
            Arc::new(authority),
            Dispatcher::spawn(),
        ))
    }

    async fn finish(resolution: Resolution) {
        match resolution {
            Resolution::Issuing(handle) => handle.await.unwrap(),
            other => panic!("Expected Issuing, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_issues_once_then_reuses_persisted_credential() {
        let dir = TempDir::new().unwrap();

        let first = store(persistence(&dir), issuing_authority());
        finish(first.resolve().unwrap()).await;
        assert_eq!(first.state(), IdentityState::Ready);
        let issued_identity = first.identity().get().unwrap();
        assert_eq!(issued_identity.certificate, b"CERT PEM");

        // A fresh process with an authority that must never be called
        let mut untouched = MockCertificateAuthority::new();
        untouched.expect_create_keys_and_certificate().never();
        untouched.expect_attach_policy().never();

        let second = store(persistence(&dir), untouched);
        match second.resolve().unwrap() {
            Resolution::Ready(identity) => assert_eq!(identity, issued_identity),
            other => panic!("Expected Ready, got: {:?}", other),
        }
        match second.resolve().unwrap() {
            Resolution::Ready(identity) => assert_eq!(identity, issued_identity),
            other => panic!("Expected Ready, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_device_id_is_stable_across_restarts() {
        let dir = TempDir::new().unwrap();

        let first = Arc::new(
            IdentityStore::new(&config(), persistence(&dir), Arc::new(issuing_authority()), Dispatcher::spawn())
                .with_id_generator(|| "first-seed".to_string()),
        );
        finish(first.resolve().unwrap()).await;
        assert_eq!(first.device_id().as_deref(), Some("first-seed"));

        let second = Arc::new(
            IdentityStore::new(&config(), persistence(&dir), Arc::new(MockCertificateAuthority::new()), Dispatcher::spawn())
                .with_id_generator(|| "second-seed".to_string()),
        );
        match second.resolve().unwrap() {
            Resolution::Ready(identity) => assert_eq!(identity.device_id, "first-seed"),
            other => panic!("Expected Ready, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_device_id_persisted_before_issuance_completes() {
        let dir = TempDir::new().unwrap();
        let persistence = persistence(&dir);

        let mut failing = MockCertificateAuthority::new();
        failing
            .expect_create_keys_and_certificate()
            .times(1)
            .returning(|| Err(TelemetryError::Issuance("network unreachable".to_string())));

        let store = store(persistence.clone(), failing);
        finish(store.resolve().unwrap()).await;

        let generated = store.device_id().unwrap();
        assert!(Uuid::parse_str(&generated).is_ok());
        assert_eq!(persistence.read_device_id().unwrap(), Some(generated));
    }

    #[tokio::test]
    async fn test_issuance_failure_leaves_identity_unresolved() {
        let dir = TempDir::new().unwrap();
        let persistence = persistence(&dir);

        let mut failing = MockCertificateAuthority::new();
        failing
            .expect_create_keys_and_certificate()
            .times(1)
            .returning(|| Err(TelemetryError::Issuance("network unreachable".to_string())));
        failing.expect_attach_policy().never();

        let store = store(persistence.clone(), failing);
        finish(store.resolve().unwrap()).await;

        assert_eq!(store.state(), IdentityState::NoIdentity);
        assert!(store.identity().get().is_none());
        assert!(!persistence.keystore_path().exists());
        assert_eq!(persistence.read_credential("default").unwrap(), None);
    }

    #[tokio::test]
    async fn test_policy_failure_persists_nothing() {
        let dir = TempDir::new().unwrap();
        let persistence = persistence(&dir);

        let mut authority = MockCertificateAuthority::new();
        authority
            .expect_create_keys_and_certificate()
            .times(1)
            .returning(|| Ok(issued()));
        authority
            .expect_attach_policy()
            .times(1)
            .returning(|_, _| Err(TelemetryError::Issuance("policy not found".to_string())));

        let store = store(persistence.clone(), authority);
        finish(store.resolve().unwrap()).await;

        assert!(store.identity().get().is_none());
        assert_eq!(persistence.read_credential("default").unwrap(), None);
    }

    #[tokio::test]
    async fn test_retry_after_failure_issues_again() {
        let dir = TempDir::new().unwrap();

        let mut authority = MockCertificateAuthority::new();
        let mut seq = mockall::Sequence::new();
        authority
            .expect_create_keys_and_certificate()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Err(TelemetryError::Issuance("timeout".to_string())));
        authority
            .expect_create_keys_and_certificate()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(issued()));
        authority.expect_attach_policy().times(1).returning(|_, _| Ok(()));

        let store = store(persistence(&dir), authority);
        finish(store.resolve().unwrap()).await;
        assert!(store.identity().get().is_none());

        finish(store.resolve().unwrap()).await;
        assert_eq!(store.state(), IdentityState::Ready);
        assert!(store.identity().get().is_some());
    }

    #[tokio::test]
    async fn test_silent_control_plane_releases_issuance() {
        let dir = TempDir::new().unwrap();
        let mut config = config();
        config.control_plane_url = super::authority::mocks::silent_control_plane().await;
        let authority = HttpCertificateAuthority::from_config(&config).unwrap();

        let store = store(persistence(&dir), authority);
        let issuance = store.resolve().unwrap();
        tokio::time::timeout(Duration::from_secs(5), finish(issuance))
            .await
            .expect("issuance never gave up");

        assert_eq!(store.state(), IdentityState::NoIdentity);
        assert!(store.identity().get().is_none());
        // The next attempt starts a new issuance instead of waiting on the stuck one
        assert!(matches!(store.resolve().unwrap(), Resolution::Issuing(_)));
    }

    /// Authority that blocks issuance until released
    struct GatedAuthority {
        gate: Arc<Notify>,
        created: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl CertificateAuthority for GatedAuthority {
        async fn create_keys_and_certificate(&self) -> Result<IssuedCertificate> {
            self.created.fetch_add(1, Ordering::SeqCst);
            self.gate.notified().await;
            Ok(issued())
        }

        async fn attach_policy(&self, _policy_name: &str, _certificate_arn: &str) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_concurrent_resolve_issues_at_most_once() {
        let dir = TempDir::new().unwrap();
        let gate = Arc::new(Notify::new());
        let created = Arc::new(AtomicUsize::new(0));

        let store = store(
            persistence(&dir),
            GatedAuthority {
                gate: Arc::clone(&gate),
                created: Arc::clone(&created),
            },
        );

        let first = store.resolve().unwrap();
        assert_eq!(store.state(), IdentityState::Issuing);
        for _ in 0..5 {
            assert!(matches!(store.resolve().unwrap(), Resolution::InProgress));
            assert_eq!(store.state(), IdentityState::Issuing);
        }

        gate.notify_one();
        finish(first).await;

        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert!(matches!(store.resolve().unwrap(), Resolution::Ready(_)));
    }

    #[tokio::test]
    async fn test_listeners_see_identity_only_after_issuance() {
        let dir = TempDir::new().unwrap();
        let dispatcher = Dispatcher::spawn();
        let gate = Arc::new(Notify::new());
        let store = Arc::new(IdentityStore::new(
            &config(),
            persistence(&dir),
            Arc::new(GatedAuthority {
                gate: Arc::clone(&gate),
                created: Arc::new(AtomicUsize::new(0)),
            }),
            dispatcher.clone(),
        ));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = store
            .identity()
            .subscribe(move |identity: &DeviceIdentity| sink.lock().unwrap().push(identity.clone()));

        let resolution = store.resolve().unwrap();
        dispatcher.flush().await;
        assert!(seen.lock().unwrap().is_empty());

        gate.notify_one();
        finish(resolution).await;
        dispatcher.flush().await;
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].private_key, b"KEY PEM");
    }

    #[tokio::test]
    async fn test_unreadable_keystore_is_reported() {
        let dir = TempDir::new().unwrap();
        let persistence = persistence(&dir);
        std::fs::write(persistence.keystore_path(), b"garbage").unwrap();

        let mut authority = MockCertificateAuthority::new();
        authority.expect_create_keys_and_certificate().never();

        let store = store(persistence, authority);
        assert!(matches!(store.resolve(), Err(TelemetryError::Keystore(_))));
        assert_eq!(store.state(), IdentityState::NoIdentity);
    }

    #[test]
    fn test_debug_redacts_private_key() {
        let identity = DeviceIdentity {
            device_id: "abc".to_string(),
            certificate: b"CERT".to_vec(),
            private_key: b"SECRET".to_vec(),
        };
        let text = format!("{:?}", identity);
        assert!(text.contains("abc"));
        assert!(!text.contains("SECRET"));
    }
}
