use std::sync::Arc;
#[cfg(test)]
use std::sync::atomic::{AtomicUsize, Ordering};

use argon2::{
    password_hash::{PasswordHash, PasswordHasher as _, PasswordVerifier as _, SaltString},
    Algorithm, Argon2, Params, Version,
};
use rand::rngs::OsRng;
use tracing::{error, warn};

use crate::config::HasherConfig;

/// Argon2id hasher with a configurable work factor.
///
/// Hashes are PHC strings with an embedded random salt, so hashing the same
/// password twice never yields the same output. Verification reads the cost
/// parameters back out of the stored hash, so raising the work factor only
/// affects newly written hashes.
#[derive(Clone)]
pub struct PasswordHasher {
    params: Params,
    // Verified against when the username is unknown, so that path costs the
    // same as a real password check.
    dummy_hash: Arc<str>,
    #[cfg(test)]
    verifications: Arc<AtomicUsize>,
}

impl PasswordHasher {
    pub fn new(config: &HasherConfig) -> anyhow::Result<Self> {
        let params = Params::new(
            config.memory_kib,
            config.iterations,
            config.parallelism,
            None,
        )
        .map_err(|e| anyhow::anyhow!("invalid argon2 parameters: {e}"))?;

        let mut hasher = Self {
            params,
            dummy_hash: Arc::from(""),
            #[cfg(test)]
            verifications: Arc::default(),
        };
        hasher.dummy_hash = Arc::from(hasher.hash("not-a-real-password")?);
        Ok(hasher)
    }

    fn argon2(&self) -> Argon2<'static> {
        Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone())
    }

    pub fn hash(&self, plain: &str) -> anyhow::Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .argon2()
            .hash_password(plain.as_bytes(), &salt)
            .map_err(|e| {
                error!(error = %e, "argon2 hash_password error");
                anyhow::anyhow!(e.to_string())
            })?
            .to_string();
        Ok(hash)
    }

    /// A stored hash that fails to parse never matches.
    pub fn verify(&self, plain: &str, hash: &str) -> bool {
        #[cfg(test)]
        self.verifications.fetch_add(1, Ordering::Relaxed);
        let parsed = match PasswordHash::new(hash) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "stored password hash is malformed");
                return false;
            }
        };
        self.argon2()
            .verify_password(plain.as_bytes(), &parsed)
            .is_ok()
    }

    /// Burn one verification's worth of work. Always `false`.
    pub fn verify_dummy(&self, plain: &str) -> bool {
        let _ = self.verify(plain, &self.dummy_hash);
        false
    }

    /// Verifications run so far, across clones.
    #[cfg(test)]
    pub fn verifications(&self) -> usize {
        self.verifications.load(Ordering::Relaxed)
    }

    pub async fn hash_blocking(&self, plain: String) -> anyhow::Result<String> {
        let hasher = self.clone();
        tokio::task::spawn_blocking(move || hasher.hash(&plain)).await?
    }

    pub async fn verify_blocking(&self, plain: String, hash: String) -> anyhow::Result<bool> {
        let hasher = self.clone();
        Ok(tokio::task::spawn_blocking(move || hasher.verify(&plain, &hash)).await?)
    }

    pub async fn verify_dummy_blocking(&self, plain: String) -> anyhow::Result<bool> {
        let hasher = self.clone();
        Ok(tokio::task::spawn_blocking(move || hasher.verify_dummy(&plain)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hasher() -> PasswordHasher {
        PasswordHasher::new(&HasherConfig {
            memory_kib: 1024,
            iterations: 1,
            parallelism: 1,
        })
        .expect("valid params")
    }

    #[test]
    fn hash_and_verify_roundtrip() {
        let hasher = hasher();
        let password = "Secur3P@ssw0rd!";
        let hash = hasher.hash(password).expect("hashing should succeed");
        assert!(hasher.verify(password, &hash));
    }

    #[test]
    fn verify_rejects_wrong_password() {
        let hasher = hasher();
        let hash = hasher.hash("correct-horse-battery-staple").expect("hash");
        assert!(!hasher.verify("wrong-password", &hash));
    }

    #[test]
    fn same_password_hashes_differently() {
        let hasher = hasher();
        let a = hasher.hash("password123").unwrap();
        let b = hasher.hash("password123").unwrap();
        assert_ne!(a, b);
        assert!(a.starts_with("$argon2id$"));
    }

    #[test]
    fn verify_fails_closed_on_malformed_hash() {
        let hasher = hasher();
        assert!(!hasher.verify("anything", "not-a-valid-hash"));
        assert!(!hasher.verify("anything", ""));
    }

    #[test]
    fn rejects_invalid_work_factor() {
        let result = PasswordHasher::new(&HasherConfig {
            memory_kib: 1,
            iterations: 0,
            parallelism: 1,
        });
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn blocking_wrappers_agree_with_sync_calls() {
        let hasher = hasher();
        let hash = hasher.hash_blocking("password123".into()).await.unwrap();
        assert!(hasher
            .verify_blocking("password123".into(), hash.clone())
            .await
            .unwrap());
        assert!(!hasher.verify_blocking("password124".into(), hash).await.unwrap());
        assert!(!hasher.verify_dummy_blocking("whatever".into()).await.unwrap());
    }
}
