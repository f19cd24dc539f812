//! Session Validator.
//!
//! Verifies access credentials against live identity state. The identity
//! lookup is read-through cached; the cache entry for a user is dropped
//! whenever their session version is bumped in this process, so a forced
//! logout takes effect on the very next validation.

use crate::auth::crypto::{self, SigningKeys};
use crate::errors::{AuthError, GatewayError};
use crate::repository::{Repository, RepositoryError, User};
use common::types::UserId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::instrument;

/// Live identity of a user, as far as credential checks are concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub username: String,
    pub session_version: u64,
    pub active: bool,
}

impl From<User> for Identity {
    fn from(user: User) -> Self {
        Self {
            user_id: user.id,
            username: user.username,
            session_version: user.session_version,
            active: user.active,
        }
    }
}

/// A credential that passed every check.
#[derive(Debug, Clone)]
pub struct ValidatedCredential {
    pub identity: Identity,
    /// Credential expiry (Unix seconds).
    pub expires_at: i64,
}

#[derive(Debug, Clone)]
struct CachedIdentity {
    identity: Identity,
    fetched_at: Instant,
}

/// Cached identities plus a per-user invalidation generation.
///
/// A lookup only populates the cache if no `invalidate` ran for that user
/// between its repository read and its insert.
#[derive(Debug, Default)]
struct IdentityCache {
    entries: HashMap<UserId, CachedIdentity>,
    generations: HashMap<UserId, u64>,
}

/// Validates access credentials. Safe to share across connections.
pub struct SessionValidator {
    keys: SigningKeys,
    repository: Arc<dyn Repository>,
    cache: RwLock<IdentityCache>,
    cache_ttl: Duration,
}

impl SessionValidator {
    pub fn new(keys: SigningKeys, repository: Arc<dyn Repository>, cache_ttl: Duration) -> Self {
        Self {
            keys,
            repository,
            cache: RwLock::new(IdentityCache::default()),
            cache_ttl,
        }
    }

    /// Validate an access credential.
    ///
    /// Checks signature and expiry, then compares the embedded session
    /// version against the live one.
    ///
    /// # Errors
    ///
    /// - `Auth(Expired)` - credential past its `exp`
    /// - `Auth(Failed)` - bad signature, unknown or inactive user, stale version
    /// - `Storage` - identity lookup failed for backend reasons
    #[instrument(skip_all, name = "gw.auth.validate")]
    pub async fn validate(&self, token: &str) -> Result<ValidatedCredential, GatewayError> {
        let claims = crypto::verify_access_token(token, &self.keys)?;

        let user_id: UserId = claims.sub.parse().map_err(|_| {
            tracing::debug!(target: "gw.auth", "Token rejected: subject is not a user id");
            AuthError::Failed
        })?;

        let (mut identity, from_cache) = self.load_identity(user_id).await?;

        // A cached version older than the token's may just be stale
        if from_cache && identity.session_version != claims.ver {
            identity = self.refresh_identity(user_id).await?;
        }

        if !identity.active {
            tracing::debug!(target: "gw.auth", user_id = %user_id, "Token rejected: user inactive");
            return Err(AuthError::Failed.into());
        }

        if identity.session_version != claims.ver {
            tracing::debug!(
                target: "gw.auth",
                user_id = %user_id,
                token_version = claims.ver,
                live_version = identity.session_version,
                "Token rejected: session version mismatch"
            );
            return Err(AuthError::Failed.into());
        }

        Ok(ValidatedCredential {
            identity,
            expires_at: claims.exp,
        })
    }

    /// Drop the cached identity for a user.
    ///
    /// Lookups already in flight for the user will not repopulate the cache.
    pub async fn invalidate(&self, user_id: UserId) {
        let mut cache = self.cache.write().await;
        cache.entries.remove(&user_id);
        *cache.generations.entry(user_id).or_default() += 1;
    }

    async fn load_identity(&self, user_id: UserId) -> Result<(Identity, bool), GatewayError> {
        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.entries.get(&user_id) {
                if entry.fetched_at.elapsed() < self.cache_ttl {
                    return Ok((entry.identity.clone(), true));
                }
            }
        }
        Ok((self.refresh_identity(user_id).await?, false))
    }

    async fn refresh_identity(&self, user_id: UserId) -> Result<Identity, GatewayError> {
        let generation = self.generation(user_id).await;
        let identity: Identity = match self.repository.get_user(user_id).await {
            Ok(user) => user.into(),
            Err(RepositoryError::NotFound(_)) => {
                self.invalidate(user_id).await;
                return Err(AuthError::Failed.into());
            }
            Err(e) => return Err(e.into()),
        };

        self.store(user_id, generation, identity.clone()).await;
        Ok(identity)
    }

    async fn generation(&self, user_id: UserId) -> u64 {
        self.cache
            .read()
            .await
            .generations
            .get(&user_id)
            .copied()
            .unwrap_or(0)
    }

    /// Cache `identity` unless the user was invalidated after `generation`
    /// was read. Returns whether the entry was stored.
    async fn store(&self, user_id: UserId, generation: u64, identity: Identity) -> bool {
        let mut cache = self.cache.write().await;
        let current = cache.generations.get(&user_id).copied().unwrap_or(0);
        if current != generation {
            tracing::debug!(
                target: "gw.auth",
                user_id = %user_id,
                "Skipping identity cache fill: invalidated during lookup"
            );
            return false;
        }
        cache.entries.insert(
            user_id,
            CachedIdentity {
                identity,
                fetched_at: Instant::now(),
            },
        );
        true
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::auth::crypto::{generate_signing_key, sign_access_token};
    use crate::repository::{InMemoryRepository, NewUser};
    use common::jwt::AccessClaims;

    struct Fixture {
        repo: Arc<InMemoryRepository>,
        keys: SigningKeys,
        validator: SessionValidator,
    }

    fn fixture() -> Fixture {
        let repo = Arc::new(InMemoryRepository::new());
        let keys = SigningKeys::from_pkcs8_base64(&generate_signing_key().unwrap(), "k").unwrap();
        let validator =
            SessionValidator::new(keys.clone(), repo.clone(), Duration::from_secs(60));
        Fixture {
            repo,
            keys,
            validator,
        }
    }

    fn token_for(keys: &SigningKeys, user: &User, ver: u64) -> String {
        let now = chrono::Utc::now().timestamp();
        sign_access_token(
            &AccessClaims {
                sub: user.id.to_string(),
                ver,
                iat: now,
                exp: now + 300,
                jti: uuid::Uuid::new_v4().to_string(),
            },
            keys,
        )
        .unwrap()
    }

    async fn alice(repo: &InMemoryRepository) -> User {
        repo.create_user(NewUser {
            username: "alice".to_string(),
            email: "alice@example.com".to_string(),
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_valid_token_returns_identity() {
        let f = fixture();
        let user = alice(&f.repo).await;
        let token = token_for(&f.keys, &user, user.session_version);

        let validated = f.validator.validate(&token).await.unwrap();
        assert_eq!(validated.identity.user_id, user.id);
        assert_eq!(validated.identity.username, "alice");
    }

    #[tokio::test]
    async fn test_version_bump_invalidates_cached_identity_after_invalidate() {
        let f = fixture();
        let user = alice(&f.repo).await;
        let old = token_for(&f.keys, &user, user.session_version);
        f.validator.validate(&old).await.unwrap();

        let new_version = f.repo.increment_session_version(user.id).await.unwrap();
        f.validator.invalidate(user.id).await;

        assert!(matches!(
            f.validator.validate(&old).await,
            Err(GatewayError::Auth(AuthError::Failed))
        ));
        let fresh = token_for(&f.keys, &user, new_version);
        assert!(f.validator.validate(&fresh).await.is_ok());
    }

    #[tokio::test]
    async fn test_lookup_racing_invalidate_does_not_recache_old_version() {
        let f = fixture();
        let user = alice(&f.repo).await;
        let old = token_for(&f.keys, &user, user.session_version);

        // A lookup reads the user, then the version is bumped and the cache
        // invalidated before that lookup stores its result.
        let generation = f.validator.generation(user.id).await;
        let stale: Identity = f.repo.get_user(user.id).await.unwrap().into();
        f.repo.increment_session_version(user.id).await.unwrap();
        f.validator.invalidate(user.id).await;

        assert!(!f.validator.store(user.id, generation, stale).await);
        assert!(matches!(
            f.validator.validate(&old).await,
            Err(GatewayError::Auth(AuthError::Failed))
        ));
    }

    #[tokio::test]
    async fn test_lookup_without_invalidate_is_cached() {
        let f = fixture();
        let user = alice(&f.repo).await;
        let generation = f.validator.generation(user.id).await;
        let identity: Identity = f.repo.get_user(user.id).await.unwrap().into();

        assert!(f.validator.store(user.id, generation, identity).await);
        assert!(f.validator.cache.read().await.entries.contains_key(&user.id));
    }

    #[tokio::test]
    async fn test_stale_cache_is_refreshed_for_newer_token() {
        let f = fixture();
        let user = alice(&f.repo).await;
        f.validator
            .validate(&token_for(&f.keys, &user, 1))
            .await
            .unwrap();

        // Bumped elsewhere without invalidating this cache
        let v2 = f.repo.increment_session_version(user.id).await.unwrap();
        assert!(f
            .validator
            .validate(&token_for(&f.keys, &user, v2))
            .await
            .is_ok());
        // And the refresh means the old version is now rejected
        assert!(f
            .validator
            .validate(&token_for(&f.keys, &user, 1))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_inactive_and_unknown_users_fail() {
        let f = fixture();
        let user = alice(&f.repo).await;
        f.repo.set_user_active(user.id, false).await.unwrap();
        assert!(matches!(
            f.validator.validate(&token_for(&f.keys, &user, 1)).await,
            Err(GatewayError::Auth(AuthError::Failed))
        ));

        let ghost = User {
            id: UserId::new(),
            ..user
        };
        assert!(matches!(
            f.validator.validate(&token_for(&f.keys, &ghost, 1)).await,
            Err(GatewayError::Auth(AuthError::Failed))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_validation() {
        let f = fixture();
        let user = alice(&f.repo).await;
        let token = token_for(&f.keys, &user, 1);
        let validator = Arc::new(f.validator);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let v = Arc::clone(&validator);
            let t = token.clone();
            handles.push(tokio::spawn(async move { v.validate(&t).await.is_ok() }));
        }
        for h in handles {
            assert!(h.await.unwrap());
        }
    }
}
