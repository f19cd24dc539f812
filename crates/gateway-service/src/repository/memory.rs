//! In-process [`Repository`] implementation.
//!
//! Holds everything behind one mutex so each trait method is trivially
//! atomic. Used by the standalone binary and by every test suite.

use super::{
    Message, NewMessage, NewRefreshToken, NewUser, RefreshToken, Repository, RepositoryError, User,
};
use chrono::{DateTime, Utc};
use common::types::{AttachmentId, MessageId, RefreshTokenId, UserId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone)]
struct PendingAttachment {
    uploader: UserId,
    claimed_by: Option<MessageId>,
}

#[derive(Debug, Clone)]
struct StoredCode {
    code_hash: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct StoredRegistration {
    expires_at: DateTime<Utc>,
    consumed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Inner {
    users: HashMap<UserId, User>,
    refresh_tokens: HashMap<String, RefreshToken>,
    messages: Vec<Message>,
    attachments: HashMap<AttachmentId, PendingAttachment>,
    magic_codes: HashMap<String, StoredCode>,
    registration_tokens: HashMap<String, StoredRegistration>,
}

/// In-memory repository.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRepository {
    inner: Arc<Mutex<Inner>>,
    fail_writes: Arc<AtomicBool>,
}

impl InMemoryRepository {
    /// Create an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write fail with `Backend` until cleared (fault injection).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of stored messages.
    pub fn message_count(&self) -> usize {
        self.lock().map(|inner| inner.messages.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, RepositoryError> {
        self.inner
            .lock()
            .map_err(|_| RepositoryError::Backend("repository lock poisoned".to_string()))
    }

    fn lock_for_write(&self) -> Result<MutexGuard<'_, Inner>, RepositoryError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(RepositoryError::Backend("injected write failure".to_string()));
        }
        self.lock()
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

#[async_trait::async_trait]
impl Repository for InMemoryRepository {
    async fn get_user(&self, id: UserId) -> Result<User, RepositoryError> {
        self.lock()?
            .users
            .get(&id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(format!("user {id}")))
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, RepositoryError> {
        let email = normalize_email(email);
        Ok(self
            .lock()?
            .users
            .values()
            .find(|u| u.email == email)
            .cloned())
    }

    async fn create_user(&self, new_user: NewUser) -> Result<User, RepositoryError> {
        let mut inner = self.lock_for_write()?;
        let email = normalize_email(&new_user.email);

        if inner
            .users
            .values()
            .any(|u| u.email == email || u.username.eq_ignore_ascii_case(&new_user.username))
        {
            return Err(RepositoryError::Conflict(
                "email or username already registered".to_string(),
            ));
        }

        let user = User {
            id: UserId::new(),
            username: new_user.username,
            email,
            session_version: 1,
            active: true,
            created_at: Utc::now(),
        };
        inner.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn list_users(&self) -> Result<Vec<User>, RepositoryError> {
        let mut users: Vec<User> = self.lock()?.users.values().cloned().collect();
        users.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(users)
    }

    async fn set_user_active(&self, id: UserId, active: bool) -> Result<User, RepositoryError> {
        let mut inner = self.lock_for_write()?;
        let user = inner
            .users
            .get_mut(&id)
            .ok_or_else(|| RepositoryError::NotFound(format!("user {id}")))?;
        user.active = active;
        Ok(user.clone())
    }

    async fn increment_session_version(&self, id: UserId) -> Result<u64, RepositoryError> {
        let mut inner = self.lock_for_write()?;
        let user = inner
            .users
            .get_mut(&id)
            .ok_or_else(|| RepositoryError::NotFound(format!("user {id}")))?;
        user.session_version += 1;
        Ok(user.session_version)
    }

    async fn create_refresh_token(
        &self,
        token: NewRefreshToken,
    ) -> Result<RefreshToken, RepositoryError> {
        let mut inner = self.lock_for_write()?;
        if inner.refresh_tokens.contains_key(&token.token_hash) {
            return Err(RepositoryError::Conflict("duplicate token hash".to_string()));
        }
        let row = RefreshToken {
            id: RefreshTokenId::new(),
            user_id: token.user_id,
            token_hash: token.token_hash,
            expires_at: token.expires_at,
            revoked_at: None,
            created_at: Utc::now(),
        };
        inner.refresh_tokens.insert(row.token_hash.clone(), row.clone());
        Ok(row)
    }

    async fn get_refresh_token_by_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<RefreshToken>, RepositoryError> {
        Ok(self.lock()?.refresh_tokens.get(token_hash).cloned())
    }

    async fn rotate_refresh_token(
        &self,
        old_hash: &str,
        replacement: NewRefreshToken,
        now: DateTime<Utc>,
    ) -> Result<RefreshToken, RepositoryError> {
        let mut inner = self.lock_for_write()?;

        let consumed = {
            let old = inner
                .refresh_tokens
                .get_mut(old_hash)
                .ok_or_else(|| RepositoryError::NotFound("rotation credential".to_string()))?;
            if old.revoked_at.is_some() {
                return Err(RepositoryError::Revoked);
            }
            if old.expires_at <= now {
                return Err(RepositoryError::Expired);
            }
            old.revoked_at = Some(now);
            old.clone()
        };

        let row = RefreshToken {
            id: RefreshTokenId::new(),
            user_id: replacement.user_id,
            token_hash: replacement.token_hash,
            expires_at: replacement.expires_at,
            revoked_at: None,
            created_at: now,
        };
        inner.refresh_tokens.insert(row.token_hash.clone(), row);
        Ok(consumed)
    }

    async fn revoke_refresh_token(
        &self,
        id: RefreshTokenId,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let mut inner = self.lock_for_write()?;
        let row = inner
            .refresh_tokens
            .values_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| RepositoryError::NotFound(format!("rotation credential {id}")))?;
        if row.revoked_at.is_none() {
            row.revoked_at = Some(now);
        }
        Ok(())
    }

    async fn revoke_all_refresh_tokens(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<usize, RepositoryError> {
        let mut inner = self.lock_for_write()?;
        let mut revoked = 0;
        for row in inner
            .refresh_tokens
            .values_mut()
            .filter(|t| t.user_id == user_id && t.revoked_at.is_none())
        {
            row.revoked_at = Some(now);
            revoked += 1;
        }
        Ok(revoked)
    }

    async fn create_message(&self, message: NewMessage) -> Result<Message, RepositoryError> {
        let mut inner = self.lock_for_write()?;

        for id in &message.attachment_ids {
            match inner.attachments.get(id) {
                Some(a) if a.claimed_by.is_none() && a.uploader == message.author_id => {}
                _ => return Err(RepositoryError::AttachmentUnavailable(*id)),
            }
        }

        let stored = Message {
            id: MessageId::new(),
            author_id: message.author_id,
            content: message.content,
            attachment_ids: message.attachment_ids,
            created_at: Utc::now(),
        };
        for id in &stored.attachment_ids {
            if let Some(a) = inner.attachments.get_mut(id) {
                a.claimed_by = Some(stored.id);
            }
        }
        inner.messages.push(stored.clone());
        Ok(stored)
    }

    async fn list_message_history(
        &self,
        before: Option<MessageId>,
        limit: usize,
    ) -> Result<Vec<Message>, RepositoryError> {
        let inner = self.lock()?;
        let end = match before {
            Some(id) => inner
                .messages
                .iter()
                .position(|m| m.id == id)
                .ok_or_else(|| RepositoryError::NotFound(format!("message {id}")))?,
            None => inner.messages.len(),
        };
        Ok(inner
            .messages
            .iter()
            .take(end)
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn create_pending_attachment(
        &self,
        uploader: UserId,
        filename: &str,
    ) -> Result<AttachmentId, RepositoryError> {
        if filename.trim().is_empty() {
            return Err(RepositoryError::Conflict("empty filename".to_string()));
        }
        let mut inner = self.lock_for_write()?;
        let id = AttachmentId::new();
        inner.attachments.insert(
            id,
            PendingAttachment {
                uploader,
                claimed_by: None,
            },
        );
        Ok(id)
    }

    async fn create_magic_code(
        &self,
        email: &str,
        code_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let mut inner = self.lock_for_write()?;
        inner.magic_codes.insert(
            normalize_email(email),
            StoredCode {
                code_hash: code_hash.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn consume_magic_code(
        &self,
        email: &str,
        code_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let mut inner = self.lock_for_write()?;
        let email = normalize_email(email);
        let stored = inner
            .magic_codes
            .get(&email)
            .ok_or_else(|| RepositoryError::NotFound("login code".to_string()))?;
        if stored.code_hash != code_hash {
            return Err(RepositoryError::NotFound("login code".to_string()));
        }
        let expired = stored.expires_at <= now;
        inner.magic_codes.remove(&email);
        if expired {
            return Err(RepositoryError::Expired);
        }
        Ok(())
    }

    async fn create_registration_token(
        &self,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let mut inner = self.lock_for_write()?;
        inner.registration_tokens.insert(
            token_hash.to_string(),
            StoredRegistration {
                expires_at,
                consumed_at: None,
            },
        );
        Ok(())
    }

    async fn consume_registration_token(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let mut inner = self.lock_for_write()?;
        let stored = inner
            .registration_tokens
            .get_mut(token_hash)
            .ok_or_else(|| RepositoryError::NotFound("registration token".to_string()))?;
        if stored.consumed_at.is_some() {
            return Err(RepositoryError::Revoked);
        }
        if stored.expires_at <= now {
            return Err(RepositoryError::Expired);
        }
        stored.consumed_at = Some(now);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn user(repo: &InMemoryRepository, name: &str) -> User {
        repo.create_user(NewUser {
            username: name.to_string(),
            email: format!("{name}@example.com"),
        })
        .await
        .unwrap()
    }

    fn new_token(user_id: UserId, hash: &str) -> NewRefreshToken {
        NewRefreshToken {
            user_id,
            token_hash: hash.to_string(),
            expires_at: Utc::now() + Duration::days(1),
        }
    }

    #[tokio::test]
    async fn test_create_user_rejects_duplicate_email() {
        let repo = InMemoryRepository::new();
        user(&repo, "alice").await;

        let dup = repo
            .create_user(NewUser {
                username: "alice2".to_string(),
                email: "ALICE@example.com".to_string(),
            })
            .await;
        assert!(matches!(dup, Err(RepositoryError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_rotate_is_single_use() {
        let repo = InMemoryRepository::new();
        let alice = user(&repo, "alice").await;
        repo.create_refresh_token(new_token(alice.id, "h1"))
            .await
            .unwrap();

        let now = Utc::now();
        let consumed = repo
            .rotate_refresh_token("h1", new_token(alice.id, "h2"), now)
            .await
            .unwrap();
        assert_eq!(consumed.token_hash, "h1");

        let replay = repo
            .rotate_refresh_token("h1", new_token(alice.id, "h3"), now)
            .await;
        assert_eq!(replay, Err(RepositoryError::Revoked));
        // A failed rotation inserts nothing
        assert!(repo.get_refresh_token_by_hash("h3").await.unwrap().is_none());
        assert!(repo.get_refresh_token_by_hash("h2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_rotate_expired_fails() {
        let repo = InMemoryRepository::new();
        let alice = user(&repo, "alice").await;
        let mut token = new_token(alice.id, "old");
        token.expires_at = Utc::now() - Duration::seconds(1);
        repo.create_refresh_token(token).await.unwrap();

        let result = repo
            .rotate_refresh_token("old", new_token(alice.id, "new"), Utc::now())
            .await;
        assert_eq!(result, Err(RepositoryError::Expired));
    }

    #[tokio::test]
    async fn test_create_message_claims_attachments_once() {
        let repo = InMemoryRepository::new();
        let alice = user(&repo, "alice").await;
        let bob = user(&repo, "bob").await;
        let attachment = repo
            .create_pending_attachment(alice.id, "cat.png")
            .await
            .unwrap();

        // Someone else cannot claim alice's upload
        let stolen = repo
            .create_message(NewMessage {
                author_id: bob.id,
                content: "mine".to_string(),
                attachment_ids: vec![attachment],
            })
            .await;
        assert_eq!(stolen, Err(RepositoryError::AttachmentUnavailable(attachment)));
        assert_eq!(repo.message_count(), 0);

        repo.create_message(NewMessage {
            author_id: alice.id,
            content: "look".to_string(),
            attachment_ids: vec![attachment],
        })
        .await
        .unwrap();

        let again = repo
            .create_message(NewMessage {
                author_id: alice.id,
                content: "again".to_string(),
                attachment_ids: vec![attachment],
            })
            .await;
        assert_eq!(again, Err(RepositoryError::AttachmentUnavailable(attachment)));
    }

    #[tokio::test]
    async fn test_history_newest_first_with_cursor() {
        let repo = InMemoryRepository::new();
        let alice = user(&repo, "alice").await;
        let mut ids = Vec::new();
        for i in 0..5 {
            let m = repo
                .create_message(NewMessage {
                    author_id: alice.id,
                    content: format!("m{i}"),
                    attachment_ids: vec![],
                })
                .await
                .unwrap();
            ids.push(m.id);
        }

        let page = repo.list_message_history(None, 2).await.unwrap();
        assert_eq!(page.iter().map(|m| m.content.as_str()).collect::<Vec<_>>(), ["m4", "m3"]);

        let older = repo.list_message_history(Some(ids[3]), 10).await.unwrap();
        assert_eq!(
            older.iter().map(|m| m.content.as_str()).collect::<Vec<_>>(),
            ["m2", "m1", "m0"]
        );
    }

    #[tokio::test]
    async fn test_magic_code_wrong_hash_does_not_consume() {
        let repo = InMemoryRepository::new();
        let expires = Utc::now() + Duration::minutes(5);
        repo.create_magic_code("a@example.com", "right", expires)
            .await
            .unwrap();

        assert!(repo
            .consume_magic_code("a@example.com", "wrong", Utc::now())
            .await
            .is_err());
        repo.consume_magic_code("A@example.com", "right", Utc::now())
            .await
            .unwrap();
        assert!(repo
            .consume_magic_code("a@example.com", "right", Utc::now())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_registration_token_single_use() {
        let repo = InMemoryRepository::new();
        repo.create_registration_token("reg", Utc::now() + Duration::days(1))
            .await
            .unwrap();

        repo.consume_registration_token("reg", Utc::now())
            .await
            .unwrap();
        assert_eq!(
            repo.consume_registration_token("reg", Utc::now()).await,
            Err(RepositoryError::Revoked)
        );
    }

    #[tokio::test]
    async fn test_injected_write_failure() {
        let repo = InMemoryRepository::new();
        repo.set_fail_writes(true);
        let result = repo
            .create_user(NewUser {
                username: "x".to_string(),
                email: "x@example.com".to_string(),
            })
            .await;
        assert!(matches!(result, Err(RepositoryError::Backend(_))));
    }
}
