//! Ordered user-resolution strategies for the password step.
//!
//! Users live in more than one place: global administrators are keyed by
//! email, theater users by username within a tenant. Each place is a
//! [`UserStrategy`]; [`UserResolver`] tries them in order and the first one
//! that recognises the identifier and password wins.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::AuthError;
use super::password::verify_password;
use crate::models::auth::{AuthenticatedPrincipal, UserCredentials};
use crate::store::Store;

/// One place users can be found.
#[async_trait]
pub trait UserStrategy: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// `Ok(None)` when the identifier is not ours or the password does not match.
    async fn resolve(
        &self,
        store: &dyn Store,
        identifier: &str,
        password: &str,
    ) -> Result<Option<AuthenticatedPrincipal>, AuthError>;
}

/// Global administrators, identified by email.
pub struct AdminByEmail;

#[async_trait]
impl UserStrategy for AdminByEmail {
    fn name(&self) -> &'static str {
        "admin_by_email"
    }

    async fn resolve(
        &self,
        store: &dyn Store,
        identifier: &str,
        password: &str,
    ) -> Result<Option<AuthenticatedPrincipal>, AuthError> {
        if !identifier.contains('@') {
            return Ok(None);
        }
        let Some(candidate) = store.find_admin_by_email(identifier).await? else {
            return Ok(None);
        };
        Ok(accept(candidate, password, false))
    }
}

/// Theater users, identified by username. Usernames are only unique within
/// a tenant, so every candidate's password is checked.
pub struct TenantUserByUsername;

#[async_trait]
impl UserStrategy for TenantUserByUsername {
    fn name(&self) -> &'static str {
        "tenant_user_by_username"
    }

    async fn resolve(
        &self,
        store: &dyn Store,
        identifier: &str,
        password: &str,
    ) -> Result<Option<AuthenticatedPrincipal>, AuthError> {
        let candidates = store.find_tenant_users_by_username(identifier).await?;
        Ok(candidates
            .into_iter()
            .find_map(|candidate| accept(candidate, password, true)))
    }
}

fn accept(
    candidate: UserCredentials,
    password: &str,
    requires_pin: bool,
) -> Option<AuthenticatedPrincipal> {
    if !candidate.user.is_active {
        return None;
    }
    if !verify_password(password, &candidate.password_hash) {
        return None;
    }
    Some(AuthenticatedPrincipal {
        user: candidate.user,
        requires_pin,
    })
}

/// Tries each strategy in order.
#[derive(Clone)]
pub struct UserResolver {
    strategies: Vec<Arc<dyn UserStrategy>>,
}

impl UserResolver {
    pub fn new(strategies: Vec<Arc<dyn UserStrategy>>) -> Self {
        Self { strategies }
    }

    /// Administrators first, then theater users.
    pub fn standard() -> Self {
        Self::new(vec![Arc::new(AdminByEmail), Arc::new(TenantUserByUsername)])
    }

    /// Resolve `identifier` + `password` to a principal, or `InvalidCredentials`.
    pub async fn resolve(
        &self,
        store: &dyn Store,
        identifier: &str,
        password: &str,
    ) -> Result<AuthenticatedPrincipal, AuthError> {
        let identifier = identifier.trim();
        if identifier.is_empty() || password.is_empty() {
            return Err(AuthError::InvalidCredentials);
        }
        for strategy in &self.strategies {
            if let Some(principal) = strategy.resolve(store, identifier, password).await? {
                debug!(strategy = strategy.name(), user_id = %principal.user.id, "user resolved");
                return Ok(principal);
            }
        }
        Err(AuthError::InvalidCredentials)
    }
}

impl Default for UserResolver {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::password::hash_password;
    use crate::id::{TenantId, UserId};
    use crate::models::auth::User;
    use crate::store::memory::MemoryStore;

    fn user(id: &str, tenant: Option<&str>, username: &str, password: &str) -> UserCredentials {
        UserCredentials {
            user: User {
                id: UserId::new(id),
                tenant_id: tenant.map(TenantId::new),
                username: username.into(),
                email: tenant.is_none().then(|| format!("{username}@example.com")),
                display_name: None,
                role: if tenant.is_none() { "admin" } else { "cashier" }.into(),
                user_type: if tenant.is_none() { "admin" } else { "theater_user" }.into(),
                is_active: true,
                last_login_at: None,
            },
            password_hash: hash_password(password).unwrap(),
            pin: tenant.map(|_| "4242".into()),
        }
    }

    #[tokio::test]
    async fn admin_resolves_by_email_without_pin() {
        let store = MemoryStore::new();
        store.insert_user(&user("A1", None, "boss", "secret")).await.unwrap();
        let principal = UserResolver::standard()
            .resolve(&store, "BOSS@example.com", "secret")
            .await
            .unwrap();
        assert_eq!(principal.user.id, UserId::new("A1"));
        assert!(!principal.requires_pin);
    }

    #[tokio::test]
    async fn shared_username_picks_the_candidate_whose_password_matches() {
        let store = MemoryStore::new();
        store.insert_user(&user("U1", Some("T1"), "cashier1", "one")).await.unwrap();
        store.insert_user(&user("U2", Some("T2"), "cashier1", "two")).await.unwrap();
        let principal = UserResolver::standard()
            .resolve(&store, " cashier1 ", "two")
            .await
            .unwrap();
        assert_eq!(principal.user.id, UserId::new("U2"));
        assert!(principal.requires_pin);
    }

    #[tokio::test]
    async fn wrong_password_and_inactive_users_are_rejected() {
        let store = MemoryStore::new();
        store.insert_user(&user("U1", Some("T1"), "cashier1", "p@ss")).await.unwrap();
        let resolver = UserResolver::standard();
        assert!(matches!(
            resolver.resolve(&store, "cashier1", "nope").await,
            Err(AuthError::InvalidCredentials)
        ));
        store.set_user_active(&UserId::new("U1"), false).await.unwrap();
        assert!(matches!(
            resolver.resolve(&store, "cashier1", "p@ss").await,
            Err(AuthError::InvalidCredentials)
        ));
    }

    #[tokio::test]
    async fn unavailable_store_is_not_reported_as_bad_credentials() {
        let store = MemoryStore::new();
        store.set_available(false);
        assert!(matches!(
            UserResolver::standard().resolve(&store, "cashier1", "p@ss").await,
            Err(AuthError::Store(_))
        ));
    }
}
