// @awa-component: AUTH-TokenSessionAuthority
//
//! Token and session authority.
//!
//! Two-step login for theater users (password, then PIN), direct login for
//! administrators, refresh, logout and per-request session checks. Each user
//! has at most one active session: creating a session replaces every other
//! active session of the same principal in one store transaction.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use marquee_core::auth::jwt::{IssuedToken, TokenIssuer, normalize_token};
use marquee_core::auth::pin::pin_matches;
use marquee_core::auth::resolver::UserResolver;
use marquee_core::auth::{AuthError, hash_token};
use marquee_core::id::{TenantId, UserId, uuidv7};
use marquee_core::models::auth::{
    Caller, ROLE_POS_AGENT, Session, TokenKind, TokenSubject, USER_TYPE_AGENT, User,
};
use marquee_core::store::{DynStore, StoreError, wait_until_ready};
use marquee_core::tenancy::{TenancyError, ensure_caller_tenant_active};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult};

/// Attempts at replacing a session when a concurrent login wins the race.
const SESSION_REPLACE_ATTEMPTS: usize = 3;

/// Client metadata recorded on the session.
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
}

/// A freshly minted access + refresh pair bound to one session.
#[derive(Debug, Clone)]
pub struct TokenBundle {
    pub session_id: Uuid,
    pub access: IssuedToken,
    pub refresh: IssuedToken,
}

/// Result of the password step.
#[derive(Debug)]
pub enum LoginOutcome {
    /// Administrators get a session right away.
    Authenticated { user: User, tokens: TokenBundle },
    /// Theater users must present their PIN with this pending token.
    PinRequired { user: User, pending: IssuedToken },
}

/// Result of the PIN step.
#[derive(Debug)]
pub struct PinOutcome {
    pub user: User,
    pub tokens: TokenBundle,
    /// Delegated credential for the tenant's agent.
    pub agent_grant: Option<IssuedToken>,
    pub tenant_name: Option<String>,
}

/// Login, PIN validation, refresh, logout and session checks.
#[derive(Clone)]
pub struct AuthService {
    store: DynStore,
    tokens: Arc<TokenIssuer>,
    resolver: Arc<UserResolver>,
    db_ready_timeout: Duration,
    fail_closed: bool,
}

impl AuthService {
    pub fn new(
        store: DynStore,
        tokens: TokenIssuer,
        resolver: UserResolver,
        db_ready_timeout: Duration,
        fail_closed: bool,
    ) -> Self {
        Self {
            store,
            tokens: Arc::new(tokens),
            resolver: Arc::new(resolver),
            db_ready_timeout,
            fail_closed,
        }
    }

    pub fn tokens(&self) -> &TokenIssuer {
        &self.tokens
    }

    /// Password step.
    pub async fn login(&self, identifier: &str, password: &str) -> AppResult<LoginOutcome> {
        wait_until_ready(self.store.as_ref(), self.db_ready_timeout).await?;
        let principal = self
            .resolver
            .resolve(self.store.as_ref(), identifier, password)
            .await?;
        let user = principal.user;

        if principal.requires_pin {
            let pending = self.tokens.issue(
                TokenKind::Pending,
                &TokenSubject::from(&user),
                Uuid::new_v4(),
            )?;
            debug!(user_id = %user.id, "password accepted, PIN required");
            return Ok(LoginOutcome::PinRequired { user, pending });
        }

        let tokens = self
            .create_session(&TokenSubject::from(&user), ClientInfo::default())
            .await?;
        self.record_last_login(&user.id).await;
        info!(user_id = %user.id, "administrator logged in");
        Ok(LoginOutcome::Authenticated { user, tokens })
    }

    /// PIN step. `pending_token` is the envelope from the password step.
    pub async fn validate_pin(
        &self,
        pending_token: &str,
        user_id: &UserId,
        tenant_id: Option<&TenantId>,
        pin: &str,
        client: ClientInfo,
    ) -> AppResult<PinOutcome> {
        let claims = self.tokens.verify(pending_token, TokenKind::Pending)?;
        if &claims.user_id != user_id {
            return Err(AppError::TokenInvalid("pending auth belongs to another user".into()));
        }
        if let Some(requested) = tenant_id
            && claims.tenant_id.as_ref() != Some(requested)
        {
            return Err(AppError::TokenInvalid("pending auth belongs to another theater".into()));
        }

        let credentials = self
            .store
            .get_user(user_id)
            .await?
            .filter(|c| c.user.is_active)
            .ok_or(AppError::InvalidCredentials)?;
        let Some(stored_pin) = credentials.pin.as_deref() else {
            return Err(AppError::InvalidPin);
        };
        if !pin_matches(stored_pin, pin) {
            warn!(user_id = %user_id, "invalid PIN");
            return Err(AppError::InvalidPin);
        }
        let user = credentials.user;

        let mut tenant_name = None;
        if let Some(tenant_id) = &user.tenant_id {
            match self.store.get_tenant(tenant_id).await? {
                Some(tenant) if tenant.is_active => tenant_name = Some(tenant.name),
                Some(_) => return Err(AppError::TheaterInactive(tenant_id.to_string())),
                None => return Err(AppError::TheaterNotFound(tenant_id.to_string())),
            }
        }

        let tokens = self.create_session(&TokenSubject::from(&user), client).await?;
        self.record_last_login(&user.id).await;

        let agent_grant = match &user.tenant_id {
            Some(tenant_id) => Some(self.tokens.issue(
                TokenKind::AgentGrant,
                &agent_subject(tenant_id),
                Uuid::new_v4(),
            )?),
            None => None,
        };

        info!(user_id = %user.id, tenant_id = ?user.tenant_id.as_ref().map(TenantId::as_str), "PIN accepted, session created");
        Ok(PinOutcome {
            user,
            tokens,
            agent_grant,
            tenant_name,
        })
    }

    /// Exchange a refresh token for a new pair on the same session.
    pub async fn refresh(&self, refresh_token: &str) -> AppResult<TokenBundle> {
        let claims = self.tokens.verify(refresh_token, TokenKind::Refresh)?;
        let token = normalize_token(refresh_token)?;
        let session = self
            .store
            .find_active_session_by_refresh(&hash_token(token))
            .await?
            .ok_or(AppError::SessionInvalidated)?;

        let subject = TokenSubject::from(&claims);
        self.check_tenant(&Caller::from(claims)).await?;

        let bundle = self.issue_pair(&subject, session.id)?;
        let rotated = self
            .store
            .rotate_session_tokens(
                session.id,
                &hash_token(&bundle.access.token),
                &hash_token(&bundle.refresh.token),
            )
            .await?;
        if !rotated {
            return Err(AppError::SessionInvalidated);
        }
        debug!(user_id = %subject.user_id, session_id = %session.id, "tokens refreshed");
        Ok(bundle)
    }

    /// Mark the token's session inactive. Never fails: a missing, bad or
    /// unknown token and an unreachable database all count as logged out.
    pub async fn logout(&self, raw_token: Option<&str>) {
        let Some(token) = raw_token.and_then(|t| normalize_token(t).ok()) else {
            return;
        };
        match self.store.deactivate_session(&hash_token(token)).await {
            Ok(true) => debug!("session deactivated"),
            Ok(false) => debug!("logout for unknown or inactive session"),
            Err(e) => warn!("logout could not reach the session store: {e}"),
        }
    }

    /// Verify an access token and its session.
    ///
    /// When the database is unreachable the token alone is trusted unless the
    /// service was built fail-closed.
    pub async fn authenticate(&self, raw_token: &str) -> AppResult<Caller> {
        let claims = self.tokens.verify(raw_token, TokenKind::Access)?;
        let token = normalize_token(raw_token)?;
        let caller = Caller::from(claims);

        match self.store.find_active_session_by_token(&hash_token(token)).await {
            Ok(Some(session)) if session.user_id == caller.user_id => {}
            Ok(_) => return Err(AppError::SessionInvalidated),
            Err(StoreError::Unavailable(msg)) => {
                if self.fail_closed {
                    return Err(AppError::DatabaseNotReady(msg));
                }
                warn!(user_id = %caller.user_id, "session store unavailable, trusting token alone: {msg}");
                return Ok(caller);
            }
            Err(e) => return Err(e.into()),
        }

        self.check_tenant(&caller).await?;
        Ok(caller)
    }

    /// Record activity on the caller's session.
    pub async fn touch(&self, caller: &Caller) {
        if let Err(e) = self.store.touch_session(caller.session_id, Utc::now()).await {
            debug!(session_id = %caller.session_id, "could not touch session: {e}");
        }
    }

    /// Session for the tenant's agent principal from a delegated grant.
    pub async fn exchange_agent_grant(&self, grant: &str) -> AppResult<TokenBundle> {
        let claims = self.tokens.verify(grant, TokenKind::AgentGrant)?;
        let Some(tenant_id) = claims.tenant_id.clone() else {
            return Err(AppError::TokenInvalid("agent grant without theater".into()));
        };
        if !claims.role.eq_ignore_ascii_case(ROLE_POS_AGENT) {
            return Err(AppError::TokenInvalid("grant is not for an agent".into()));
        }
        self.agent_session(&tenant_id).await
    }

    /// Session for the tenant's agent principal from a theater user's
    /// password and PIN. The user's own session is left untouched.
    pub async fn agent_login_with_password(
        &self,
        username: &str,
        password: &str,
        pin: Option<&str>,
        tenant_id: &TenantId,
    ) -> AppResult<TokenBundle> {
        wait_until_ready(self.store.as_ref(), self.db_ready_timeout).await?;
        let principal = self
            .resolver
            .resolve(self.store.as_ref(), username, password)
            .await?;
        let user = principal.user;
        if !user.is_global_admin() {
            if user.tenant_id.as_ref() != Some(tenant_id) {
                return Err(AppError::TheaterAccessDenied(tenant_id.to_string()));
            }
            if principal.requires_pin {
                let stored = self
                    .store
                    .get_user(&user.id)
                    .await?
                    .and_then(|c| c.pin)
                    .ok_or(AppError::InvalidPin)?;
                if !pin.is_some_and(|p| pin_matches(&stored, p)) {
                    return Err(AppError::InvalidPin);
                }
            }
        }
        self.agent_session(tenant_id).await
    }

    async fn agent_session(&self, tenant_id: &TenantId) -> AppResult<TokenBundle> {
        match self.store.get_tenant(tenant_id).await? {
            Some(tenant) if tenant.is_active => {}
            Some(_) => return Err(AppError::TheaterInactive(tenant_id.to_string())),
            None => return Err(AppError::TheaterNotFound(tenant_id.to_string())),
        }
        let bundle = self
            .create_session(&agent_subject(tenant_id), ClientInfo::default())
            .await?;
        info!(tenant_id = %tenant_id, "agent session created");
        Ok(bundle)
    }

    /// Reject callers whose theater has been deactivated. Passes when the
    /// store is unreachable, unless fail-closed.
    async fn check_tenant(&self, caller: &Caller) -> AppResult<()> {
        match ensure_caller_tenant_active(self.store.as_ref(), caller).await {
            Ok(()) => Ok(()),
            Err(TenancyError::Store(StoreError::Unavailable(msg))) if !self.fail_closed => {
                warn!(user_id = %caller.user_id, "tenant check skipped, store unavailable: {msg}");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn issue_pair(&self, subject: &TokenSubject, session_id: Uuid) -> AppResult<TokenBundle> {
        let access = self.tokens.issue(TokenKind::Access, subject, session_id)?;
        let refresh = self.tokens.issue(TokenKind::Refresh, subject, session_id)?;
        Ok(TokenBundle {
            session_id,
            access,
            refresh,
        })
    }

    /// Mint a pair and make it the subject's only active session.
    async fn create_session(
        &self,
        subject: &TokenSubject,
        client: ClientInfo,
    ) -> Result<TokenBundle, AuthError> {
        let mut last_conflict = None;
        for attempt in 1..=SESSION_REPLACE_ATTEMPTS {
            let session_id = uuidv7();
            let bundle = self
                .issue_pair(subject, session_id)
                .map_err(|e| AuthError::Internal(e.to_string()))?;
            let now = Utc::now();
            let session = Session {
                id: session_id,
                user_id: subject.user_id.clone(),
                tenant_id: subject.tenant_id.clone(),
                token_hash: hash_token(&bundle.access.token),
                refresh_hash: hash_token(&bundle.refresh.token),
                created_at: now,
                last_activity: now,
                is_active: true,
                user_agent: client.user_agent.clone(),
                ip_address: client.ip_address.clone(),
            };
            match self.store.replace_session(&session).await {
                Ok(()) => return Ok(bundle),
                Err(StoreError::Conflict(msg)) => {
                    debug!(user_id = %subject.user_id, attempt, "concurrent login, retrying session replace");
                    last_conflict = Some(msg);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(AuthError::Store(StoreError::Conflict(
            last_conflict.unwrap_or_else(|| "session replace kept conflicting".into()),
        )))
    }

    async fn record_last_login(&self, user_id: &UserId) {
        if let Err(e) = self.store.record_last_login(user_id, Utc::now()).await {
            warn!(user_id = %user_id, "could not record last login: {e}");
        }
    }
}

/// Identity of a tenant's POS agent.
pub fn agent_subject(tenant_id: &TenantId) -> TokenSubject {
    TokenSubject {
        user_id: UserId::agent_for(tenant_id),
        username: format!("agent:{tenant_id}"),
        role: ROLE_POS_AGENT.to_string(),
        user_type: USER_TYPE_AGENT.to_string(),
        tenant_id: Some(tenant_id.clone()),
    }
}

impl TokenBundle {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.access.expires_at
    }
}
