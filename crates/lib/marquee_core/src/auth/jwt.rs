//! Token issuing and verification (HS256 JWTs).
//!
//! Every token Marquee signs carries a [`TokenKind`]; verification always
//! names the kind it expects, so a pending envelope or an agent grant can
//! never be replayed as a bearer token.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use tracing::warn;
use uuid::Uuid;

use super::AuthError;
use crate::id::canonicalize;
use crate::models::auth::{TokenClaims, TokenKind, TokenSubject};

/// Minimum signing secret length enforced in production.
pub const MIN_SECRET_LEN: usize = 32;

/// Fixed secret used in development when none is configured.
const DEV_FALLBACK_SECRET: &str = "marquee-development-only-signing-secret-do-not-deploy";

/// Clock skew tolerated when checking `exp`.
const LEEWAY_SECS: u64 = 5;

/// Lifetimes of the token kinds.
#[derive(Debug, Clone, Copy)]
pub struct TokenTtls {
    pub access: Duration,
    pub refresh: Duration,
    pub pending: Duration,
    pub agent_grant: Duration,
}

impl Default for TokenTtls {
    fn default() -> Self {
        Self {
            access: Duration::hours(24),
            refresh: Duration::days(7),
            pending: Duration::minutes(5),
            agent_grant: Duration::minutes(15),
        }
    }
}

/// A freshly signed token.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Signs and verifies all token kinds.
#[derive(Clone)]
pub struct TokenIssuer {
    access_secret: Vec<u8>,
    refresh_secret: Vec<u8>,
    ttls: TokenTtls,
}

impl std::fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("ttls", &self.ttls)
            .finish_non_exhaustive()
    }
}

impl TokenIssuer {
    pub fn new(access_secret: &str, refresh_secret: &str, ttls: TokenTtls) -> Self {
        Self {
            access_secret: access_secret.as_bytes().to_vec(),
            refresh_secret: refresh_secret.as_bytes().to_vec(),
            ttls,
        }
    }

    pub fn ttls(&self) -> &TokenTtls {
        &self.ttls
    }

    fn secret_for(&self, kind: TokenKind) -> &[u8] {
        match kind {
            TokenKind::Refresh => &self.refresh_secret,
            TokenKind::Access | TokenKind::Pending | TokenKind::AgentGrant => &self.access_secret,
        }
    }

    fn ttl_for(&self, kind: TokenKind) -> Duration {
        match kind {
            TokenKind::Access => self.ttls.access,
            TokenKind::Refresh => self.ttls.refresh,
            TokenKind::Pending => self.ttls.pending,
            TokenKind::AgentGrant => self.ttls.agent_grant,
        }
    }

    /// Sign a token of `kind` for `subject`, bound to session/grant `sid`.
    pub fn issue(
        &self,
        kind: TokenKind,
        subject: &TokenSubject,
        sid: Uuid,
    ) -> Result<IssuedToken, AuthError> {
        let now = Utc::now();
        let expires_at = now + self.ttl_for(kind);
        let claims = TokenClaims {
            user_id: subject.user_id.clone(),
            username: subject.username.clone(),
            role: subject.role.clone(),
            user_type: subject.user_type.clone(),
            tenant_id: subject.tenant_id.clone(),
            sid,
            kind,
            exp: expires_at.timestamp(),
            iat: now.timestamp(),
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.secret_for(kind)),
        )
        .map_err(|e| AuthError::Internal(format!("jwt encode: {e}")))?;
        Ok(IssuedToken { token, expires_at })
    }

    /// Normalize, shape-check and verify a token of the expected kind.
    pub fn verify(&self, raw: &str, kind: TokenKind) -> Result<TokenClaims, AuthError> {
        let token = normalize_token(raw)?;
        let key = DecodingKey::from_secret(self.secret_for(kind));
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = LEEWAY_SECS;
        let data = decode::<TokenClaims>(token, &key, &validation).map_err(|e| match e.kind() {
            ErrorKind::ExpiredSignature => AuthError::TokenInvalid("token expired".into()),
            ErrorKind::InvalidSignature => AuthError::TokenInvalid("bad signature".into()),
            _ => AuthError::TokenInvalid(format!("jwt decode: {e}")),
        })?;
        if data.claims.kind != kind {
            return Err(AuthError::TokenInvalid(format!(
                "expected {} token, got {}",
                kind.as_str(),
                data.claims.kind.as_str()
            )));
        }
        Ok(data.claims)
    }
}

/// Trim, strip wrapping quotes and check the three-segment shape.
///
/// Runs before any signature verification.
pub fn normalize_token(raw: &str) -> Result<&str, AuthError> {
    let token = canonicalize(raw);
    if token.is_empty() {
        return Err(AuthError::TokenMissing);
    }
    if token.split('.').count() != 3 {
        return Err(AuthError::TokenMalformed);
    }
    Ok(token)
}

/// Apply the signing-secret policy.
///
/// In production a missing or short secret is fatal. In development a fixed
/// fallback is accepted with a warning.
pub fn resolve_signing_secret(
    name: &str,
    value: Option<&str>,
    production: bool,
) -> Result<String, AuthError> {
    let value = value.map(str::trim).filter(|v| !v.is_empty());
    match value {
        Some(secret) if secret.len() >= MIN_SECRET_LEN => Ok(secret.to_string()),
        Some(_) if production => Err(AuthError::Config(format!(
            "{name} must be at least {MIN_SECRET_LEN} bytes in production"
        ))),
        None if production => Err(AuthError::Config(format!(
            "{name} is required in production"
        ))),
        Some(secret) => {
            warn!(name, "signing secret shorter than {MIN_SECRET_LEN} bytes (development only)");
            Ok(secret.to_string())
        }
        None => {
            warn!(name, "no signing secret configured, using development fallback");
            Ok(DEV_FALLBACK_SECRET.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{TenantId, UserId};

    fn issuer() -> TokenIssuer {
        TokenIssuer::new(
            "access-secret-access-secret-access-secret",
            "refresh-secret-refresh-secret-refresh-secret",
            TokenTtls::default(),
        )
    }

    fn subject() -> TokenSubject {
        TokenSubject {
            user_id: UserId::new("U1"),
            username: "cashier1".into(),
            role: "cashier".into(),
            user_type: "theater_user".into(),
            tenant_id: Some(TenantId::new("T1")),
        }
    }

    #[test]
    fn issued_access_token_verifies() {
        let issuer = issuer();
        let sid = Uuid::new_v4();
        let issued = issuer.issue(TokenKind::Access, &subject(), sid).unwrap();
        let claims = issuer.verify(&issued.token, TokenKind::Access).unwrap();
        assert_eq!(claims.user_id, UserId::new("U1"));
        assert_eq!(claims.tenant_id, Some(TenantId::new("T1")));
        assert_eq!(claims.sid, sid);
    }

    #[test]
    fn quoted_and_padded_tokens_are_normalized() {
        let issuer = issuer();
        let issued = issuer
            .issue(TokenKind::Access, &subject(), Uuid::new_v4())
            .unwrap();
        let wrapped = format!("  \"{}\" ", issued.token);
        assert!(issuer.verify(&wrapped, TokenKind::Access).is_ok());
    }

    #[test]
    fn four_segments_are_malformed_before_signature_check() {
        let issuer = issuer();
        let issued = issuer
            .issue(TokenKind::Access, &subject(), Uuid::new_v4())
            .unwrap();
        let padded = format!("{}.extra", issued.token);
        assert!(matches!(
            issuer.verify(&padded, TokenKind::Access),
            Err(AuthError::TokenMalformed)
        ));
        assert!(matches!(
            normalize_token("a.b"),
            Err(AuthError::TokenMalformed)
        ));
        assert!(matches!(normalize_token(" \"\" "), Err(AuthError::TokenMissing)));
    }

    #[test]
    fn kind_mismatch_is_rejected() {
        let issuer = issuer();
        let pending = issuer
            .issue(TokenKind::Pending, &subject(), Uuid::new_v4())
            .unwrap();
        assert!(matches!(
            issuer.verify(&pending.token, TokenKind::Access),
            Err(AuthError::TokenInvalid(_))
        ));
    }

    #[test]
    fn refresh_tokens_use_their_own_secret() {
        let issuer = issuer();
        let refresh = issuer
            .issue(TokenKind::Refresh, &subject(), Uuid::new_v4())
            .unwrap();
        assert!(issuer.verify(&refresh.token, TokenKind::Refresh).is_ok());

        let other = TokenIssuer::new(
            "access-secret-access-secret-access-secret",
            "a-different-refresh-secret-of-enough-length",
            TokenTtls::default(),
        );
        assert!(other.verify(&refresh.token, TokenKind::Refresh).is_err());
    }

    #[test]
    fn expired_tokens_are_invalid() {
        let ttls = TokenTtls {
            access: Duration::seconds(-120),
            ..TokenTtls::default()
        };
        let issuer = TokenIssuer::new(
            "access-secret-access-secret-access-secret",
            "refresh-secret-refresh-secret-refresh-secret",
            ttls,
        );
        let issued = issuer
            .issue(TokenKind::Access, &subject(), Uuid::new_v4())
            .unwrap();
        assert!(matches!(
            issuer.verify(&issued.token, TokenKind::Access),
            Err(AuthError::TokenInvalid(_))
        ));
    }

    #[test]
    fn secret_policy_is_fatal_in_production() {
        assert!(resolve_signing_secret("JWT_SECRET", None, true).is_err());
        assert!(resolve_signing_secret("JWT_SECRET", Some("short"), true).is_err());
        let long = "x".repeat(MIN_SECRET_LEN);
        assert_eq!(
            resolve_signing_secret("JWT_SECRET", Some(&long), true).unwrap(),
            long
        );
    }

    #[test]
    fn secret_policy_falls_back_in_development() {
        let secret = resolve_signing_secret("JWT_SECRET", Some("   "), false).unwrap();
        assert!(secret.len() >= MIN_SECRET_LEN);
        assert_eq!(
            resolve_signing_secret("JWT_SECRET", Some("short"), false).unwrap(),
            "short"
        );
    }
}
