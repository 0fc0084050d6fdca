// @awa-component: AUTH-AccessControl
//
//! Authentication middleware: bearer token extraction, token verification and
//! the single-active-session check.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, Uri};
use marquee_core::models::auth::Caller;

use crate::AppState;
use crate::error::AppError;

/// Verified caller stored in request extensions.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser(pub Caller);

/// Raw token from `Authorization: Bearer <token>`, or from `?token=` for
/// clients that cannot set headers on an event stream.
pub fn extract_token(headers: &HeaderMap, uri: &Uri) -> Result<String, AppError> {
    if let Some(header) = headers.get(AUTHORIZATION) {
        let header = header.to_str().map_err(|_| AppError::TokenMalformed)?;
        let token = header
            .strip_prefix("Bearer ")
            .or_else(|| header.strip_prefix("bearer "))
            .ok_or(AppError::TokenMalformed)?;
        if token.trim().is_empty() {
            return Err(AppError::TokenMissing);
        }
        return Ok(token.to_string());
    }
    uri.query()
        .and_then(|query| {
            url::form_urlencoded::parse(query.as_bytes())
                .find(|(name, _)| name == "token")
                .map(|(_, value)| value.into_owned())
        })
        .filter(|token| !token.trim().is_empty())
        .ok_or(AppError::TokenMissing)
}

/// Axum middleware: verifies the token and its session, then injects
/// [`AuthenticatedUser`] into request extensions.
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = extract_token(request.headers(), request.uri())?;
    let caller = state.auth.authenticate(&token).await?;
    request.extensions_mut().insert(AuthenticatedUser(caller));
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn token(uri: &str, authorization: Option<&str>) -> Result<String, AppError> {
        let mut headers = HeaderMap::new();
        if let Some(value) = authorization {
            headers.insert(AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        }
        extract_token(&headers, &uri.parse().unwrap())
    }

    #[test]
    fn bearer_header_is_preferred() {
        assert_eq!(
            token("/stream?token=query", Some("Bearer header.a.b")).unwrap(),
            "header.a.b"
        );
    }

    #[test]
    fn query_token_is_accepted() {
        assert_eq!(token("/stream?x=1&token=a.b%2Ec", None).unwrap(), "a.b.c");
    }

    #[test]
    fn missing_and_malformed_headers_are_distinguished() {
        assert!(matches!(token("/orders", None), Err(AppError::TokenMissing)));
        assert!(matches!(
            token("/orders", Some("Basic dXNlcg==")),
            Err(AppError::TokenMalformed)
        ));
        assert!(matches!(
            token("/orders", Some("Bearer  ")),
            Err(AppError::TokenMissing)
        ));
    }
}
