//! Caller context middleware.
//!
//! Authorization is opaque to this server: an upstream gateway forwards who the
//! caller is and what they may do.
//! - No headers => local single-operator mode, everything allowed.
//! - `X-User-Id` => attributed caller.
//! - `X-Capabilities: cluster.read, admin.all` => capability-scoped caller; plugin
//!   routes and admin endpoints check against this list.

use axum::{
    async_trait,
    extract::{FromRequestParts, Request},
    http::request::Parts,
    middleware::Next,
    response::Response,
};

use plughub_core::plugins::CallerCapabilities;

use crate::error::AppError;

pub const USER_ID_HEADER: &str = "X-User-Id";
pub const CAPABILITIES_HEADER: &str = "X-Capabilities";
pub const ADMIN_CAPABILITY: &str = "admin.all";

/// Caller context attached to request extensions by middleware.
#[derive(Debug, Clone, Default)]
pub struct CallerContext {
    pub user_id: Option<String>,
    /// `None` when no capability header was sent.
    pub capabilities: Option<CallerCapabilities>,
}

impl CallerContext {
    /// Unscoped callers pass every check.
    pub fn require(&self, capability: &str) -> Result<(), AppError> {
        match &self.capabilities {
            Some(caps) if !caps.allows(capability) => Err(AppError::Forbidden(format!(
                "capability '{}' required",
                capability
            ))),
            _ => Ok(()),
        }
    }
}

/// Extractor for routes that want caller context.
pub struct Caller(pub CallerContext);

#[async_trait]
impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Caller(
            parts
                .extensions
                .get::<CallerContext>()
                .cloned()
                .unwrap_or_default(),
        ))
    }
}

/// Middleware that attaches caller info to request extensions.
pub async fn caller_context(mut request: Request, next: Next) -> Response {
    let headers = request.headers();
    let user_id = headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string);
    let capabilities = headers
        .get(CAPABILITIES_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(parse_capabilities);

    if let Some(caps) = &capabilities {
        tracing::debug!(
            user_id = user_id.as_deref().unwrap_or("-"),
            capabilities = caps.0.len(),
            "Scoped caller"
        );
        request.extensions_mut().insert(caps.clone());
    }
    request.extensions_mut().insert(CallerContext {
        user_id,
        capabilities,
    });

    next.run(request).await
}

fn parse_capabilities(raw: &str) -> CallerCapabilities {
    CallerCapabilities(
        raw.split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_header_is_split_and_trimmed() {
        let caps = parse_capabilities(" cluster.read, ,pod.write ");
        assert_eq!(caps.0, vec!["cluster.read".to_string(), "pod.write".to_string()]);
    }

    #[test]
    fn admin_requirement() {
        assert!(CallerContext::default().require(ADMIN_CAPABILITY).is_ok());

        let scoped = CallerContext {
            user_id: Some("ops".to_string()),
            capabilities: Some(parse_capabilities("cluster.read")),
        };
        assert!(scoped.require(ADMIN_CAPABILITY).is_err());

        let admin = CallerContext {
            user_id: None,
            capabilities: Some(parse_capabilities("admin.all")),
        };
        assert!(admin.require(ADMIN_CAPABILITY).is_ok());
    }
}
