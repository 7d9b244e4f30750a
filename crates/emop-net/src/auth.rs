//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Static token authentication for the gRPC surface."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::sync::Arc;

use tonic::service::Interceptor;
use tonic::{Request, Status};

/// Checks the `authorization` metadata against a fixed token list.
/// An empty list disables the check.
#[derive(Debug, Clone, Default)]
pub struct TokenAuthInterceptor {
    tokens: Arc<HashSet<String>>,
}

impl TokenAuthInterceptor {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: Arc::new(tokens.into_iter().map(Into::into).collect()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.tokens.is_empty()
    }
}

impl Interceptor for TokenAuthInterceptor {
    fn call(&mut self, request: Request<()>) -> Result<Request<()>, Status> {
        if self.tokens.is_empty() {
            return Ok(request);
        }
        let presented = request
            .metadata()
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .map(|value| value.trim().trim_start_matches("Bearer ").trim());
        match presented {
            Some(token) if self.tokens.contains(token) => Ok(request),
            _ => Err(Status::unauthenticated("invalid or missing token")),
        }
    }
}

#[cfg(test)]
mod tests {
    use tonic::metadata::MetadataValue;
    use tonic::Code;

    use super::*;

    fn request_with(token: Option<&'static str>) -> Request<()> {
        let mut request = Request::new(());
        if let Some(token) = token {
            request
                .metadata_mut()
                .insert("authorization", MetadataValue::from_static(token));
        }
        request
    }

    #[test]
    fn empty_token_list_allows_everything() {
        let mut auth = TokenAuthInterceptor::default();
        assert!(!auth.is_enabled());
        assert!(auth.call(request_with(None)).is_ok());
    }

    #[test]
    fn accepts_raw_and_bearer_tokens() {
        let mut auth = TokenAuthInterceptor::new(["s3cret"]);
        assert!(auth.call(request_with(Some("s3cret"))).is_ok());
        assert!(auth.call(request_with(Some("Bearer s3cret"))).is_ok());
    }

    #[test]
    fn rejects_missing_or_wrong_token() {
        let mut auth = TokenAuthInterceptor::new(["s3cret"]);
        let missing = auth.call(request_with(None)).unwrap_err();
        assert_eq!(missing.code(), Code::Unauthenticated);
        let wrong = auth.call(request_with(Some("guess"))).unwrap_err();
        assert_eq!(wrong.code(), Code::Unauthenticated);
    }
}
