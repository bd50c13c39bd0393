//! Admission gate placed in front of every downstream route.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::{debug, error, info, instrument};

use super::identity::{extract_client_ip, extract_token, IdentityPolicy, RejectReason, Resolution};
use crate::ratelimit::{Decision, RateLimiterBackend};

/// Body sent with every 429.
pub const RATE_LIMITED_MESSAGE: &str = "you have reached the maximum number of requests or \
    actions allowed within a certain time frame";

/// State shared by every invocation of [`admission_gate`].
pub struct Gate<R: RateLimiterBackend> {
    /// The rate limiter instance
    limiter: Arc<R>,
    /// How requests map to identities
    policy: IdentityPolicy,
}

impl<R: RateLimiterBackend> Gate<R> {
    /// Create a gate over `limiter`.
    pub fn new(limiter: Arc<R>, policy: IdentityPolicy) -> Self {
        if policy.is_conflicting() {
            error!("address-only and token-only modes are both enabled; rate limiting is disabled");
        }
        Self { limiter, policy }
    }

    /// The identity policy in force.
    pub fn policy(&self) -> IdentityPolicy {
        self.policy
    }
}

impl<R: RateLimiterBackend> Clone for Gate<R> {
    fn clone(&self) -> Self {
        Self {
            limiter: Arc::clone(&self.limiter),
            policy: self.policy,
        }
    }
}

/// Decide whether a request reaches `next`.
///
/// Forwards admitted requests unchanged, answers 429 when the limiter denies
/// and 401 when the request cannot be mapped to a valid identity.
#[instrument(
    skip_all,
    fields(
        method = %request.method(),
        path = %request.uri().path()
    )
)]
pub async fn admission_gate<R>(
    State(gate): State<Gate<R>>,
    request: Request,
    next: Next,
) -> Response
where
    R: RateLimiterBackend + 'static,
{
    if gate.policy.is_conflicting() {
        error!("Conflicting identity modes configured, bypassing rate limiter");
        return next.run(request).await;
    }

    let client_ip = extract_client_ip(&request);
    // Address-only mode never reads the token, not even to validate it.
    let token = if gate.policy.address_only {
        None
    } else {
        match extract_token(request.headers()) {
            Ok(token) => token.map(str::to_owned),
            Err(reason) => return unauthorized(reason),
        }
    };

    let (identity, tier) = match gate.policy.resolve(token.as_deref(), client_ip) {
        Resolution::Limit { identity, tier } => (identity, tier),
        Resolution::Bypass => return next.run(request).await,
        Resolution::Reject(reason) => return unauthorized(reason),
    };

    let decision = gate.limiter.decide(&identity, tier).await;
    debug!(identity = %identity, tier, decision = ?decision, "Rate limit decision made");

    match decision {
        Decision::Allow => next.run(request).await,
        Decision::Deny => {
            info!(
                identity = %identity,
                tier,
                "Identity has reached the maximum number of requests for the current window"
            );
            (StatusCode::TOO_MANY_REQUESTS, RATE_LIMITED_MESSAGE).into_response()
        }
    }
}

fn unauthorized(reason: RejectReason) -> Response {
    info!(reason = reason.message(), "Rejecting request before rate limiting");
    (StatusCode::UNAUTHORIZED, reason.message()).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{HeaderValue, Request as HttpRequest};
    use axum::routing::get;
    use axum::Router;
    use parking_lot::Mutex;
    use tower::ServiceExt;

    /// Records every call and answers with a fixed decision.
    struct RecordingBackend {
        decision: Decision,
        calls: Mutex<Vec<(String, u8)>>,
    }

    impl RecordingBackend {
        fn new(decision: Decision) -> Arc<Self> {
            Arc::new(Self {
                decision,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<(String, u8)> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl RateLimiterBackend for RecordingBackend {
        async fn decide(&self, identity: &str, tier: u8) -> Decision {
            self.calls.lock().push((identity.to_string(), tier));
            self.decision
        }
    }

    fn create_app(backend: Arc<RecordingBackend>, policy: IdentityPolicy) -> Router {
        Router::new()
            .route("/", get(|| async { "OK" }))
            .layer(axum::middleware::from_fn_with_state(
                Gate::new(backend, policy),
                admission_gate::<RecordingBackend>,
            ))
    }

    fn request(token: Option<&str>) -> HttpRequest<Body> {
        let mut builder = HttpRequest::builder()
            .uri("/")
            .header("x-forwarded-for", "203.0.113.9");
        if let Some(token) = token {
            builder = builder.header("API_KEY", token);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_allowed_request_is_forwarded() {
        let backend = RecordingBackend::new(Decision::Allow);
        let app = create_app(backend.clone(), IdentityPolicy::default());

        let response = app.oneshot(request(None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(backend.calls(), vec![("203.0.113.9".to_string(), 0)]);
    }

    #[tokio::test]
    async fn test_denied_request_gets_429() {
        let backend = RecordingBackend::new(Decision::Deny);
        let app = create_app(backend.clone(), IdentityPolicy::default());

        let response = app.oneshot(request(Some("3abc"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(backend.calls(), vec![("3abc".to_string(), 3)]);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], RATE_LIMITED_MESSAGE.as_bytes());
    }

    #[tokio::test]
    async fn test_malformed_token_gets_401_without_decision() {
        let backend = RecordingBackend::new(Decision::Allow);
        let app = create_app(backend.clone(), IdentityPolicy::default());

        let response = app.oneshot(request(Some("9abc"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(backend.calls().is_empty());

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"token malformed");
    }

    #[tokio::test]
    async fn test_missing_token_in_token_only_mode_gets_401() {
        let backend = RecordingBackend::new(Decision::Allow);
        let policy = IdentityPolicy {
            address_only: false,
            token_only: true,
        };
        let app = create_app(backend.clone(), policy);

        let response = app.oneshot(request(None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_conflicting_modes_fail_open() {
        let backend = RecordingBackend::new(Decision::Deny);
        let policy = IdentityPolicy {
            address_only: true,
            token_only: true,
        };
        let app = create_app(backend.clone(), policy);

        for token in [None, Some("9abc"), Some("1abc")] {
            let response = app.clone().oneshot(request(token)).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_address_only_mode_limits_by_address() {
        let backend = RecordingBackend::new(Decision::Allow);
        let policy = IdentityPolicy {
            address_only: true,
            token_only: false,
        };
        let app = create_app(backend.clone(), policy);

        let response = app.oneshot(request(Some("4abc"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(backend.calls(), vec![("203.0.113.9".to_string(), 0)]);
    }

    #[tokio::test]
    async fn test_address_only_mode_ignores_undecodable_token() {
        let backend = RecordingBackend::new(Decision::Allow);
        let policy = IdentityPolicy {
            address_only: true,
            token_only: false,
        };
        let app = create_app(backend.clone(), policy);

        let request = HttpRequest::builder()
            .uri("/")
            .header("x-forwarded-for", "203.0.113.9")
            .header("API_KEY", HeaderValue::from_bytes(b"1caf\xe9").unwrap())
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(backend.calls(), vec![("203.0.113.9".to_string(), 0)]);
    }

    #[tokio::test]
    async fn test_undecodable_token_gets_401_by_default() {
        let backend = RecordingBackend::new(Decision::Allow);
        let app = create_app(backend.clone(), IdentityPolicy::default());

        let request = HttpRequest::builder()
            .uri("/")
            .header("API_KEY", HeaderValue::from_bytes(b"1caf\xe9").unwrap())
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(backend.calls().is_empty());
    }
}
