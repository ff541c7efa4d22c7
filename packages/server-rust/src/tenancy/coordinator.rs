//! Request boundary coordinator.
//!
//! Tower layer that binds the caller's tenant for exactly one request:
//!
//! ```text
//! START -> EXTRACTED -> BOUND -> DOWNSTREAM -> UNBOUND -> END
//!              |          |          |
//!              +----------+----------+--> UNBOUND -> END   (error edge)
//! ```
//!
//! Binding leases one session from the [`SessionPool`], writes the tenant
//! into its slot, and hands the same session to downstream handlers as a
//! [`TenantSession`] request extension. Unbinding clears the slot, ends the
//! transaction, returns the session, and clears the context cell. It is
//! owned by an [`UnbindGuard`] so it also runs when the downstream future
//! panics or the request is cancelled.

use std::fmt;
use std::future::Future;
use std::panic::{resume_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::http::Request;
use axum::response::{IntoResponse, Response};
use futures_util::FutureExt;
use tenant_rls_core::{Extraction, Principal, RequestContext, TenantExtractor, TenantId};
use tower::{Layer, Service};
use tracing::{debug, error, info_span, warn, Instrument};

use super::binder::SessionBinder;
use super::cell::{TenantCell, TenantSnapshot};
use super::error::TenancyError;
use super::session::{Completion, SessionPool, TenantSession};

/// Coordinator state machine phases, used as a structured log field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Start,
    Extracted,
    Bound,
    Downstream,
    Unbound,
    End,
}

impl Phase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Extracted => "extracted",
            Self::Bound => "bound",
            Self::Downstream => "downstream",
            Self::Unbound => "unbound",
            Self::End => "end",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// TenantBindingLayer
// ---------------------------------------------------------------------------

/// Shared, immutable collaborators of the coordinator.
struct Coordinator<P> {
    pool: Arc<P>,
    binder: SessionBinder,
    extractor: TenantExtractor,
    node_id: String,
}

/// Tower layer that wraps the downstream pipeline with tenant binding.
pub struct TenantBindingLayer<P> {
    coordinator: Arc<Coordinator<P>>,
}

impl<P> Clone for TenantBindingLayer<P> {
    fn clone(&self) -> Self {
        Self {
            coordinator: Arc::clone(&self.coordinator),
        }
    }
}

impl<P: SessionPool> TenantBindingLayer<P> {
    #[must_use]
    pub fn new(
        pool: Arc<P>,
        extractor: TenantExtractor,
        binder: SessionBinder,
        node_id: impl Into<String>,
    ) -> Self {
        Self {
            coordinator: Arc::new(Coordinator {
                pool,
                binder,
                extractor,
                node_id: node_id.into(),
            }),
        }
    }
}

impl<S, P> Layer<S> for TenantBindingLayer<P> {
    type Service = TenantBindingService<S, P>;

    fn layer(&self, inner: S) -> Self::Service {
        TenantBindingService {
            inner,
            coordinator: Arc::clone(&self.coordinator),
        }
    }
}

// ---------------------------------------------------------------------------
// TenantBindingService
// ---------------------------------------------------------------------------

/// Service produced by [`TenantBindingLayer`].
pub struct TenantBindingService<S, P> {
    inner: S,
    coordinator: Arc<Coordinator<P>>,
}

impl<S: Clone, P> Clone for TenantBindingService<S, P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            coordinator: Arc::clone(&self.coordinator),
        }
    }
}

impl<S, P, B> Service<Request<B>> for TenantBindingService<S, P>
where
    S: Service<Request<B>, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    B: Send + 'static,
    P: SessionPool,
{
    type Response = Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Response, S::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        // Use the instance that was driven to readiness; leave a fresh clone behind.
        let clone = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, clone);
        let coordinator = Arc::clone(&self.coordinator);
        Box::pin(coordinator.handle(req, inner))
    }
}

impl<P: SessionPool> Coordinator<P> {
    async fn handle<S, B>(self: Arc<Self>, mut req: Request<B>, mut inner: S) -> Result<Response, S::Error>
    where
        S: Service<Request<B>, Response = Response> + Send + 'static,
        S::Future: Send + 'static,
        B: Send + 'static,
    {
        let trace_id = request_id(&req);
        let principal = req.extensions().get::<Principal>().cloned();
        let span = info_span!(
            "tenant_binding",
            trace_id = %trace_id,
            tenant = tracing::field::Empty,
        );

        async move {
            debug!(phase = %Phase::Start, "request entered tenant binding");
            let extraction = self.extractor.classify(principal.as_ref());
            debug!(phase = %Phase::Extracted, "principal inspected");

            match extraction {
                Extraction::Tenant(tenant) => {
                    tracing::Span::current().record("tenant", tenant.as_str());
                    self.run_bound(tenant, principal, trace_id, req, inner).await
                }
                Extraction::MissingClaim => {
                    warn!(
                        claim = %self.extractor.claim(),
                        principal = principal.as_ref().map_or("", |p| p.id.as_str()),
                        "authenticated request without tenant claim rejected"
                    );
                    record_outcome("missing_claim");
                    debug!(phase = %Phase::Unbound, "nothing bound");
                    debug!(phase = %Phase::End, "request finished");
                    Ok(TenancyError::MissingTenantClaim {
                        claim: self.extractor.claim().to_string(),
                    }
                    .into_response())
                }
                Extraction::Anonymous => {
                    req.extensions_mut()
                        .insert(self.context(None, principal, trace_id));
                    debug!(phase = %Phase::Downstream, "public request continues unbound");
                    let result = TenantCell::scope(TenantSnapshot::empty(), inner.call(req)).await;
                    record_outcome("public");
                    debug!(phase = %Phase::Unbound, "nothing bound");
                    debug!(phase = %Phase::End, "request finished");
                    result
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run_bound<S, B>(
        self: Arc<Self>,
        tenant: TenantId,
        principal: Option<Principal>,
        trace_id: String,
        mut req: Request<B>,
        mut inner: S,
    ) -> Result<Response, S::Error>
    where
        S: Service<Request<B>, Response = Response> + Send + 'static,
        S::Future: Send + 'static,
        B: Send + 'static,
    {
        let mut session = match self.pool.acquire().await {
            Ok(session) => session,
            Err(err) => {
                error!(error = %err, "no storage session for tenant request; aborting");
                record_outcome("bind_failure");
                return Ok(TenancyError::SessionUnavailable(err).into_response());
            }
        };

        if let Err(err) = self.binder.bind(&tenant, &mut session).await {
            error!(error = %err, "tenant bind failed; aborting before downstream");
            record_outcome("bind_failure");
            if let Err(release_err) = self.pool.release(session, Completion::Rollback).await {
                warn!(error = %release_err, "releasing session after bind failure failed");
            }
            return Ok(err.into_response());
        }

        let pinned = TenantSession::new(session, tenant.clone());
        let mut unbind = UnbindGuard {
            pool: Arc::clone(&self.pool),
            binder: self.binder.clone(),
            session: pinned.clone(),
            done: false,
        };
        debug!(phase = %Phase::Bound, "tenant bound to session");

        req.extensions_mut().insert(pinned);
        req.extensions_mut()
            .insert(self.context(Some(tenant.clone()), principal, trace_id));

        TenantCell::scope(TenantSnapshot::of(tenant), async move {
            debug!(phase = %Phase::Downstream, "running downstream");
            let result = match AssertUnwindSafe(inner.call(req)).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => {
                    if let Err(err) = unbind.release(Completion::Rollback).await {
                        warn!(error = %err, "rollback after handler panic failed");
                    }
                    TenantCell::clear();
                    record_outcome("panic");
                    debug!(phase = %Phase::Unbound, "tenant unbound after panic");
                    resume_unwind(panic);
                }
            };
            let completion = match &result {
                Ok(response) if !response.status().is_server_error() => Completion::Commit,
                _ => Completion::Rollback,
            };
            let released = unbind.release(completion).await;
            TenantCell::clear();
            debug!(phase = %Phase::Unbound, ?completion, "tenant unbound");
            debug!(phase = %Phase::End, "request finished");
            match released {
                Ok(()) => {
                    record_outcome("bound");
                    result
                }
                Err(err) if completion == Completion::Commit => {
                    error!(error = %err, "commit failed; replacing successful response");
                    record_outcome("commit_failure");
                    Ok(TenancyError::CommitFailure(err).into_response())
                }
                Err(err) => {
                    warn!(error = %err, "rollback failed after unsuccessful request");
                    record_outcome("bound");
                    result
                }
            }
        })
        .await
    }

    fn context(
        &self,
        tenant_id: Option<TenantId>,
        principal: Option<Principal>,
        trace_id: String,
    ) -> RequestContext {
        RequestContext {
            node_id: self.node_id.clone(),
            tenant_id,
            principal,
            trace_id,
        }
    }
}

// ---------------------------------------------------------------------------
// UnbindGuard
// ---------------------------------------------------------------------------

/// Owns the unbind step for one bound request.
///
/// `release` runs it inline, on normal completion and after a caught panic.
/// Only when the request future itself is dropped (cancellation, timeout)
/// does `Drop` spawn the same step onto the runtime with a rollback, so the
/// session still has its slot cleared before it returns to the pool.
struct UnbindGuard<P: SessionPool> {
    pool: Arc<P>,
    binder: SessionBinder,
    session: TenantSession<P::Session>,
    done: bool,
}

impl<P: SessionPool> UnbindGuard<P> {
    async fn release(&mut self, completion: Completion) -> anyhow::Result<()> {
        let released = release_session(&*self.pool, &self.binder, &self.session, completion).await;
        self.done = true;
        released
    }
}

impl<P: SessionPool> Drop for UnbindGuard<P> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        warn!(
            tenant = %self.session.tenant(),
            "request cancelled before unbind; releasing session in background"
        );
        let pool = Arc::clone(&self.pool);
        let binder = self.binder.clone();
        let session = self.session.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) =
                        release_session(&*pool, &binder, &session, Completion::Rollback).await
                    {
                        warn!(error = %err, "background release of cancelled session failed");
                    }
                });
            }
            Err(_) => {
                // The session is dropped with its last handle; the backend
                // rolls back the transaction, which resets the slot.
                warn!("no runtime available for background unbind");
            }
        }
    }
}

/// Clears the slot (best effort) and ends the transaction. Only the
/// transaction outcome is reported back.
async fn release_session<P: SessionPool>(
    pool: &P,
    binder: &SessionBinder,
    session: &TenantSession<P::Session>,
    completion: Completion,
) -> anyhow::Result<()> {
    let Some(mut leased) = session.take().await else {
        return Ok(());
    };
    binder.clear(&mut leased).await;
    pool.release(leased, completion).await
}

fn request_id<B>(req: &Request<B>) -> String {
    req.headers()
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .map_or_else(|| uuid::Uuid::new_v4().to_string(), str::to_string)
}

fn record_outcome(outcome: &'static str) {
    metrics::counter!("tenant_binding_requests_total", "outcome" => outcome).increment(1);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::StatusCode;
    use serde_json::Map;
    use tower::ServiceExt;

    use super::*;
    use crate::storage::memory::{MemoryDatabase, MemoryPool, MemorySession};

    const PARAM: &str = "app.current_tenant";

    fn layer(pool: &Arc<MemoryPool>) -> TenantBindingLayer<MemoryPool> {
        TenantBindingLayer::new(
            Arc::clone(pool),
            TenantExtractor::default(),
            SessionBinder::new(PARAM),
            "node-test",
        )
    }

    fn pool(size: usize) -> Arc<MemoryPool> {
        Arc::new(MemoryPool::new(Arc::new(MemoryDatabase::new(PARAM)), size))
    }

    fn request_for(principal: Option<Principal>) -> Request<Body> {
        let mut req = Request::builder().uri("/").body(Body::empty()).unwrap();
        if let Some(principal) = principal {
            req.extensions_mut().insert(principal);
        }
        req
    }

    fn tenant_principal(id: &str) -> Principal {
        Principal::authenticated("user", Map::new()).with_claim("tenant_id", id)
    }

    /// Downstream that reports the cell value and the pinned session's slot.
    #[derive(Clone)]
    struct ReportBinding;

    impl Service<Request<Body>> for ReportBinding {
        type Response = Response;
        type Error = Infallible;
        type Future = Pin<Box<dyn Future<Output = Result<Response, Infallible>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, req: Request<Body>) -> Self::Future {
            Box::pin(async move {
                let cell = TenantCell::get().map(TenantId::into_inner);
                let slot = match req.extensions().get::<TenantSession<MemorySession>>() {
                    Some(session) => {
                        let guard = session.lock().await.unwrap();
                        let slot = guard.setting(PARAM).map(str::to_string);
                        slot
                    }
                    None => None,
                };
                let body = format!("{}|{}", cell.unwrap_or_default(), slot.unwrap_or_default());
                Ok(body.into_response())
            })
        }
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn bound_request_sees_tenant_in_cell_and_session() {
        let pool = pool(1);
        let svc = layer(&pool).layer(ReportBinding);
        let response = svc
            .oneshot(request_for(Some(tenant_principal("acme"))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "acme|acme");
        assert_eq!(TenantCell::get(), None);
        assert_eq!(pool.idle_count(), 1);
        assert_eq!(pool.peek_idle_setting(PARAM), None);
    }

    #[tokio::test]
    async fn missing_claim_is_rejected_without_binding() {
        let pool = pool(1);
        let svc = layer(&pool).layer(ReportBinding);
        let principal = Principal::authenticated("user", Map::new());
        let response = svc.oneshot(request_for(Some(principal))).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(pool.database().set_config_calls(), 0);
        assert_eq!(pool.acquired_total(), 0);
    }

    #[tokio::test]
    async fn anonymous_request_runs_unbound() {
        let pool = pool(1);
        let svc = layer(&pool).layer(ReportBinding);
        let response = svc.oneshot(request_for(None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "|");
        assert_eq!(pool.acquired_total(), 0);
    }

    #[tokio::test]
    async fn bind_failure_aborts_before_downstream() {
        let pool = pool(1);
        pool.database().fail_set_config(true);
        let reached = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = Arc::clone(&reached);
        let downstream = tower::service_fn(move |_req: Request<Body>| {
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
            async { Ok::<_, Infallible>(StatusCode::OK.into_response()) }
        });
        let svc = layer(&pool).layer(downstream);
        let response = svc
            .oneshot(request_for(Some(tenant_principal("acme"))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!reached.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn server_error_rolls_back_and_still_unbinds() {
        let pool = pool(1);
        let downstream = tower::service_fn(|_req: Request<Body>| async {
            Ok::<_, Infallible>(StatusCode::INTERNAL_SERVER_ERROR.into_response())
        });
        let svc = layer(&pool).layer(downstream);
        let response = svc
            .oneshot(request_for(Some(tenant_principal("acme"))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(pool.rollbacks(), 1);
        assert_eq!(pool.commits(), 0);
        assert_eq!(pool.peek_idle_setting(PARAM), None);
    }

    #[tokio::test]
    async fn downstream_error_propagates_unchanged() {
        let pool = pool(1);
        let downstream = tower::service_fn(|_req: Request<Body>| async {
            Err::<Response, _>("business rule violated")
        });
        let svc = layer(&pool).layer(downstream);
        let err = svc
            .oneshot(request_for(Some(tenant_principal("acme"))))
            .await
            .unwrap_err();
        assert_eq!(err, "business rule violated");
        assert_eq!(pool.rollbacks(), 1);
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn cancelled_request_still_releases_session() {
        let pool = pool(1);
        let downstream = tower::service_fn(|_req: Request<Body>| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, Infallible>(StatusCode::OK.into_response())
        });
        let svc = layer(&pool).layer(downstream);
        let outcome = tokio::time::timeout(
            Duration::from_millis(20),
            svc.oneshot(request_for(Some(tenant_principal("acme")))),
        )
        .await;
        assert!(outcome.is_err(), "request should have been cancelled");

        for _ in 0..100 {
            if pool.idle_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(pool.idle_count(), 1);
        assert_eq!(pool.rollbacks(), 1);
        assert_eq!(pool.peek_idle_setting(PARAM), None);
    }

    /// Memory pool whose commits always fail after rolling back.
    struct FailingCommitPool {
        inner: MemoryPool,
    }

    #[async_trait::async_trait]
    impl SessionPool for FailingCommitPool {
        type Session = MemorySession;

        async fn acquire(&self) -> anyhow::Result<MemorySession> {
            self.inner.acquire().await
        }

        async fn release(
            &self,
            session: MemorySession,
            completion: Completion,
        ) -> anyhow::Result<()> {
            match completion {
                Completion::Commit => {
                    self.inner.release(session, Completion::Rollback).await?;
                    anyhow::bail!("could not serialize access due to concurrent update")
                }
                Completion::Rollback => self.inner.release(session, completion).await,
            }
        }

        fn backend_name(&self) -> &'static str {
            "failing-commit"
        }
    }

    #[tokio::test]
    async fn failed_commit_replaces_successful_response() {
        let pool = Arc::new(FailingCommitPool {
            inner: MemoryPool::new(Arc::new(MemoryDatabase::new(PARAM)), 1),
        });
        let downstream = tower::service_fn(|_req: Request<Body>| async {
            Ok::<_, Infallible>("written".into_response())
        });
        let svc = TenantBindingLayer::new(
            Arc::clone(&pool),
            TenantExtractor::default(),
            SessionBinder::new(PARAM),
            "node-test",
        )
        .layer(downstream);
        let response = svc
            .oneshot(request_for(Some(tenant_principal("acme"))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body_text(response).await.contains("Changes could not be saved"));
        assert_eq!(pool.inner.commits(), 0);
        assert_eq!(pool.inner.idle_count(), 1);
        assert_eq!(pool.inner.peek_idle_setting(PARAM), None);
    }

    #[tokio::test]
    async fn clear_failure_keeps_response_and_releases_session() {
        let pool = pool(1);
        let db = Arc::clone(pool.database());
        let downstream = tower::service_fn(move |_req: Request<Body>| {
            let db = Arc::clone(&db);
            async move {
                db.fail_set_config(true);
                Ok::<_, Infallible>("written".into_response())
            }
        });
        let svc = layer(&pool).layer(downstream);
        let response = svc
            .oneshot(request_for(Some(tenant_principal("acme"))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "written");
        assert_eq!(pool.database().set_config_calls(), 2);
        assert_eq!(pool.commits(), 1);
        assert_eq!(pool.idle_count(), 1);
        assert_eq!(pool.peek_idle_setting(PARAM), None);
    }

    async fn explode(_req: Request<Body>) -> Result<Response, Infallible> {
        panic!("handler exploded")
    }

    #[tokio::test]
    async fn panicking_handler_is_unbound_before_the_panic_escapes() {
        let pool = pool(1);
        let svc = layer(&pool).layer(tower::service_fn(explode));
        let joined = tokio::spawn(svc.oneshot(request_for(Some(tenant_principal("acme"))))).await;
        assert!(joined.unwrap_err().is_panic());
        assert_eq!(pool.rollbacks(), 1);
        assert_eq!(pool.idle_count(), 1);
        assert_eq!(pool.peek_idle_setting(PARAM), None);
    }

    #[test]
    fn phase_names() {
        let phases = [
            Phase::Start,
            Phase::Extracted,
            Phase::Bound,
            Phase::Downstream,
            Phase::Unbound,
            Phase::End,
        ];
        let names: Vec<_> = phases.iter().map(ToString::to_string).collect();
        assert_eq!(
            names,
            ["start", "extracted", "bound", "downstream", "unbound", "end"]
        );
    }
}
