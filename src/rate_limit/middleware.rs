use crate::error::ResilienceError;
use crate::rate_limit::{BucketStore, InMemoryBucketStore, RateLimitProfile, RateLimiter};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// A layer that checks a [`RateLimiter`] before calling the wrapped service.
///
/// `key_fn` derives the rate-limit key from the request (see
/// [`client_identifier`](crate::rate_limit::client_identifier)).
#[derive(Clone, Debug)]
pub struct RateLimitLayer<K, St = InMemoryBucketStore> {
    limiter: RateLimiter<St>,
    profile: RateLimitProfile,
    key_fn: K,
}

impl<K, St> RateLimitLayer<K, St> {
    pub fn new(limiter: RateLimiter<St>, profile: RateLimitProfile, key_fn: K) -> Self {
        Self { limiter, profile, key_fn }
    }
}

impl<S, K, St> Layer<S> for RateLimitLayer<K, St>
where
    K: Clone,
{
    type Service = RateLimitService<S, K, St>;

    fn layer(&self, service: S) -> Self::Service {
        RateLimitService {
            inner: service,
            limiter: self.limiter.clone(),
            profile: self.profile.clone(),
            key_fn: self.key_fn.clone(),
        }
    }
}

/// Middleware service that enforces rate limits.
#[derive(Clone, Debug)]
pub struct RateLimitService<S, K, St = InMemoryBucketStore> {
    inner: S,
    limiter: RateLimiter<St>,
    profile: RateLimitProfile,
    key_fn: K,
}

impl<S, K, St, Req> Service<Req> for RateLimitService<S, K, St>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    K: Fn(&Req) -> String,
    St: BucketStore + 'static,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = ResilienceError<S::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(ResilienceError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let key = (self.key_fn)(&req);
        let limiter = self.limiter.clone();
        let profile = self.profile.clone();
        // Take the service that was driven to readiness; leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            limiter.rate_limit(&key, &profile).await?;
            inner.call(req).await.map_err(ResilienceError::Inner)
        })
    }
}
