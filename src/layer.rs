//! Tower middleware that runs every request through a [`LimiterEngine`].
//!
//! Denied requests fail with [`AdmissionError::Rejected`] without reaching the inner
//! service. Admitted requests that carry a throttle delay wait for it first, through a
//! [`Sleeper`] so tests can observe the delay without spending it.
//!
//! ```
//! use quotaguard::layer::AdmissionLayer;
//! use quotaguard::{InMemoryStorage, LimiterConfig, LimiterEngine, StaticKeyResolver};
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tower::{service_fn, Layer, ServiceExt};
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let engine: LimiterEngine<String> = LimiterEngine::new(
//!     Arc::new(InMemoryStorage::new()),
//!     Arc::new(StaticKeyResolver::new("global")),
//! );
//! let config = LimiterConfig::token_bucket("echo", 1, Duration::from_secs(60)).unwrap();
//! let layer = AdmissionLayer::new(Arc::new(engine), config);
//!
//! let svc = layer.layer(service_fn(|req: String| async move { Ok::<_, std::io::Error>(req) }));
//! assert_eq!(svc.clone().oneshot("hi".to_owned()).await.unwrap(), "hi");
//! assert!(svc.oneshot("again".to_owned()).await.unwrap_err().is_rejected());
//! # });
//! ```

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use tower_layer::Layer;
use tower_service::Service;

use crate::config::LimiterConfig;
use crate::engine::LimiterEngine;
use crate::error::AdmissionError;

/// Waits out throttle delays.
pub trait Sleeper: Send + Sync + fmt::Debug {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Sleeps on the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Returns immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct InstantSleeper;

impl Sleeper for InstantSleeper {
    fn sleep(&self, _duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async {})
    }
}

/// Records requested delays and returns immediately. Clones share the record.
#[derive(Debug, Clone, Default)]
pub struct RecordingSleeper {
    delays: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delays(&self) -> Vec<Duration> {
        match self.delays.lock() {
            Ok(delays) => delays.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Sum of every recorded delay.
    pub fn total(&self) -> Duration {
        self.delays().into_iter().sum()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        match self.delays.lock() {
            Ok(mut delays) => delays.push(duration),
            Err(poisoned) => poisoned.into_inner().push(duration),
        }
        Box::pin(async {})
    }
}

type CostFn<Req> = dyn Fn(&Req) -> u64 + Send + Sync;

/// Applies admission control to a service.
pub struct AdmissionLayer<Req> {
    engine: Arc<LimiterEngine<Req>>,
    config: Arc<LimiterConfig>,
    sleeper: Arc<dyn Sleeper>,
    cost: Option<Arc<CostFn<Req>>>,
}

impl<Req> AdmissionLayer<Req> {
    /// Charge one permit per request against `config`, sleeping on the tokio timer.
    pub fn new(engine: Arc<LimiterEngine<Req>>, config: LimiterConfig) -> Self {
        Self { engine, config: Arc::new(config), sleeper: Arc::new(TokioSleeper), cost: None }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Charge `cost(&req)` permits per request instead of one.
    pub fn with_cost<F>(mut self, cost: F) -> Self
    where
        F: Fn(&Req) -> u64 + Send + Sync + 'static,
    {
        self.cost = Some(Arc::new(cost));
        self
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }
}

impl<Req> Clone for AdmissionLayer<Req> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            config: self.config.clone(),
            sleeper: self.sleeper.clone(),
            cost: self.cost.clone(),
        }
    }
}

impl<Req> fmt::Debug for AdmissionLayer<Req> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionLayer")
            .field("limiter", &self.config.name())
            .field("sleeper", &self.sleeper)
            .field("weighted", &self.cost.is_some())
            .finish()
    }
}

impl<S, Req> Layer<S> for AdmissionLayer<Req> {
    type Service = AdmissionService<S, Req>;

    fn layer(&self, inner: S) -> Self::Service {
        AdmissionService { inner, layer: self.clone() }
    }
}

/// Service produced by [`AdmissionLayer`].
pub struct AdmissionService<S, Req> {
    inner: S,
    layer: AdmissionLayer<Req>,
}

impl<S: Clone, Req> Clone for AdmissionService<S, Req> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), layer: self.layer.clone() }
    }
}

impl<S: fmt::Debug, Req> fmt::Debug for AdmissionService<S, Req> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionService")
            .field("inner", &self.inner)
            .field("layer", &self.layer)
            .finish()
    }
}

impl<S, Req> Service<Req> for AdmissionService<S, Req>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
    S::Error: Send + 'static,
    Req: Send + Sync + 'static,
{
    type Response = S::Response;
    type Error = AdmissionError<S::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(AdmissionError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        // Swap in a fresh clone so the driven service is the one that was polled ready.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let layer = self.layer.clone();

        Box::pin(async move {
            let permits = layer.cost.as_ref().map_or(1, |cost| cost(&req));
            let decision = layer.engine.try_acquire_permits(&req, &layer.config, permits).await;
            if !decision.is_allowed() {
                return Err(AdmissionError::Rejected(decision));
            }
            if decision.delay_ms() > 0 {
                tracing::debug!(
                    limiter = decision.limiter_name(),
                    delay_ms = decision.delay_ms(),
                    "throttling admitted request"
                );
                layer.sleeper.sleep(decision.delay()).await;
            }
            inner.call(req).await.map_err(AdmissionError::Inner)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::FnKeyResolver;
    use crate::storage::InMemoryStorage;
    use crate::throttle::{ThrottleConfig, ThrottleStrategy};
    use crate::{clock::ManualClock, config::AlgorithmKind};
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::{service_fn, ServiceExt};

    #[derive(Debug, Clone)]
    struct Req {
        user: &'static str,
        weight: u64,
    }

    fn engine(clock: ManualClock) -> Arc<LimiterEngine<Req>> {
        Arc::new(LimiterEngine::new(
            Arc::new(InMemoryStorage::with_clock(clock)),
            Arc::new(FnKeyResolver::new(|req: &Req| Ok(req.user.to_owned()))),
        ))
    }

    #[tokio::test]
    async fn rejected_requests_skip_inner_service() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let config = LimiterConfig::token_bucket("api", 2, Duration::from_secs(60)).unwrap();
        let layer = AdmissionLayer::new(engine(ManualClock::new(0)), config)
            .with_sleeper(Arc::new(InstantSleeper));
        let svc = layer.layer(service_fn(move |_req: Req| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Infallible>("ok")
            }
        }));

        let alice = Req { user: "alice", weight: 1 };
        assert_eq!(svc.clone().oneshot(alice.clone()).await.unwrap(), "ok");
        assert_eq!(svc.clone().oneshot(alice.clone()).await.unwrap(), "ok");
        let err = svc.clone().oneshot(alice).await.unwrap_err();
        match err {
            AdmissionError::Rejected(decision) => {
                assert_eq!(decision.limiter_name(), "api");
                assert_eq!(decision.remaining(), 0);
            }
            AdmissionError::Inner(never) => match never {},
        }

        // Different key, separate budget.
        assert!(svc.oneshot(Req { user: "bob", weight: 1 }).await.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn weighted_requests_charge_their_cost() {
        let config = LimiterConfig::token_bucket("upload", 10, Duration::from_secs(60)).unwrap();
        let layer = AdmissionLayer::new(engine(ManualClock::new(0)), config)
            .with_cost(|req: &Req| req.weight);
        let svc = layer.layer(service_fn(|_req: Req| async { Ok::<_, Infallible>(()) }));

        assert!(svc.clone().oneshot(Req { user: "carol", weight: 7 }).await.is_ok());
        assert!(svc.clone().oneshot(Req { user: "carol", weight: 4 }).await.unwrap_err().is_rejected());
        assert!(svc.oneshot(Req { user: "carol", weight: 3 }).await.is_ok());
    }

    #[tokio::test]
    async fn throttled_requests_sleep_before_inner_call() {
        let sleeper = RecordingSleeper::new();
        let throttle =
            ThrottleConfig::new(80, Duration::from_millis(2_000), ThrottleStrategy::Linear).unwrap();
        let config = LimiterConfig::builder("search", AlgorithmKind::SlidingWindow)
            .requests(10)
            .window(Duration::from_secs(60))
            .throttle(throttle)
            .build()
            .unwrap();
        let layer = AdmissionLayer::new(engine(ManualClock::new(0)), config)
            .with_sleeper(Arc::new(sleeper.clone()));
        let svc = layer.layer(service_fn(|_req: Req| async { Ok::<_, Infallible>(()) }));

        for _ in 0..10 {
            svc.clone().oneshot(Req { user: "dave", weight: 1 }).await.unwrap();
        }
        assert_eq!(sleeper.delays(), vec![Duration::from_secs(1), Duration::from_secs(2)]);
        assert_eq!(sleeper.total(), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn inner_errors_are_wrapped() {
        let config = LimiterConfig::sliding_window("api", 5, Duration::from_secs(1)).unwrap();
        let layer = AdmissionLayer::new(engine(ManualClock::new(0)), config);
        let svc = layer.layer(service_fn(|_req: Req| async {
            Err::<(), _>(std::io::Error::new(std::io::ErrorKind::Other, "boom"))
        }));

        let err = svc.oneshot(Req { user: "erin", weight: 1 }).await.unwrap_err();
        assert!(!err.is_rejected());
        assert_eq!(err.to_string(), "boom");
        assert!(err.decision().is_none());
    }
}
