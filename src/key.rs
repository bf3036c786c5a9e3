//! Mapping request contexts to limiter keys.
//!
//! A [`KeyResolver`] turns whatever the host calls a request into the string that
//! identifies whose budget is charged (a user id, an API key, a client address). A
//! resolver that fails, or resolves to an empty key, does not fail the request: the
//! engine charges it to the shared [`ANONYMOUS_KEY`] bucket and records an audit event.
//!
//! Keys from untrusted input can be screened with a [`KeyPolicy`] by wrapping the
//! resolver in a [`PolicyCheckedResolver`]. The policy is fixed at construction.

use std::fmt;
use std::sync::Arc;

use crate::error::KeyResolutionError;

/// Key charged when resolution fails.
pub const ANONYMOUS_KEY: &str = "anonymous";

/// Resolves the limiter key for a request context `C`.
pub trait KeyResolver<C: ?Sized>: Send + Sync {
    fn resolve(&self, ctx: &C) -> Result<String, KeyResolutionError>;
}

impl<C: ?Sized, R: KeyResolver<C> + ?Sized> KeyResolver<C> for Arc<R> {
    fn resolve(&self, ctx: &C) -> Result<String, KeyResolutionError> {
        (**self).resolve(ctx)
    }
}

/// Resolver backed by a closure.
///
/// ```
/// use quotaguard::key::{FnKeyResolver, KeyResolver};
/// use quotaguard::KeyResolutionError;
///
/// struct Request { user: Option<String> }
///
/// let by_user = FnKeyResolver::new(|req: &Request| {
///     req.user.clone().ok_or(KeyResolutionError::Missing)
/// });
/// let req = Request { user: Some("alice".into()) };
/// assert_eq!(by_user.resolve(&req).unwrap(), "alice");
/// ```
#[derive(Clone)]
pub struct FnKeyResolver<F> {
    f: F,
}

impl<F> FnKeyResolver<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> fmt::Debug for FnKeyResolver<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnKeyResolver").finish_non_exhaustive()
    }
}

impl<C, F> KeyResolver<C> for FnKeyResolver<F>
where
    C: ?Sized,
    F: Fn(&C) -> Result<String, KeyResolutionError> + Send + Sync,
{
    fn resolve(&self, ctx: &C) -> Result<String, KeyResolutionError> {
        (self.f)(ctx)
    }
}

/// Charges every request to one key, making the limiter global.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticKeyResolver {
    key: String,
}

impl StaticKeyResolver {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

impl<C: ?Sized> KeyResolver<C> for StaticKeyResolver {
    fn resolve(&self, _ctx: &C) -> Result<String, KeyResolutionError> {
        Ok(self.key.clone())
    }
}

/// Immutable screening rules for resolved keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPolicy {
    max_len: usize,
    denied_fragments: Arc<[String]>,
}

impl KeyPolicy {
    pub const DEFAULT_MAX_LEN: usize = 256;

    /// Policy rejecting keys longer than `max_len` bytes or containing any of
    /// `denied_fragments`.
    pub fn new<I, S>(max_len: usize, denied_fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            max_len,
            denied_fragments: denied_fragments.into_iter().map(Into::into).collect(),
        }
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    pub fn denied_fragments(&self) -> &[String] {
        &self.denied_fragments
    }

    /// Validate `key`. Control characters are always rejected.
    pub fn check(&self, key: &str) -> Result<(), KeyResolutionError> {
        if key.len() > self.max_len {
            return Err(KeyResolutionError::Rejected(format!(
                "key is {} bytes, limit is {}",
                key.len(),
                self.max_len
            )));
        }
        if key.chars().any(char::is_control) {
            return Err(KeyResolutionError::Rejected("key contains control characters".into()));
        }
        if let Some(fragment) = self.denied_fragments.iter().find(|f| key.contains(f.as_str())) {
            return Err(KeyResolutionError::Rejected(format!("key contains `{fragment}`")));
        }
        Ok(())
    }
}

impl Default for KeyPolicy {
    /// 256 bytes, no glob wildcards.
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_LEN, ["*", "?", "[", "]"])
    }
}

/// Applies a [`KeyPolicy`] to another resolver's output.
#[derive(Debug, Clone)]
pub struct PolicyCheckedResolver<R> {
    inner: R,
    policy: KeyPolicy,
}

impl<R> PolicyCheckedResolver<R> {
    pub fn new(inner: R, policy: KeyPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &KeyPolicy {
        &self.policy
    }
}

impl<C, R> KeyResolver<C> for PolicyCheckedResolver<R>
where
    C: ?Sized,
    R: KeyResolver<C>,
{
    fn resolve(&self, ctx: &C) -> Result<String, KeyResolutionError> {
        let key = self.inner.resolve(ctx)?;
        self.policy.check(&key)?;
        Ok(key)
    }
}
