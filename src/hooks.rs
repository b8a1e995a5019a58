//! Observer callbacks fired around rate limit checks.
//!
//! A [`HookRegistry`] lets callers observe checks without changing their
//! outcome: `before_check` fires before the algorithm runs, `after_check`
//! always fires with the resulting [`Decision`], and exactly one of
//! `on_allow`/`on_deny` fires depending on the outcome. `on_error` fires if
//! the check itself failed. Hooks run in registration order and a panicking
//! hook never takes down the caller's request path.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::decision::Decision;
use crate::error::RateLimitError;

/// Which point in the check lifecycle a hook observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookEvent {
    /// Fires before the underlying algorithm is consulted.
    BeforeCheck,
    /// Fires after the algorithm has produced a decision, allowed or denied.
    AfterCheck,
    /// Fires only when the decision allowed the request.
    OnAllow,
    /// Fires only when the decision denied the request.
    OnDeny,
    /// Fires when the check itself returned an error.
    OnError,
}

/// Context passed to a hook callback.
#[derive(Clone)]
pub struct HookContext<'a> {
    /// The key being checked.
    pub key: &'a str,
    /// The weight of the request.
    pub weight: u64,
    /// The resulting decision, if one was produced before this hook fired.
    pub decision: Option<&'a Decision>,
    /// The error that occurred, if this is an `on_error` hook.
    pub error: Option<&'a RateLimitError>,
}

type HookFn = Arc<dyn Fn(&HookContext) + Send + Sync>;

/// An ordered collection of callbacks keyed by lifecycle event.
#[derive(Clone, Default)]
pub struct HookRegistry {
    before_check: Arc<Mutex<Vec<HookFn>>>,
    after_check: Arc<Mutex<Vec<HookFn>>>,
    on_allow: Arc<Mutex<Vec<HookFn>>>,
    on_deny: Arc<Mutex<Vec<HookFn>>>,
    on_error: Arc<Mutex<Vec<HookFn>>>,
}

impl HookRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn bucket(&self, event: HookEvent) -> &Arc<Mutex<Vec<HookFn>>> {
        match event {
            HookEvent::BeforeCheck => &self.before_check,
            HookEvent::AfterCheck => &self.after_check,
            HookEvent::OnAllow => &self.on_allow,
            HookEvent::OnDeny => &self.on_deny,
            HookEvent::OnError => &self.on_error,
        }
    }

    /// Register a callback for `event`. Callbacks fire in registration order.
    pub fn register(&self, event: HookEvent, callback: impl Fn(&HookContext) + Send + Sync + 'static) {
        self.bucket(event).lock().push(Arc::new(callback));
    }

    /// Run every callback registered for `event`, in order.
    ///
    /// A callback that panics is caught and logged via `tracing::error!`; it
    /// never propagates to the caller and never stops later callbacks from
    /// running.
    pub fn run(&self, event: HookEvent, ctx: &HookContext) {
        let callbacks = self.bucket(event).lock().clone();
        for callback in callbacks {
            let result = catch_unwind(AssertUnwindSafe(|| callback(ctx)));
            if result.is_err() {
                tracing::error!(?event, key = ctx.key, "rate limit hook panicked");
            }
        }
    }

    /// Number of callbacks registered for `event`.
    pub fn count(&self, event: HookEvent) -> usize {
        self.bucket(event).lock().len()
    }
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry")
            .field("before_check", &self.count(HookEvent::BeforeCheck))
            .field("after_check", &self.count(HookEvent::AfterCheck))
            .field("on_allow", &self.count(HookEvent::OnAllow))
            .field("on_deny", &self.count(HookEvent::OnDeny))
            .field("on_error", &self.count(HookEvent::OnError))
            .finish()
    }
}
