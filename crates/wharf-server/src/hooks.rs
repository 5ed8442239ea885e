//! Observer hooks around RPC dispatch.
//!
//! Three observation points: before any method, on success, on error. Hooks
//! see the method name and tool name only — they cannot mutate the message.
//! A panicking hook is caught, logged, and swallowed so observers can never
//! take a request down with them.

use std::panic::{catch_unwind, AssertUnwindSafe};

type Observer = Box<dyn Fn(&str, Option<&str>) + Send + Sync>;
type ErrorObserver = Box<dyn Fn(&str, Option<&str>, &str) + Send + Sync>;

#[derive(Default)]
pub struct CallHooks {
    before: Vec<Observer>,
    on_success: Vec<Observer>,
    on_error: Vec<ErrorObserver>,
}

impl CallHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The default hook set: structured log lines at each observation point.
    pub fn with_logging() -> Self {
        let mut hooks = Self::new();
        hooks.add_before(|method, tool| {
            tracing::debug!(method, tool, "Request received");
        });
        hooks.add_on_success(|method, tool| {
            tracing::debug!(method, tool, "Request succeeded");
        });
        hooks.add_on_error(|method, tool, error| {
            tracing::warn!(method, tool, error, "Request failed");
        });
        hooks
    }

    pub fn add_before(&mut self, hook: impl Fn(&str, Option<&str>) + Send + Sync + 'static) {
        self.before.push(Box::new(hook));
    }

    pub fn add_on_success(&mut self, hook: impl Fn(&str, Option<&str>) + Send + Sync + 'static) {
        self.on_success.push(Box::new(hook));
    }

    pub fn add_on_error(
        &mut self,
        hook: impl Fn(&str, Option<&str>, &str) + Send + Sync + 'static,
    ) {
        self.on_error.push(Box::new(hook));
    }

    pub fn fire_before(&self, method: &str, tool: Option<&str>) {
        for hook in &self.before {
            guard(|| hook(method, tool));
        }
    }

    pub fn fire_success(&self, method: &str, tool: Option<&str>) {
        for hook in &self.on_success {
            guard(|| hook(method, tool));
        }
    }

    pub fn fire_error(&self, method: &str, tool: Option<&str>, error: &str) {
        for hook in &self.on_error {
            guard(|| hook(method, tool, error));
        }
    }
}

fn guard(f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        tracing::warn!("Observer hook panicked; ignoring");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn hooks_fire_in_registration_order() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut hooks = CallHooks::new();

        let c = Arc::clone(&counter);
        hooks.add_before(move |_, _| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let c = Arc::clone(&counter);
        hooks.add_on_success(move |_, _| {
            c.fetch_add(10, Ordering::SeqCst);
        });
        let c = Arc::clone(&counter);
        hooks.add_on_error(move |_, _, _| {
            c.fetch_add(100, Ordering::SeqCst);
        });

        hooks.fire_before("call_tool", Some("echo"));
        hooks.fire_success("call_tool", Some("echo"));
        hooks.fire_error("call_tool", Some("echo"), "boom");

        assert_eq!(counter.load(Ordering::SeqCst), 111);
    }

    #[test]
    fn panicking_hook_is_swallowed() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut hooks = CallHooks::new();

        hooks.add_before(|_, _| panic!("observer bug"));
        let c = Arc::clone(&counter);
        hooks.add_before(move |_, _| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        // Must not propagate, and later hooks still run.
        hooks.fire_before("list_tools", None);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
