//! Lifecycle hooks
//!
//! Typed publish/subscribe surface for session lifecycle events (§4.9,
//! §9). Handlers are synchronous, sorted by descending priority, and run
//! sequentially; a handler error is captured, never propagated past the
//! dispatcher.

/// The six lifecycle events a session passes through.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    BeforeSessionStart { session_id: String },
    AfterSessionStart { session_id: String },
    BeforeSessionEnd { session_id: String, reason: String },
    AfterSessionEnd { session_id: String, reason: String },
    QueueJoined { client_id: String },
    QueueLeft { client_id: String },
}

type Handler = Box<dyn Fn(&LifecycleEvent) -> Result<(), String> + Send + Sync>;

struct Registration {
    priority: i32,
    handler: Handler,
}

/// Registry of lifecycle handlers, dispatched in descending-priority order.
#[derive(Default)]
pub struct HookRegistry {
    handlers: Vec<Registration>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Higher `priority` values run first.
    pub fn register<F>(&mut self, priority: i32, handler: F)
    where
        F: Fn(&LifecycleEvent) -> Result<(), String> + Send + Sync + 'static,
    {
        self.handlers.push(Registration {
            priority,
            handler: Box::new(handler),
        });
        self.handlers.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    /// Run every handler for `event` in priority order. Errors are
    /// collected rather than short-circuiting the dispatch.
    pub fn dispatch(&self, event: &LifecycleEvent) -> Vec<String> {
        let mut errors = Vec::new();
        for reg in &self.handlers {
            if let Err(e) = (reg.handler)(event) {
                errors.push(e);
            }
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn handlers_run_in_priority_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut hooks = HookRegistry::new();

        let o1 = order.clone();
        hooks.register(1, move |_| {
            o1.lock().unwrap().push(1);
            Ok(())
        });
        let o2 = order.clone();
        hooks.register(10, move |_| {
            o2.lock().unwrap().push(10);
            Ok(())
        });
        let o3 = order.clone();
        hooks.register(5, move |_| {
            o3.lock().unwrap().push(5);
            Ok(())
        });

        hooks.dispatch(&LifecycleEvent::QueueJoined {
            client_id: "c1".into(),
        });
        assert_eq!(*order.lock().unwrap(), vec![10, 5, 1]);
    }

    #[test]
    fn handler_errors_are_captured_not_thrown() {
        let mut hooks = HookRegistry::new();
        hooks.register(0, |_| Err("boom".to_string()));
        hooks.register(0, |_| Ok(()));

        let errors = hooks.dispatch(&LifecycleEvent::BeforeSessionStart {
            session_id: "s1".into(),
        });
        assert_eq!(errors, vec!["boom".to_string()]);
    }

    #[test]
    fn dispatch_with_no_handlers_returns_empty() {
        let hooks = HookRegistry::new();
        let errors = hooks.dispatch(&LifecycleEvent::QueueLeft {
            client_id: "c1".into(),
        });
        assert!(errors.is_empty());
    }
}
