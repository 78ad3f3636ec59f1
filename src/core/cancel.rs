/// Runs a callback when dropped while still armed.
///
/// The pipeline arms one per request; when the client disconnects, axum drops
/// the handler future (or the response stream) and the callback fires. Paths
/// that finish normally call [`CancelGuard::disarm`].
pub struct CancelGuard {
    on_cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl CancelGuard {
    pub fn new(on_cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            on_cancel: Some(Box::new(on_cancel)),
        }
    }

    pub fn disarm(&mut self) {
        self.on_cancel = None;
    }

    pub fn is_armed(&self) -> bool {
        self.on_cancel.is_some()
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if let Some(on_cancel) = self.on_cancel.take() {
            on_cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_fires_on_drop_when_armed() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let guard = CancelGuard::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(guard.is_armed());
        drop(guard);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_disarmed_guard_is_silent() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let mut guard = CancelGuard::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        guard.disarm();
        drop(guard);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
