use std::{future::Future, time::Duration};

use tokio_util::sync::CancellationToken;

/// Single trailing-debounce timer. Arming it cancels whichever timer was
/// armed before, so at most one pending fire exists at any time.
#[derive(Debug, Default)]
pub struct DebounceTimer {
    current: Option<CancellationToken>,
}

impl DebounceTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns a task that runs `fire` after `delay` unless the timer is
    /// re-armed or cancelled first. `fire` receives the timer's token; once
    /// the task is past its sleep, cancelling the token no longer stops it.
    pub fn arm<F, Fut>(&mut self, delay: Duration, fire: F) -> CancellationToken
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.cancel();

        let token = CancellationToken::new();
        let task = fire(token.clone());
        let guard = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = guard.cancelled() => {}
                _ = tokio::time::sleep(delay) => task.await,
            }
        });

        self.current = Some(token.clone());
        token
    }

    pub fn cancel(&mut self) {
        if let Some(token) = self.current.take() {
            token.cancel();
        }
    }

    /// Forgets the armed timer once it fired, unless it was superseded.
    pub fn mark_fired(&mut self, token: &CancellationToken) {
        if !token.is_cancelled() {
            self.current = None;
        }
    }

    pub fn is_armed(&self) -> bool {
        self.current
            .as_ref()
            .is_some_and(|token| !token.is_cancelled())
    }
}
