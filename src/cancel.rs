// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.

//! A single cancellation token threaded through planner, engine, and
//! backend. There are no back-references: cancelling the root token
//! cancels every derived child, never the reverse.

use tokio_util::sync::CancellationToken as Inner;

/// Thin wrapper over [`tokio_util::sync::CancellationToken`] so the rest of
/// the crate depends on our own name rather than the underlying crate.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Inner);

impl CancellationToken {
    pub fn new() -> Self {
        CancellationToken(Inner::new())
    }

    pub fn child(&self) -> CancellationToken {
        CancellationToken(self.0.child_token())
    }

    pub fn cancel(&self) {
        self.0.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.0.cancelled().await
    }

    /// Install a handler that cancels this token on SIGINT (and SIGTERM on
    /// unix), per the "first OS interrupt" rule in §5.
    pub fn cancel_on_signal(&self) {
        let token = self.clone();
        tokio::spawn(async move {
            let ctrl_c = tokio::signal::ctrl_c();
            #[cfg(unix)]
            {
                let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(s) => s,
                    Err(_) => {
                        let _ = ctrl_c.await;
                        token.cancel();
                        return;
                    }
                };
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = term.recv() => {}
                }
            }
            #[cfg(not(unix))]
            {
                let _ = ctrl_c.await;
            }
            token.cancel();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn child_is_cancelled_by_parent() {
        let parent = CancellationToken::new();
        let child = parent.child();
        assert!(!child.is_cancelled());
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn cancelling_child_does_not_cancel_parent() {
        let parent = CancellationToken::new();
        let child = parent.child();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }
}
