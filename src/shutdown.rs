//! Cooperative cancellation, and translation of OS signals into it.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::watch;

use crate::BoxFuture;

/// A cloneable cancellation token.
///
/// Every clone observes the same state: once any clone calls [`Shutdown::trigger`],
/// all pending and future [`Shutdown::signalled`] futures resolve. Triggering is
/// permanent and idempotent.
#[derive(Clone)]
pub struct Shutdown(Arc<watch::Sender<bool>>);

impl fmt::Debug for Shutdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Shutdown")
            .field(&self.is_triggered())
            .finish()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    /// A token which has not been triggered.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self(Arc::new(tx))
    }

    /// Request shutdown. Returns `true` only for the call which flipped the token.
    pub fn trigger(&self) -> bool {
        let flipped = self.0.send_if_modified(|triggered| {
            if *triggered {
                false
            } else {
                *triggered = true;
                true
            }
        });
        if flipped {
            tracing::trace!("shutdown triggered");
        }
        flipped
    }

    /// Whether shutdown has been requested.
    pub fn is_triggered(&self) -> bool {
        *self.0.borrow()
    }

    /// A future which resolves once shutdown has been requested.
    ///
    /// The future also resolves if every clone of this token is dropped, since
    /// nothing can trigger it any more.
    pub fn signalled(&self) -> Signalled {
        let mut rx = self.0.subscribe();
        Signalled(Box::pin(async move {
            let _ = rx.wait_for(|triggered| *triggered).await;
        }))
    }
}

/// Future returned by [`Shutdown::signalled`].
#[pin_project::pin_project]
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Signalled(#[pin] BoxFuture<'static, ()>);

impl fmt::Debug for Signalled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signalled").finish()
    }
}

impl Future for Signalled {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.project().0.poll(cx)
    }
}

/// Resolves when the process receives an interrupt (ctrl-c / `SIGINT`) or, on unix,
/// a terminate (`SIGTERM`) request.
///
/// If a signal handler cannot be installed, that signal is ignored and a warning is logged.
pub async fn signal() {
    let interrupt = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::warn!(%error, "unable to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(error) => {
                tracing::warn!(%error, "unable to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = interrupt => tracing::info!("received interrupt"),
        () = terminate => tracing::info!("received terminate"),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn trigger_wakes_every_clone() {
        let shutdown = Shutdown::new();
        let a = shutdown.signalled();
        let b = shutdown.clone().signalled();

        assert!(!shutdown.is_triggered());
        assert!(shutdown.trigger());
        assert!(!shutdown.clone().trigger());
        assert!(shutdown.is_triggered());

        tokio::time::timeout(Duration::from_secs(1), async {
            a.await;
            b.await;
        })
        .await
        .expect("signalled futures resolve after trigger");

        // Futures created after the trigger resolve immediately.
        tokio::time::timeout(Duration::from_secs(1), shutdown.signalled())
            .await
            .expect("late futures resolve");
    }

    #[tokio::test]
    async fn untriggered_token_stays_pending() {
        let shutdown = Shutdown::new();
        let pending = tokio::time::timeout(Duration::from_millis(20), shutdown.signalled()).await;
        assert!(pending.is_err());
    }

    #[tokio::test]
    async fn dropping_every_token_releases_waiters() {
        let shutdown = Shutdown::new();
        let signalled = shutdown.signalled();
        drop(shutdown);

        tokio::time::timeout(Duration::from_secs(1), signalled)
            .await
            .expect("waiters resolve once no token remains");
    }
}
