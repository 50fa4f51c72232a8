//! Typed watched fields.
//!
//! [`Watched`] stores one piece of entity state and lets any number of tasks
//! wait until it satisfies a predicate. It replaces polling a property for a
//! change: `connected.wait_until(|c| *c, timeout, &cancel).await`.

use std::fmt;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::entity::OperationKind;
use crate::error::{Error, Result};

/// A value that can be observed for changes.
pub struct Watched<T> {
    tx: watch::Sender<T>,
}

impl<T> Watched<T>
where
    T: Clone + PartialEq + Send + Sync,
{
    /// Create a field holding `initial`.
    pub fn new(initial: T) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    /// Current value.
    pub fn get(&self) -> T {
        self.tx.borrow().clone()
    }

    /// Store `value`. Returns `true` when the value changed.
    ///
    /// Receivers are only woken on an actual change.
    pub fn set(&self, value: T) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        })
    }

    /// Apply `f` to the value in place and return what it returned.
    ///
    /// Receivers are woken when `f` returns `true`.
    pub fn update(&self, f: impl FnOnce(&mut T) -> bool) -> bool {
        self.tx.send_if_modified(f)
    }

    /// Receiver for change notifications.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.tx.subscribe()
    }

    /// Wait until the value satisfies `predicate`.
    ///
    /// Returns immediately when it already does.
    pub async fn wait_until<F>(
        &self,
        predicate: F,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<T>
    where
        F: FnMut(&T) -> bool,
    {
        wait_until(self.subscribe(), predicate, timeout, cancel).await
    }
}

/// Wait on a watch receiver until its value satisfies `predicate`.
pub async fn wait_until<T, F>(
    mut rx: watch::Receiver<T>,
    mut predicate: F,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<T>
where
    T: Clone,
    F: FnMut(&T) -> bool,
{
    tokio::select! {
        result = rx.wait_for(|v| predicate(v)) => match result {
            Ok(value) => Ok(value.clone()),
            // Sender gone: the owning entity was dropped.
            Err(_) => Err(Error::Cancelled),
        },
        _ = tokio::time::sleep(timeout) => Err(Error::timeout(OperationKind::Wait, timeout)),
        _ = cancel.cancelled() => Err(Error::Cancelled),
    }
}

impl<T: fmt::Debug> fmt::Debug for Watched<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Watched").field(&*self.tx.borrow()).finish()
    }
}

impl<T> Default for Watched<T>
where
    T: Clone + PartialEq + Send + Sync + Default,
{
    fn default() -> Self {
        Self::new(T::default())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_set_reports_change() {
        let field = Watched::new(false);
        assert!(field.set(true));
        assert!(!field.set(true));
        assert!(field.get());
    }

    #[test]
    fn test_update_in_place() {
        let field = Watched::new(3u32);
        assert!(field.update(|v| {
            *v += 1;
            true
        }));
        assert_eq!(field.get(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_already_true() {
        let field = Watched::new(5);
        let value = field
            .wait_until(|v| *v == 5, Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(value, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_later_change() {
        let field = Arc::new(Watched::new(false));
        let setter = Arc::clone(&field);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            setter.set(true);
        });

        let value = field
            .wait_until(|v| *v, Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap();
        assert!(value);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_timeout_and_cancel() {
        let field = Watched::new(false);
        let err = field
            .wait_until(|v| *v, Duration::from_millis(10), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = field
            .wait_until(|v| *v, Duration::from_secs(10), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
