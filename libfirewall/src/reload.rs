use std::sync::Mutex;

use futures::future::BoxFuture;
use log::{error, info};

type Reconciler = Box<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Registration point for firewall reconciliation.
///
/// When the rule set is wiped underneath us, every registered callback is
/// re-invoked to rebuild its declarative rule set from scratch. Callbacks
/// are keyed so a network can unhook itself on deletion. One failing
/// callback does not stop the others.
#[derive(Default)]
pub struct ReloadHook {
    callbacks: Mutex<Vec<(String, Reconciler)>>,
}

impl ReloadHook {
    pub fn new() -> Self {
        ReloadHook::default()
    }

    pub fn register<F>(&self, key: &str, reconcile: F)
    where
        F: Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static,
    {
        let mut callbacks = self.callbacks.lock().unwrap();
        callbacks.retain(|(k, _)| k != key);
        callbacks.push((key.to_string(), Box::new(reconcile)));
    }

    pub fn unregister(&self, key: &str) {
        self.callbacks.lock().unwrap().retain(|(k, _)| k != key);
    }

    pub fn len(&self) -> usize {
        self.callbacks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Re-run every registered reconciler, e.g. after a firewalld reload.
    pub async fn fire(&self) {
        let futures: Vec<(String, BoxFuture<'static, anyhow::Result<()>>)> = {
            let callbacks = self.callbacks.lock().unwrap();
            callbacks.iter().map(|(k, f)| (k.clone(), f())).collect()
        };
        info!("firewall reload: reconciling {} rule sets", futures.len());
        for (key, fut) in futures {
            if let Err(e) = fut.await {
                error!("firewall reload of {key} failed: {e:#}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_fire_runs_all_and_survives_failures() {
        let hook = ReloadHook::new();
        let hits = Arc::new(AtomicUsize::new(0));

        hook.register("broken", || {
            async { Err(anyhow::anyhow!("backend gone")) }.boxed()
        });
        let counter = hits.clone();
        hook.register("net-a", move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            .boxed()
        });

        hook.fire().await;
        hook.fire().await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unregister_removes_callback() {
        let hook = ReloadHook::new();
        hook.register("net-a", || async { Ok(()) }.boxed());
        assert_eq!(hook.len(), 1);
        hook.unregister("net-a");
        assert!(hook.is_empty());
    }

    #[tokio::test]
    async fn test_register_replaces_same_key() {
        let hook = ReloadHook::new();
        hook.register("net-a", || async { Ok(()) }.boxed());
        hook.register("net-a", || async { Ok(()) }.boxed());
        assert_eq!(hook.len(), 1);
    }
}
