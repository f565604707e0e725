use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::sleep::SleeperRegistry;

type LoopFuture = Pin<Box<dyn Future<Output = Result<()>> + Send + 'static>>;
type LoopFactory = Box<dyn FnOnce(LoopCtx) -> LoopFuture + Send>;

/// Per-loop context handed to each registered loop body.
///
/// A loop observes shutdown through its cancellation token (most
/// conveniently via [`interruptible_sleep`](LoopCtx::interruptible_sleep))
/// and stops by returning `Ok(())`. Returning an error is reserved for
/// genuine failures and takes the whole supervised group down.
#[derive(Clone)]
pub struct LoopCtx {
    name: String,
    cancel: CancellationToken,
    sleepers: Arc<SleeperRegistry>,
    running_tx: watch::Sender<bool>,
    stop: Arc<StopShared>,
}

impl LoopCtx {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn sleepers(&self) -> &Arc<SleeperRegistry> {
        &self.sleepers
    }

    /// Main loop only: report that side-effecting setup is done and the
    /// secondary loops may start.
    pub fn set_running(&self) {
        let _ = self.running_tx.send(true);
    }

    /// Sleep through the shared registry under `name`. Returns `true` when
    /// the loop should stop instead of doing another round.
    pub async fn interruptible_sleep(&self, waittime: Duration, name: &str) -> Result<bool> {
        tokio::select! {
            _ = self.cancel.cancelled() => Ok(true),
            res = self.sleepers.sleep(waittime, Some(name)) => {
                res?;
                Ok(self.cancel.is_cancelled())
            }
        }
    }

    /// Initiate an orderly shutdown of the whole supervised group.
    pub async fn stop(&self) {
        self.stop.stop().await;
    }
}

struct StopShared {
    sleepers: Arc<SleeperRegistry>,
    root: CancellationToken,
    grace: Duration,
    stopped: AtomicBool,
}

impl StopShared {
    /// Wake every sleeper, give loops a grace period to reach a
    /// checkpoint, then cancel them. Later calls are no-ops.
    async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("stopping: waking sleepers, then cancelling loops");
        self.sleepers.wake_all();
        tokio::time::sleep(self.grace).await;
        self.root.cancel();
    }
}

/// Handle for stopping a running [`Supervisor`] from outside its loops.
#[derive(Clone)]
pub struct StopHandle {
    stop: Arc<StopShared>,
}

impl StopHandle {
    pub async fn stop(&self) {
        self.stop.stop().await;
    }
}

struct LoopEntry {
    name: String,
    main: bool,
    factory: LoopFactory,
}

struct LoopStatus {
    name: String,
    outcome: Option<String>,
}

/// Runs a service's loops concurrently under an all-or-nothing policy.
///
/// Loops are registered explicitly by name; exactly one is the "main"
/// loop, and the others hold off until it reports running, so that
/// side-effecting setup (binding an endpoint, opening a store) completes
/// before dependents start polling. The first loop to end with an error
/// gets the whole group cancelled and that error returned from
/// [`run`](Supervisor::run).
pub struct Supervisor {
    loops: Vec<LoopEntry>,
    sleepers: Arc<SleeperRegistry>,
    stop: Arc<StopShared>,
}

impl Supervisor {
    pub fn new(sleepers: Arc<SleeperRegistry>, stop_grace: Duration) -> Self {
        Self {
            loops: Vec::new(),
            stop: Arc::new(StopShared {
                sleepers: sleepers.clone(),
                root: CancellationToken::new(),
                grace: stop_grace,
                stopped: AtomicBool::new(false),
            }),
            sleepers,
        }
    }

    pub fn register<F, Fut>(&mut self, name: &str, factory: F)
    where
        F: FnOnce(LoopCtx) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.push(name, false, factory);
    }

    pub fn register_main<F, Fut>(&mut self, name: &str, factory: F)
    where
        F: FnOnce(LoopCtx) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.push(name, true, factory);
    }

    fn push<F, Fut>(&mut self, name: &str, main: bool, factory: F)
    where
        F: FnOnce(LoopCtx) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.loops.push(LoopEntry {
            name: name.to_string(),
            main,
            factory: Box::new(move |ctx| Box::pin(factory(ctx))),
        });
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            stop: self.stop.clone(),
        }
    }

    /// Run every registered loop to completion.
    ///
    /// Returns the first non-cancellation loop failure, after cancelling
    /// the rest of the group; `Ok(())` when all loops finish cleanly.
    pub async fn run(self) -> Result<()> {
        let mains = self.loops.iter().filter(|l| l.main).count();
        if mains != 1 {
            bail!("exactly one main loop must be registered, got {mains}");
        }

        let (running_tx, running_rx) = watch::channel(false);
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();

        let count = self.loops.len();
        let mut statuses = Vec::with_capacity(count);
        for (idx, entry) in self.loops.into_iter().enumerate() {
            statuses.push(LoopStatus {
                name: entry.name.clone(),
                outcome: None,
            });

            let ctx = LoopCtx {
                name: entry.name.clone(),
                cancel: self.stop.root.child_token(),
                sleepers: self.sleepers.clone(),
                running_tx: running_tx.clone(),
                stop: self.stop.clone(),
            };
            let gate_rx = running_rx.clone();
            let gate_token = ctx.cancel.clone();
            let main = entry.main;
            let name = entry.name;
            let fut = (entry.factory)(ctx);

            debug!("launching loop '{}'", name);
            let handle = tokio::spawn(async move {
                if !main && !wait_for_running(gate_rx, &gate_token).await {
                    debug!("loop '{}' cancelled before the main loop came up", name);
                    return Ok(());
                }
                fut.await
            });

            // Watcher task: turns panics into failures and reports the
            // loop's outcome regardless of how it ended.
            let tx = done_tx.clone();
            tokio::spawn(async move {
                let res = match handle.await {
                    Ok(res) => res,
                    Err(e) if e.is_cancelled() => Ok(()),
                    Err(e) => Err(anyhow!("loop panicked: {e}")),
                };
                let _ = tx.send((idx, res));
            });
        }
        drop(done_tx);

        let mut failure: Option<anyhow::Error> = None;
        for _ in 0..count {
            let Some((idx, res)) = done_rx.recv().await else {
                break;
            };
            match res {
                Ok(()) => {
                    debug!("loop '{}' finished", statuses[idx].name);
                    statuses[idx].outcome = Some("ok".to_string());
                }
                Err(e) => {
                    statuses[idx].outcome = Some(format!("{e:#}"));
                    if failure.is_none() {
                        error!("crash in loop '{}': {e:#}", statuses[idx].name);
                        error!("loop status at crash time:");
                        for status in &statuses {
                            error!(
                                "  {}: {}",
                                status.name,
                                status.outcome.as_deref().unwrap_or("running")
                            );
                        }
                        self.stop.stop().await;
                        failure = Some(e);
                    } else {
                        warn!(
                            "loop '{}' also failed during shutdown: {e:#}",
                            statuses[idx].name
                        );
                    }
                }
            }
        }

        debug!("supervisor done; per-loop outcomes:");
        for status in &statuses {
            debug!(
                "  {}: {}",
                status.name,
                status.outcome.as_deref().unwrap_or("never finished")
            );
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Hold a secondary loop until the main loop reports running. Returns
/// `false` when cancellation wins the race.
async fn wait_for_running(mut rx: watch::Receiver<bool>, cancel: &CancellationToken) -> bool {
    loop {
        if *rx.borrow_and_update() {
            return true;
        }
        tokio::select! {
            _ = cancel.cancelled() => return false,
            changed = rx.changed() => {
                if changed.is_err() {
                    return false;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn supervisor() -> Supervisor {
        Supervisor::new(SleeperRegistry::new(), Duration::from_millis(10))
    }

    #[tokio::test]
    async fn secondary_loops_wait_for_main() {
        let mut sup = supervisor();
        let main_ready = Arc::new(AtomicBool::new(false));
        let observed = Arc::new(AtomicBool::new(false));

        let ready = main_ready.clone();
        sup.register_main("main_loop", move |ctx| async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            ready.store(true, Ordering::SeqCst);
            ctx.set_running();
            Ok(())
        });

        let ready = main_ready.clone();
        let seen = observed.clone();
        sup.register("secondary_loop", move |_ctx| async move {
            seen.store(ready.load(Ordering::SeqCst), Ordering::SeqCst);
            Ok(())
        });

        tokio::time::timeout(Duration::from_secs(5), sup.run())
            .await
            .unwrap()
            .unwrap();
        assert!(observed.load(Ordering::SeqCst), "secondary ran before main was up");
    }

    #[tokio::test]
    async fn loop_failure_takes_down_the_group() {
        let mut sup = supervisor();

        sup.register_main("main_loop", |ctx| async move {
            ctx.set_running();
            tokio::time::sleep(Duration::from_millis(20)).await;
            anyhow::bail!("boom")
        });
        let sibling_stopped = Arc::new(AtomicBool::new(false));
        let flag = sibling_stopped.clone();
        sup.register("sibling_loop", move |ctx| async move {
            ctx.cancel_token().cancelled().await;
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });

        let err = tokio::time::timeout(Duration::from_secs(5), sup.run())
            .await
            .unwrap()
            .unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert!(sibling_stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn panic_counts_as_failure() {
        let mut sup = supervisor();
        sup.register_main("main_loop", |ctx| async move {
            ctx.set_running();
            panic!("unexpected");
        });

        let err = tokio::time::timeout(Duration::from_secs(5), sup.run())
            .await
            .unwrap()
            .unwrap_err();
        assert!(err.to_string().contains("panicked"));
    }

    #[tokio::test]
    async fn stop_handle_stops_the_group_cleanly() {
        let mut sup = supervisor();
        let rounds = Arc::new(AtomicUsize::new(0));

        let counter = rounds.clone();
        sup.register_main("main_loop", move |ctx| async move {
            ctx.set_running();
            loop {
                counter.fetch_add(1, Ordering::SeqCst);
                if ctx.interruptible_sleep(Duration::from_secs(30), "main").await? {
                    return Ok(());
                }
            }
        });

        let stop = sup.stop_handle();
        let start = Instant::now();
        let runner = tokio::spawn(sup.run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop.stop().await;

        tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(start.elapsed() < Duration::from_secs(10));
        assert!(rounds.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let sup = supervisor();
        let stop = sup.stop_handle();
        stop.stop().await;
        stop.stop().await;
    }

    #[tokio::test]
    async fn exactly_one_main_loop_is_enforced() {
        let mut sup = supervisor();
        sup.register("a", |_ctx| async { Ok(()) });
        let err = sup.run().await.unwrap_err();
        assert!(err.to_string().contains("main loop"));
    }
}
