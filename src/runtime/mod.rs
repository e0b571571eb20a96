//! Controller runtime
//!
//! Controllers declare the resources they watch ([`Input`]) and the resource
//! types they own ([`Output`]). [`ControllerRuntime::run`] gives each
//! registered controller its own task, which:
//!
//! 1. subscribes to every input,
//! 2. reconciles once at startup,
//! 3. reconciles again whenever an input changes (bursts are coalesced),
//! 4. backs off and retries transient failures,
//! 5. stops at the next safe point once cancelled.
//!
//! A controller never has more than one reconcile in flight; different
//! controllers reconcile in parallel.

mod context;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use futures::FutureExt;
use tokio::task::JoinSet;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

use crate::config::RuntimeConfig;
use crate::resources::ResourceType;
use crate::retry::{Backoff, RetryConfig};
use crate::store::{ResourceStore, WatchEvent};
use crate::Error;

pub use context::ReconcileContext;

/// A watched input: all resources of a type in a namespace, or one by id
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Input {
    /// Namespace to watch
    pub namespace: String,
    /// Type to watch
    pub resource_type: ResourceType,
    /// Restrict to a single resource
    pub id: Option<String>,
}

impl Input {
    /// Watch every resource of `resource_type` in `namespace`
    pub fn all(namespace: impl Into<String>, resource_type: ResourceType) -> Self {
        Self {
            namespace: namespace.into(),
            resource_type,
            id: None,
        }
    }

    /// Watch a single resource
    pub fn named(
        namespace: impl Into<String>,
        resource_type: ResourceType,
        id: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            resource_type,
            id: Some(id.into()),
        }
    }
}

/// An owned output: the controller is the only writer of this type in this
/// namespace
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Output {
    /// Owned namespace
    pub namespace: String,
    /// Owned type
    pub resource_type: ResourceType,
}

impl Output {
    /// Claim `resource_type` in `namespace`
    pub fn new(namespace: impl Into<String>, resource_type: ResourceType) -> Self {
        Self {
            namespace: namespace.into(),
            resource_type,
        }
    }
}

/// What the runtime should do after a successful reconcile
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// Do nothing until an input changes
    AwaitChange,
    /// Reconcile again after the given delay, or sooner on an input change
    Requeue(Duration),
}

impl Action {
    /// Idle until the next input change
    pub fn await_change() -> Self {
        Self::AwaitChange
    }

    /// Reconcile again after `delay`
    pub fn requeue(delay: Duration) -> Self {
        Self::Requeue(delay)
    }
}

/// A reconciling controller
#[async_trait]
pub trait Controller: Send + Sync {
    /// Unique controller name
    fn name(&self) -> &str;

    /// Resources whose changes trigger a reconcile
    fn inputs(&self) -> Vec<Input>;

    /// Resource types this controller exclusively writes
    fn outputs(&self) -> Vec<Output>;

    /// Drive owned outputs toward the state implied by current inputs
    ///
    /// Must read inputs fresh on every call and be safe to re-run from
    /// scratch at any point.
    async fn reconcile(&self, ctx: &ReconcileContext) -> Result<Action, Error>;
}

/// Registry and driver for controllers
pub struct ControllerRuntime {
    store: Arc<dyn ResourceStore>,
    config: RuntimeConfig,
    controllers: Vec<Arc<dyn Controller>>,
    owners: HashMap<Output, String>,
}

impl ControllerRuntime {
    /// Create a runtime over `store`
    pub fn new(store: Arc<dyn ResourceStore>, config: RuntimeConfig) -> Self {
        Self {
            store,
            config,
            controllers: Vec::new(),
            owners: HashMap::new(),
        }
    }

    /// Add a controller
    ///
    /// Fails with [`Error::DuplicateController`] if the name is taken and
    /// with [`Error::OwnershipConflict`] if any declared output is already
    /// owned by another controller. A rejected controller leaves the runtime
    /// unchanged.
    pub fn register(&mut self, controller: Arc<dyn Controller>) -> Result<(), Error> {
        let name = controller.name().to_string();
        if self.controllers.iter().any(|c| c.name() == name) {
            return Err(Error::DuplicateController(name));
        }

        let outputs = controller.outputs();
        for output in &outputs {
            if let Some(owner) = self.owners.get(output) {
                return Err(Error::OwnershipConflict {
                    namespace: output.namespace.clone(),
                    resource_type: output.resource_type,
                    owner: owner.clone(),
                    claimant: name,
                });
            }
        }

        for output in outputs {
            self.owners.insert(output, name.clone());
        }
        debug!(controller = %name, "Registered controller");
        self.controllers.push(controller);
        Ok(())
    }

    /// Names of registered controllers, in registration order
    pub fn controller_names(&self) -> Vec<&str> {
        self.controllers.iter().map(|c| c.name()).collect()
    }

    /// Run every controller until `cancel` fires
    ///
    /// Returns once all controller tasks have stopped. If any controller hits
    /// a fatal error the remaining ones are cancelled and that error is
    /// returned.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), Error> {
        info!(controllers = self.controllers.len(), "Starting controller runtime");

        let shutdown = cancel.child_token();
        let mut tasks = JoinSet::new();

        for controller in self.controllers {
            let span = info_span!("controller", controller = %controller.name());
            let worker = Worker {
                controller,
                store: self.store.clone(),
                config: self.config.clone(),
                cancel: shutdown.clone(),
            };
            tasks.spawn(worker.run().instrument(span));
        }

        let mut result = Ok(());
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined.unwrap_or_else(|e| {
                Err(Error::internal_with_context(
                    "runtime",
                    format!("controller task failed: {e}"),
                ))
            });
            if let Err(e) = outcome {
                error!(error = %e, "Controller stopped with fatal error, shutting down runtime");
                shutdown.cancel();
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }

        if result.is_ok() {
            shutdown.cancelled().await;
        }

        info!("Controller runtime stopped");
        result
    }
}

/// One controller's reconcile loop
struct Worker {
    controller: Arc<dyn Controller>,
    store: Arc<dyn ResourceStore>,
    config: RuntimeConfig,
    cancel: CancellationToken,
}

impl Worker {
    async fn subscribe(&self) -> Result<BoxStream<'static, WatchEvent>, Error> {
        let inputs = self.controller.inputs();
        if inputs.is_empty() {
            return Ok(stream::pending().boxed());
        }

        let mut watches = Vec::with_capacity(inputs.len());
        for input in inputs {
            watches.push(
                self.store
                    .watch(&input.namespace, input.resource_type, input.id)
                    .await?,
            );
        }
        Ok(stream::select_all(watches).boxed())
    }

    async fn run(self) -> Result<(), Error> {
        // Subscribe before the first reconcile so no change slips between
        let mut triggers = self.subscribe().await?;

        let ctx = ReconcileContext::new(
            self.store.clone(),
            self.controller.name(),
            self.controller.outputs(),
            self.cancel.clone(),
        );
        let mut transient = Backoff::new(self.config.retry.clone());
        let mut persistent = Backoff::new(RetryConfig {
            max_attempts: self.config.max_error_retries,
            ..self.config.retry.clone()
        });
        let mut next_run = Some(Instant::now());

        info!("Controller started");

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break,

                event = triggers.next() => {
                    let Some(event) = event else {
                        warn!("Input watches closed, waiting for cancellation");
                        triggers = stream::pending().boxed();
                        continue;
                    };
                    trace!(?event, "Input changed");

                    // Coalesce a burst of changes into one reconcile
                    let mut coalesced = 0u32;
                    while let Some(Some(_)) = triggers.next().now_or_never() {
                        coalesced += 1;
                    }
                    if coalesced > 0 {
                        trace!(coalesced, "Coalesced input changes");
                    }

                    transient.reset();
                    persistent.reset();
                    next_run = Some(Instant::now());
                }

                _ = sleep_until(next_run.unwrap_or_else(Instant::now)), if next_run.is_some() => {
                    next_run = None;
                    let result = self.controller.reconcile(&ctx).await;
                    match self.handle(result, &mut transient, &mut persistent) {
                        Ok(next) => next_run = next,
                        Err(Error::Cancelled) => break,
                        Err(e) => return Err(e),
                    }
                }
            }
        }

        info!("Controller stopped");
        Ok(())
    }

    /// Decide when to reconcile next; `Err` stops the task
    fn handle(
        &self,
        result: Result<Action, Error>,
        transient: &mut Backoff,
        persistent: &mut Backoff,
    ) -> Result<Option<Instant>, Error> {
        let error = match result {
            Ok(action) => {
                transient.reset();
                persistent.reset();
                return Ok(match action {
                    Action::AwaitChange => None,
                    Action::Requeue(delay) => Some(Instant::now() + delay),
                });
            }
            Err(e) => e,
        };

        if error.is_cancelled() {
            debug!("Reconcile observed cancellation");
            return Err(error);
        }

        if error.is_fatal() {
            error!(error = %error, "Reconcile failed with fatal error");
            return Err(error);
        }

        if error.is_retryable() {
            return Ok(match transient.next_delay() {
                Some(delay) => {
                    warn!(
                        error = %error,
                        attempt = transient.attempts(),
                        delay_ms = delay.as_millis() as u64,
                        "Reconcile failed, retrying"
                    );
                    Some(Instant::now() + delay)
                }
                None => {
                    error!(error = %error, "Reconcile retries exhausted, waiting for input change");
                    None
                }
            });
        }

        Ok(match persistent.next_delay() {
            Some(delay) => {
                if error.is_render() {
                    error!(
                        error = %error,
                        attempt = persistent.attempts(),
                        delay_ms = delay.as_millis() as u64,
                        "Failed to render manifests, retrying"
                    );
                } else {
                    error!(
                        error = %error,
                        attempt = persistent.attempts(),
                        delay_ms = delay.as_millis() as u64,
                        "Reconcile failed, retrying"
                    );
                }
                Some(Instant::now() + delay)
            }
            None => {
                error!(error = %error, "Giving up until next input change");
                None
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;
    use crate::bootstrap::RenderError;
    use crate::resources::{
        ManifestSpec, Resource, Version, CONFIG_NAMESPACE, CONTROL_PLANE_NAMESPACE,
    };
    use crate::retry::wait_for;
    use crate::store::InMemoryStore;

    type Behaviour = Box<dyn Fn(u32) -> Result<Action, Error> + Send + Sync>;

    /// Controller that records calls and replays a scripted outcome
    struct Probe {
        name: String,
        inputs: Vec<Input>,
        outputs: Vec<Output>,
        delay: Duration,
        behaviour: Behaviour,
        calls: AtomicU32,
        in_flight: AtomicBool,
        overlapped: AtomicBool,
    }

    impl Probe {
        fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                inputs: vec![Input::all(CONFIG_NAMESPACE, ResourceType::Manifest)],
                outputs: vec![],
                delay: Duration::ZERO,
                behaviour: Box::new(|_| Ok(Action::await_change())),
                calls: AtomicU32::new(0),
                in_flight: AtomicBool::new(false),
                overlapped: AtomicBool::new(false),
            }
        }

        fn owning(mut self, namespace: &str) -> Self {
            self.outputs = vec![Output::new(namespace, ResourceType::Manifest)];
            self
        }

        fn behaving(
            mut self,
            f: impl Fn(u32) -> Result<Action, Error> + Send + Sync + 'static,
        ) -> Self {
            self.behaviour = Box::new(f);
            self
        }

        fn slow(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Controller for Probe {
        fn name(&self) -> &str {
            &self.name
        }

        fn inputs(&self) -> Vec<Input> {
            self.inputs.clone()
        }

        fn outputs(&self) -> Vec<Output> {
            self.outputs.clone()
        }

        async fn reconcile(&self, _ctx: &ReconcileContext) -> Result<Action, Error> {
            if self.in_flight.swap(true, Ordering::SeqCst) {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.store(false, Ordering::SeqCst);
            (self.behaviour)(call)
        }
    }

    fn fast_config() -> RuntimeConfig {
        RuntimeConfig {
            retry: RetryConfig {
                initial_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
                ..RetryConfig::default()
            },
            max_error_retries: 2,
            ..RuntimeConfig::default()
        }
    }

    fn conflict() -> Error {
        Error::conflict(
            CONTROL_PLANE_NAMESPACE,
            ResourceType::Manifest,
            "10-kube-proxy",
            Version::new(0),
            Version::new(1),
        )
    }

    async fn wait_until(description: &str, check: impl Fn() -> bool) {
        wait_for(
            description,
            Duration::from_secs(5),
            Duration::from_millis(5),
            || {
                let ready = check();
                async move { Ok(ready.then_some(())) }
            },
        )
        .await
        .unwrap();
    }

    async fn touch(store: &InMemoryStore, id: &str) {
        let resource = Resource::new(
            CONFIG_NAMESPACE,
            id,
            ManifestSpec::new(vec![json!({ "kind": "ConfigMap" })]),
        );
        match store
            .get(CONFIG_NAMESPACE, ResourceType::Manifest, id)
            .await
        {
            Ok(current) => {
                store.update(resource, current.version()).await.unwrap();
            }
            Err(_) => {
                store.create(resource).await.unwrap();
            }
        }
    }

    struct Running {
        store: Arc<InMemoryStore>,
        cancel: CancellationToken,
        handle: tokio::task::JoinHandle<Result<(), Error>>,
    }

    fn start(probes: Vec<Arc<Probe>>, config: RuntimeConfig) -> Running {
        let store = Arc::new(InMemoryStore::new());
        let mut runtime = ControllerRuntime::new(store.clone(), config);
        for probe in probes {
            runtime.register(probe).unwrap();
        }
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(runtime.run(cancel.clone()));
        Running {
            store,
            cancel,
            handle,
        }
    }

    // =========================================================================
    // Registration Stories
    // =========================================================================

    #[test]
    fn story_duplicate_names_are_rejected() {
        let mut runtime =
            ControllerRuntime::new(Arc::new(InMemoryStore::new()), RuntimeConfig::default());
        runtime.register(Arc::new(Probe::new("manifests"))).unwrap();

        let err = runtime
            .register(Arc::new(Probe::new("manifests")))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateController(name) if name == "manifests"));
        assert_eq!(runtime.controller_names(), vec!["manifests"]);
    }

    /// Story: two controllers may not own the same output, and the loser
    /// leaves no trace in the registry
    #[test]
    fn story_output_ownership_is_exclusive() {
        let mut runtime =
            ControllerRuntime::new(Arc::new(InMemoryStore::new()), RuntimeConfig::default());
        runtime
            .register(Arc::new(Probe::new("a").owning(CONTROL_PLANE_NAMESPACE)))
            .unwrap();

        let err = runtime
            .register(Arc::new(Probe::new("b").owning(CONTROL_PLANE_NAMESPACE)))
            .unwrap_err();
        assert!(matches!(
            &err,
            Error::OwnershipConflict { owner, claimant, .. } if owner == "a" && claimant == "b"
        ));
        assert!(err.is_fatal());

        // Same type in another namespace is a different output
        runtime
            .register(Arc::new(Probe::new("b").owning("elsewhere")))
            .unwrap();
        assert_eq!(runtime.controller_names(), vec!["a", "b"]);
    }

    // =========================================================================
    // Reconcile Loop Stories
    // =========================================================================

    /// Story: each controller reconciles once at startup and again on every
    /// input change
    #[tokio::test]
    async fn story_reconciles_on_start_and_on_change() {
        let probe = Arc::new(Probe::new("manifests"));
        let running = start(vec![probe.clone()], fast_config());

        wait_until("initial reconcile", || probe.calls() == 1).await;

        touch(&running.store, "manifests").await;
        wait_until("triggered reconcile", || probe.calls() >= 2).await;

        running.cancel.cancel();
        running.handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn story_unrelated_changes_do_not_trigger() {
        let probe = Arc::new(Probe::new("manifests"));
        let running = start(vec![probe.clone()], fast_config());
        wait_until("initial reconcile", || probe.calls() == 1).await;

        running
            .store
            .create(Resource::manifest("not-watched", ManifestSpec::default()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(probe.calls(), 1);

        running.cancel.cancel();
        running.handle.await.unwrap().unwrap();
    }

    /// Story: a version conflict is retried after a backoff until it clears
    #[tokio::test]
    async fn story_conflicts_are_retried() {
        let probe = Arc::new(Probe::new("manifests").behaving(|call| {
            if call < 3 {
                Err(conflict())
            } else {
                Ok(Action::await_change())
            }
        }));
        let running = start(vec![probe.clone()], fast_config());

        wait_until("conflict cleared", || probe.calls() == 4).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(probe.calls(), 4, "no reconcile after success without change");

        running.cancel.cancel();
        running.handle.await.unwrap().unwrap();
    }

    /// Story: a render error is retried a bounded number of times, then the
    /// controller idles until the next input change
    #[tokio::test]
    async fn story_render_errors_have_bounded_retry() {
        let probe = Arc::new(Probe::new("manifests").behaving(|_| {
            Err(RenderError::invalid_input("10-kube-proxy", "ProxyImage", "must not be empty").into())
        }));
        let running = start(vec![probe.clone()], fast_config());

        // Initial attempt plus max_error_retries
        wait_until("retries exhausted", || probe.calls() == 3).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(probe.calls(), 3);

        touch(&running.store, "manifests").await;
        wait_until("new input retried", || probe.calls() == 6).await;

        running.cancel.cancel();
        running.handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn story_requeue_runs_again_without_change() {
        let probe = Arc::new(Probe::new("manifests").behaving(|call| {
            Ok(if call == 0 {
                Action::requeue(Duration::from_millis(10))
            } else {
                Action::await_change()
            })
        }));
        let running = start(vec![probe.clone()], fast_config());

        wait_until("requeued reconcile", || probe.calls() == 2).await;

        running.cancel.cancel();
        running.handle.await.unwrap().unwrap();
    }

    /// Story: a burst of input changes never runs two reconciles at once
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn story_at_most_one_reconcile_in_flight() {
        let probe = Arc::new(Probe::new("manifests").slow(Duration::from_millis(20)));
        let running = start(vec![probe.clone()], fast_config());
        wait_until("initial reconcile", || probe.calls() == 1).await;

        for i in 0..20 {
            touch(&running.store, &format!("m{}", i % 3)).await;
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(!probe.overlapped.load(Ordering::SeqCst));
        // Coalescing keeps the count well under one reconcile per change
        assert!(probe.calls() >= 2);
        assert!(probe.calls() <= 21);

        running.cancel.cancel();
        running.handle.await.unwrap().unwrap();
    }

    /// Story: controllers run independently; one failing does not stall
    /// another
    #[tokio::test]
    async fn story_controllers_are_independent() {
        let failing = Arc::new(
            Probe::new("failing")
                .behaving(|_| Err(Error::internal_with_context("test", "boom"))),
        );
        let healthy = Arc::new(Probe::new("healthy"));
        let running = start(vec![failing.clone(), healthy.clone()], fast_config());

        wait_until("both reconciled", || failing.calls() >= 1 && healthy.calls() == 1).await;
        touch(&running.store, "manifests").await;
        wait_until("healthy reacts", || healthy.calls() == 2).await;

        running.cancel.cancel();
        running.handle.await.unwrap().unwrap();
    }

    /// Story: a fatal error in one controller stops the whole runtime
    #[tokio::test]
    async fn story_fatal_error_stops_runtime() {
        let fatal = Arc::new(Probe::new("rogue").behaving(|_| {
            Err(Error::OwnershipViolation {
                controller: "rogue".into(),
                namespace: CONTROL_PLANE_NAMESPACE.into(),
                resource_type: ResourceType::Manifest,
            })
        }));
        let bystander = Arc::new(Probe::new("bystander"));
        let running = start(vec![fatal, bystander], fast_config());

        let result = tokio::time::timeout(Duration::from_secs(5), running.handle)
            .await
            .expect("runtime stops")
            .unwrap();
        assert!(matches!(result, Err(Error::OwnershipViolation { .. })));
        assert!(!running.cancel.is_cancelled(), "caller's token untouched");
    }

    /// Story: cancellation lets an in-flight reconcile finish, then run
    /// returns
    #[tokio::test]
    async fn story_cancellation_waits_for_in_flight_reconcile() {
        let finished = Arc::new(Mutex::new(false));
        let flag = finished.clone();
        let probe = Arc::new(
            Probe::new("manifests")
                .slow(Duration::from_millis(50))
                .behaving(move |_| {
                    *flag.lock().unwrap() = true;
                    Ok(Action::await_change())
                }),
        );
        let running = start(vec![probe.clone()], fast_config());

        wait_until("reconcile started", || probe.in_flight.load(Ordering::SeqCst)).await;
        running.cancel.cancel();

        tokio::time::timeout(Duration::from_secs(5), running.handle)
            .await
            .expect("runtime stops")
            .unwrap()
            .unwrap();
        assert!(*finished.lock().unwrap());
        assert_eq!(probe.calls(), 1);
    }

    /// Story: a runtime with nothing registered still runs until cancelled
    #[tokio::test]
    async fn story_empty_runtime_runs_until_cancelled() {
        let store: Arc<dyn ResourceStore> = Arc::new(InMemoryStore::new());
        let cancel = CancellationToken::new();
        let runtime = ControllerRuntime::new(store, fast_config());
        let mut handle = tokio::spawn(runtime.run(cancel.clone()));

        assert!(
            tokio::time::timeout(Duration::from_millis(200), &mut handle)
                .await
                .is_err(),
            "run returned before cancellation"
        );

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("runtime stops")
            .unwrap()
            .unwrap();
    }
}
