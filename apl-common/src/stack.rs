//! The appliance stack: which appliance "the current one" is.
//!
//! Each thread owns one [`ApplianceStack`]. Code that needs an implicit
//! default appliance reads the top; everything else takes an appliance
//! explicitly. Scopes push on entry and pop on exit, checking that what they
//! pop is what they pushed.
//!
//! The thread-local stack assumes the scope stays on one thread, i.e. a
//! current-thread runtime or plain blocking callers.

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use tracing::{error, info, warn};

use crate::appliance::Appliance;
use crate::config::{EnvParser, HarnessConfig};
use crate::errors::ApplianceError;

/// Hands the active browser session over to an appliance.
pub trait SessionTakeover: Send + Sync {
    fn take_over(&self, appliance: &Appliance) {
        let _ = appliance;
    }
}

/// Does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTakeover;

impl SessionTakeover for NoTakeover {}

/// What a failed scope knows about its failure.
#[derive(Debug)]
pub struct FailureContext<'a> {
    pub appliance: &'a Appliance,
    pub error: String,
    /// The scope unwound from a panic rather than returning an error.
    pub panicked: bool,
}

/// Collects diagnostics (screenshots, tracebacks, log bundles) when a scope fails.
pub trait FailureObserver: Send + Sync {
    fn on_failure(&self, context: &FailureContext<'_>) -> Result<(), ApplianceError> {
        let _ = context;
        Ok(())
    }
}

/// Does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoObserver;

impl FailureObserver for NoObserver {}

/// Whether an external orchestrator drives this process
/// (`APL_RUNNING_UNDER_SPROUT`). Read once.
pub fn running_under_orchestrator() -> bool {
    static UNDER_ORCHESTRATOR: OnceLock<bool> = OnceLock::new();
    *UNDER_ORCHESTRATOR.get_or_init(|| {
        let mut env = EnvParser::new();
        let value = env.get_bool("RUNNING_UNDER_SPROUT").unwrap_or(false);
        for e in env.take_errors() {
            warn!(error = %e, "Ignoring malformed orchestrator flag");
        }
        value
    })
}

fn describe(appliance: Option<&Arc<Appliance>>) -> String {
    appliance.map_or_else(|| "None".to_string(), |a| a.to_string())
}

/// LIFO stack of appliances.
pub struct ApplianceStack {
    items: Vec<Arc<Appliance>>,
    takeover: Arc<dyn SessionTakeover>,
    observer: Arc<dyn FailureObserver>,
    capture_diagnostics: bool,
}

impl Default for ApplianceStack {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ApplianceStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplianceStack")
            .field("items", &self.items)
            .field("capture_diagnostics", &self.capture_diagnostics)
            .finish_non_exhaustive()
    }
}

impl ApplianceStack {
    /// Empty stack with no-op collaborators. Diagnostics are captured unless
    /// an orchestrator is driving the process.
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            takeover: Arc::new(NoTakeover),
            observer: Arc::new(NoObserver),
            capture_diagnostics: !running_under_orchestrator(),
        }
    }

    pub fn with_takeover(mut self, takeover: Arc<dyn SessionTakeover>) -> Self {
        self.takeover = takeover;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn FailureObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_capture_diagnostics(mut self, capture: bool) -> Self {
        self.capture_diagnostics = capture;
        self
    }

    pub fn set_takeover(&mut self, takeover: Arc<dyn SessionTakeover>) {
        self.takeover = takeover;
    }

    pub fn set_observer(&mut self, observer: Arc<dyn FailureObserver>) {
        self.observer = observer;
    }

    pub fn top(&self) -> Option<Arc<Appliance>> {
        self.items.last().cloned()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn push(&mut self, appliance: Arc<Appliance>) {
        if let Some(handoff) = self.push_deferred(appliance) {
            handoff.run();
        }
    }

    /// Remove and return the top. The new top gets the browser session back
    /// if it steals sessions.
    pub fn pop(&mut self) -> Result<Arc<Appliance>, ApplianceError> {
        let (popped, handoff) = self.pop_deferred()?;
        if let Some(handoff) = handoff {
            handoff.run();
        }
        Ok(popped)
    }

    /// Pop, failing if the popped appliance is not `expected` (same instance).
    pub fn pop_expected(&mut self, expected: &Arc<Appliance>) -> Result<Arc<Appliance>, ApplianceError> {
        let (popped, handoff) = self.pop_expected_deferred(expected);
        if let Some(handoff) = handoff {
            handoff.run();
        }
        popped
    }

    /// Hand a failure to the observer. Observer errors are logged and dropped.
    pub fn report_failure(&self, appliance: &Appliance, error: &str, panicked: bool) {
        if let Some(observer) = self.failure_observer() {
            notify_observer(observer.as_ref(), appliance, error, panicked);
        }
    }

    /// Push without calling the takeover; the caller runs the returned hand-off.
    fn push_deferred(&mut self, appliance: Arc<Appliance>) -> Option<Handoff> {
        let was = describe(self.items.last());
        info!("Pushed appliance {appliance} on stack (was {was} before)");
        self.items.push(appliance.clone());
        appliance.browser_steal().then(|| Handoff {
            takeover: self.takeover.clone(),
            appliance,
        })
    }

    fn pop_deferred(&mut self) -> Result<(Arc<Appliance>, Option<Handoff>), ApplianceError> {
        let popped = self.items.pop().ok_or_else(|| {
            ApplianceError::Consistency("pop from an empty appliance stack".to_string())
        })?;
        let now = self.items.last();
        info!("Popped appliance {popped} from the stack (now there is {})", describe(now));
        let handoff = now.filter(|top| top.browser_steal()).map(|top| Handoff {
            takeover: self.takeover.clone(),
            appliance: top.clone(),
        });
        Ok((popped, handoff))
    }

    /// The hand-off is owed even when the consistency check fails, since the
    /// top has changed either way.
    fn pop_expected_deferred(
        &mut self,
        expected: &Arc<Appliance>,
    ) -> (Result<Arc<Appliance>, ApplianceError>, Option<Handoff>) {
        let (popped, handoff) = match self.pop_deferred() {
            Ok(pair) => pair,
            Err(e) => return (Err(e), None),
        };
        if !Arc::ptr_eq(&popped, expected) {
            let err = ApplianceError::Consistency(format!(
                "Appliance stack inconsistent: expected {expected} on top, popped {popped}"
            ));
            return (Err(err), handoff);
        }
        (Ok(popped), handoff)
    }

    fn failure_observer(&self) -> Option<Arc<dyn FailureObserver>> {
        self.capture_diagnostics.then(|| self.observer.clone())
    }

    /// Run `fut` with `appliance` pushed on the current thread's stack.
    ///
    /// An `Err` from `fut` is reported to the observer before popping, and
    /// wins over a stack consistency error, which is then only logged.
    pub async fn scoped<T, F>(appliance: Arc<Appliance>, fut: F) -> Result<T, ApplianceError>
    where
        F: Future<Output = Result<T, ApplianceError>>,
    {
        push_current(appliance.clone());
        let result = fut.await;
        if let Err(e) = &result {
            report_current_failure(&appliance, &e.to_string(), false);
        }
        let popped = pop_current(&appliance);
        match (result, popped) {
            (Ok(value), Ok(_)) => Ok(value),
            (Ok(_), Err(stack_error)) => Err(stack_error),
            (Err(e), Ok(_)) => Err(e),
            (Err(e), Err(stack_error)) => {
                error!(error = %stack_error, "Appliance stack inconsistent after failed scope");
                Err(e)
            }
        }
    }
}

/// A browser session hand-off owed to `appliance` after a stack change.
struct Handoff {
    takeover: Arc<dyn SessionTakeover>,
    appliance: Arc<Appliance>,
}

impl Handoff {
    fn run(self) {
        self.takeover.take_over(&self.appliance);
    }
}

fn notify_observer(observer: &dyn FailureObserver, appliance: &Appliance, error: &str, panicked: bool) {
    let context = FailureContext {
        appliance,
        error: error.to_string(),
        panicked,
    };
    if let Err(e) = observer.on_failure(&context) {
        warn!(appliance = %appliance, error = %e, "Could not capture failure diagnostics");
    }
}

thread_local! {
    static STACK: RefCell<ApplianceStack> = RefCell::new(ApplianceStack::new());
}

/// Borrow this thread's stack. `f` must not re-enter `with_stack`.
pub fn with_stack<R>(f: impl FnOnce(&mut ApplianceStack) -> R) -> R {
    STACK.with(|stack| f(&mut stack.borrow_mut()))
}

// Collaborators below run after the borrow is released, so they may read
// `current()` themselves.

fn push_current(appliance: Arc<Appliance>) {
    if let Some(handoff) = with_stack(|stack| stack.push_deferred(appliance)) {
        handoff.run();
    }
}

fn pop_current(expected: &Arc<Appliance>) -> Result<Arc<Appliance>, ApplianceError> {
    let (popped, handoff) = with_stack(|stack| stack.pop_expected_deferred(expected));
    if let Some(handoff) = handoff {
        handoff.run();
    }
    popped
}

fn report_current_failure(appliance: &Appliance, error: &str, panicked: bool) {
    if let Some(observer) = with_stack(|stack| stack.failure_observer()) {
        notify_observer(observer.as_ref(), appliance, error, panicked);
    }
}

/// Top of this thread's stack.
pub fn current() -> Option<Arc<Appliance>> {
    with_stack(|stack| stack.top())
}

/// Top of this thread's stack, or a new appliance from `config` pushed as the top.
pub fn current_or_create(config: Arc<HarnessConfig>) -> Result<Arc<Appliance>, ApplianceError> {
    if let Some(top) = current() {
        return Ok(top);
    }
    let appliance = Arc::new(Appliance::from_config(config)?.build()?);
    push_current(appliance.clone());
    Ok(appliance)
}

/// Keeps an appliance pushed for the lifetime of the guard.
///
/// Dropping the guard pops; a drop during a panic reports the failure first.
/// Use [`finish`](Self::finish) to see the consistency check's result.
#[must_use = "the appliance is popped when the guard is dropped"]
pub struct AppliancePush {
    appliance: Option<Arc<Appliance>>,
}

impl AppliancePush {
    pub fn new(appliance: Arc<Appliance>) -> Self {
        push_current(appliance.clone());
        Self {
            appliance: Some(appliance),
        }
    }

    pub fn appliance(&self) -> Option<&Arc<Appliance>> {
        self.appliance.as_ref()
    }

    /// Pop now, returning the consistency check's outcome.
    pub fn finish(mut self) -> Result<(), ApplianceError> {
        match self.appliance.take() {
            Some(appliance) => pop_current(&appliance).map(|_| ()),
            None => Ok(()),
        }
    }
}

impl Drop for AppliancePush {
    fn drop(&mut self) {
        let Some(appliance) = self.appliance.take() else {
            return;
        };
        if std::thread::panicking() {
            report_current_failure(&appliance, "scope panicked", true);
        }
        if let Err(e) = pop_current(&appliance) {
            error!(error = %e, "Appliance stack inconsistent when leaving scope");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockConnector, RecordingObserver, ScriptedProbe};
    use std::sync::Mutex;

    fn appliance(address: &str) -> Arc<Appliance> {
        Arc::new(
            Appliance::from_url(address)
                .unwrap()
                .connector(Arc::new(MockConnector::new()))
                .reachability(Arc::new(ScriptedProbe::new()))
                .build()
                .unwrap(),
        )
    }

    #[derive(Default)]
    struct CountingTakeover(Mutex<Vec<String>>);

    impl SessionTakeover for CountingTakeover {
        fn take_over(&self, appliance: &Appliance) {
            self.0.lock().unwrap().push(appliance.to_string());
        }
    }

    #[test]
    fn test_push_pop_lifo() {
        let mut stack = ApplianceStack::new();
        let a = appliance("10.0.0.1");
        let b = appliance("10.0.0.2");
        stack.push(a.clone());
        stack.push(b.clone());
        assert!(Arc::ptr_eq(&stack.pop().unwrap(), &b));
        assert!(Arc::ptr_eq(&stack.top().unwrap(), &a));
        assert!(Arc::ptr_eq(&stack.pop().unwrap(), &a));
        assert!(stack.is_empty());
        assert!(matches!(stack.pop(), Err(ApplianceError::Consistency(_))));
    }

    #[test]
    fn test_pop_expected_mismatch() {
        let mut stack = ApplianceStack::new();
        let a = appliance("10.0.0.1");
        let b = appliance("10.0.0.2");
        stack.push(a.clone());
        stack.push(b);
        let err = stack.pop_expected(&a).unwrap_err();
        assert!(matches!(err, ApplianceError::Consistency(_)));
    }

    #[test]
    fn test_pop_expected_uses_identity_not_equality() {
        let mut stack = ApplianceStack::new();
        let a = appliance("10.0.0.1");
        let twin = appliance("10.0.0.1");
        stack.push(a);
        assert!(stack.pop_expected(&twin).is_err());
    }

    #[test]
    fn test_browser_steal_triggers_takeover() {
        let takeover = Arc::new(CountingTakeover::default());
        let mut stack = ApplianceStack::new().with_takeover(takeover.clone());
        let a = appliance("10.0.0.1");
        a.set_browser_steal(true);
        let b = appliance("10.0.0.2");
        stack.push(a.clone());
        stack.push(b);
        stack.pop().unwrap();
        assert_eq!(
            *takeover.0.lock().unwrap(),
            vec!["Appliance(10.0.0.1)".to_string(), "Appliance(10.0.0.1)".to_string()]
        );
    }

    struct ReadsCurrent(Mutex<Vec<String>>);

    impl SessionTakeover for ReadsCurrent {
        fn take_over(&self, _appliance: &Appliance) {
            self.0.lock().unwrap().push(describe(current().as_ref()));
        }
    }

    impl FailureObserver for ReadsCurrent {
        fn on_failure(&self, _context: &FailureContext<'_>) -> Result<(), ApplianceError> {
            self.0.lock().unwrap().push(describe(current().as_ref()));
            Ok(())
        }
    }

    #[test]
    fn test_takeover_may_read_current() {
        let seen = Arc::new(ReadsCurrent(Mutex::new(Vec::new())));
        let previous = with_stack(|s| std::mem::replace(s, ApplianceStack::new().with_takeover(seen.clone())));

        let outer = appliance("10.0.0.1");
        outer.set_browser_steal(true);
        let inner = appliance("10.0.0.2");
        {
            let _outer = AppliancePush::new(outer);
            let guard = AppliancePush::new(inner);
            assert!(guard.finish().is_ok());
        }

        with_stack(|s| *s = previous);
        assert_eq!(
            *seen.0.lock().unwrap(),
            vec!["Appliance(10.0.0.1)".to_string(), "Appliance(10.0.0.1)".to_string()]
        );
    }

    #[tokio::test]
    async fn test_observer_may_read_current() {
        let seen = Arc::new(ReadsCurrent(Mutex::new(Vec::new())));
        let previous = with_stack(|s| {
            std::mem::replace(
                s,
                ApplianceStack::new()
                    .with_observer(seen.clone())
                    .with_capture_diagnostics(true),
            )
        });

        let a = appliance("10.0.0.3");
        let result: Result<(), _> =
            ApplianceStack::scoped(a, async { Err(ApplianceError::Aborted("boom".into())) }).await;

        with_stack(|s| *s = previous);
        assert!(matches!(result, Err(ApplianceError::Aborted(_))));
        assert_eq!(*seen.0.lock().unwrap(), vec!["Appliance(10.0.0.3)".to_string()]);
    }

    #[test]
    fn test_report_failure_respects_capture_flag() {
        let observer = Arc::new(RecordingObserver::new());
        let a = appliance("10.0.0.1");
        let stack = ApplianceStack::new()
            .with_observer(observer.clone())
            .with_capture_diagnostics(false);
        stack.report_failure(&a, "boom", false);
        assert!(observer.failures().is_empty());

        let stack = stack.with_capture_diagnostics(true);
        stack.report_failure(&a, "boom", false);
        assert_eq!(observer.failures(), vec![("Appliance(10.0.0.1)".to_string(), "boom".to_string())]);
    }

    #[test]
    fn test_guard_pops_on_drop() {
        let a = appliance("10.0.0.7");
        let before = with_stack(|s| s.len());
        {
            let _guard = AppliancePush::new(a.clone());
            assert!(Arc::ptr_eq(&current().unwrap(), &a));
        }
        assert_eq!(with_stack(|s| s.len()), before);

        let guard = AppliancePush::new(a);
        assert!(guard.finish().is_ok());
        assert_eq!(with_stack(|s| s.len()), before);
    }
}
