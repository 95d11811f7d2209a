//! The thread-scoped appliance stack and its scope helpers.

mod common;

use std::sync::Arc;

use apl_common::mock::{MockConnector, RecordingObserver, ScriptedProbe};
use apl_common::stack::{self, ApplianceStack, AppliancePush};
use apl_common::{Appliance, ApplianceError};
use proptest::prelude::*;

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

fn install_observer(observer: Arc<RecordingObserver>) {
    stack::with_stack(|s| {
        *s = ApplianceStack::new()
            .with_observer(observer)
            .with_capture_diagnostics(true);
    });
}

#[tokio::test]
async fn test_scoped_exposes_appliance_as_current() {
    let a = appliance("10.0.0.1");
    let inner = a.clone();
    let seen = ApplianceStack::scoped(a.clone(), async move {
        let top = stack::current().unwrap();
        Ok::<_, ApplianceError>(Arc::ptr_eq(&top, &inner))
    })
    .await
    .unwrap();
    assert!(seen);
    assert!(stack::current().is_none());
}

#[tokio::test]
async fn test_nested_scopes_restore_outer() {
    let outer = appliance("10.0.0.1");
    let inner = appliance("10.0.0.2");
    let outer_ref = outer.clone();
    ApplianceStack::scoped(outer.clone(), async move {
        ApplianceStack::scoped(inner, async { Ok(()) }).await?;
        assert!(Arc::ptr_eq(&stack::current().unwrap(), &outer_ref));
        Ok(())
    })
    .await
    .unwrap();
    assert_eq!(stack::with_stack(|s| s.len()), 0);
}

#[tokio::test]
async fn test_scoped_failure_is_reported_and_returned() {
    common::init_test_logging();
    let observer = Arc::new(RecordingObserver::new());
    install_observer(observer.clone());
    let a = appliance("10.0.0.1");

    let err = ApplianceStack::scoped(a, async {
        Err::<(), _>(ApplianceError::Address("no route".to_string()))
    })
    .await
    .unwrap_err();

    assert!(matches!(err, ApplianceError::Address(_)));
    let failures = observer.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, "Appliance(10.0.0.1)");
    assert!(failures[0].1.contains("no route"));
    assert!(stack::current().is_none());
}

#[tokio::test]
async fn test_scoped_failure_wins_over_stack_corruption() {
    install_observer(Arc::new(RecordingObserver::new()));
    let a = appliance("10.0.0.1");
    let stray = appliance("10.0.0.2");

    let err = ApplianceStack::scoped(a, async move {
        stack::with_stack(|s| s.push(stray));
        Err::<(), _>(ApplianceError::Address("no route".to_string()))
    })
    .await
    .unwrap_err();

    assert!(matches!(err, ApplianceError::Address(_)));
}

#[tokio::test]
async fn test_scoped_success_with_stray_push_is_consistency_error() {
    let a = appliance("10.0.0.1");
    let stray = appliance("10.0.0.2");

    let err = ApplianceStack::scoped(a, async move {
        stack::with_stack(|s| s.push(stray));
        Ok(())
    })
    .await
    .unwrap_err();

    assert!(matches!(err, ApplianceError::Consistency(_)));
}

#[tokio::test]
async fn test_failing_observer_does_not_mask_error() {
    common::init_test_logging();
    let observer = Arc::new(RecordingObserver::failing("screenshot failed"));
    install_observer(observer.clone());
    let a = appliance("10.0.0.1");

    let err = ApplianceStack::scoped(a, async {
        Err::<(), _>(ApplianceError::Settings("bad yaml".to_string()))
    })
    .await
    .unwrap_err();

    assert!(matches!(err, ApplianceError::Settings(_)));
    assert_eq!(observer.failures().len(), 1);
}

#[test]
fn test_guard_reports_panic_and_pops() {
    let observer = Arc::new(RecordingObserver::new());
    install_observer(observer.clone());
    let a = appliance("10.0.0.3");

    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let _guard = AppliancePush::new(a.clone());
        panic!("scope blew up");
    }));

    assert!(outcome.is_err());
    assert!(stack::current().is_none());
    let failures = observer.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].1, "scope panicked");
}

#[test]
fn test_guard_finish_detects_foreign_top() {
    let a = appliance("10.0.0.1");
    let stray = appliance("10.0.0.2");
    let guard = AppliancePush::new(a);
    stack::with_stack(|s| s.push(stray));
    assert!(matches!(guard.finish(), Err(ApplianceError::Consistency(_))));
}

#[derive(Debug, Clone)]
enum Op {
    Push(usize),
    Pop,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![(0..3usize).prop_map(Op::Push), Just(Op::Pop)]
}

proptest! {
    #[test]
    fn prop_stack_behaves_like_vec(ops in prop::collection::vec(op(), 0..40)) {
        let pool = [appliance("10.0.1.1"), appliance("10.0.1.2"), appliance("10.0.1.3")];
        let mut stack = ApplianceStack::new().with_capture_diagnostics(false);
        let mut model: Vec<usize> = Vec::new();

        for op in ops {
            match op {
                Op::Push(i) => {
                    stack.push(pool[i].clone());
                    model.push(i);
                }
                Op::Pop => match (stack.pop(), model.pop()) {
                    (Ok(popped), Some(i)) => prop_assert!(Arc::ptr_eq(&popped, &pool[i])),
                    (Err(ApplianceError::Consistency(_)), None) => {}
                    (got, want) => prop_assert!(false, "pop gave {:?}, model {:?}", got.map(|a| a.to_string()), want),
                },
            }
            prop_assert_eq!(stack.len(), model.len());
            match (stack.top(), model.last()) {
                (Some(top), Some(&i)) => prop_assert!(Arc::ptr_eq(&top, &pool[i])),
                (None, None) => {}
                _ => prop_assert!(false, "top disagrees with model"),
            }
        }
    }
}
