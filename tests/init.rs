use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use fibrio::fiber::{check_yield, Builder, Runtime, YieldResult, MAX_NAME_LEN};
use fibrio::Error;

fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn create_transfer_reclaim() {
    init_log();
    let rt = Runtime::new().unwrap();

    let ran = Rc::new(Cell::new(false));
    let fiber = rt
        .create("simple", {
            let ran = ran.clone();
            move |_| ran.set(true)
        })
        .unwrap();

    assert!(!ran.get());
    assert!(!rt.is_reclaimed(fiber));

    rt.transfer(fiber).unwrap();
    assert!(ran.get());
    // the fiber ran to completion and reclaimed itself
    assert!(rt.is_reclaimed(fiber));

    match rt.transfer(fiber) {
        Err(Error::NoFiber) => {}
        other => panic!("expected NoFiber, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn yield_resumes_the_caller() {
    init_log();
    let rt = Runtime::new().unwrap();

    let steps = Rc::new(Cell::new(0));
    let fiber = rt
        .create("stepper", {
            let steps = steps.clone();
            move |rt| {
                steps.set(1);
                rt.yield_now();
                steps.set(2);
                rt.yield_now();
                steps.set(3);
            }
        })
        .unwrap();

    rt.transfer(fiber).unwrap();
    assert_eq!(steps.get(), 1);
    rt.transfer(fiber).unwrap();
    assert_eq!(steps.get(), 2);
    rt.transfer(fiber).unwrap();
    assert_eq!(steps.get(), 3);
    assert!(rt.is_reclaimed(fiber));
}

#[test]
fn names_are_truncated() {
    init_log();
    let rt = Runtime::new().unwrap();

    let long = "x".repeat(200);
    let fiber = Builder::new().name(long).create(&rt, |_| {}).unwrap();
    assert_eq!(rt.name(fiber).unwrap().len(), MAX_NAME_LEN);

    rt.set_name(fiber, "short").unwrap();
    assert_eq!(rt.name(fiber).unwrap(), "short");

    rt.reclaim(fiber).unwrap();
}

#[test]
fn user_data_round_trip() {
    init_log();
    let rt = Runtime::new().unwrap();

    let fiber = rt.create("null_fiber", |_| {}).unwrap();
    rt.set_user_data(fiber, 0xdeadbeafu64).unwrap();
    assert_eq!(*rt.user_data::<u64>(fiber).unwrap().unwrap(), 0xdeadbeaf);
    // a different type reads back as None
    assert!(rt.user_data::<String>(fiber).unwrap().is_none());

    rt.reclaim(fiber).unwrap();
    assert!(matches!(
        rt.set_user_data(fiber, 0u64),
        Err(Error::NoFiber)
    ));
}

#[test]
fn sleep_yields_and_returns_zero_on_overrun() {
    init_log();
    let rt = Runtime::new().unwrap();

    let fiber = rt
        .create("sleeper", |rt| {
            assert_eq!(
                check_yield(rt, || ()), //
                YieldResult::DidntYield(())
            );
            let remaining = match check_yield(rt, || rt.sleep(Duration::from_millis(10))) {
                YieldResult::Yielded(r) => r,
                YieldResult::DidntYield(_) => panic!("sleep did not yield"),
            };
            assert_eq!(remaining, Duration::ZERO);
        })
        .unwrap();

    rt.transfer(fiber).unwrap();
    rt.run();
    assert!(rt.is_reclaimed(fiber));
}

#[test]
fn cooperate_runs_on_a_later_iteration() {
    init_log();
    let rt = Runtime::new().unwrap();

    let stage = Rc::new(Cell::new(0));
    let fiber = rt
        .create("polite", {
            let stage = stage.clone();
            move |rt| {
                stage.set(1);
                rt.cooperate();
                stage.set(2);
            }
        })
        .unwrap();

    rt.transfer(fiber).unwrap();
    assert_eq!(stage.get(), 1);
    rt.run();
    assert_eq!(stage.get(), 2);
    assert!(rt.is_reclaimed(fiber));
}

#[test]
fn destroy_reclaims_children() {
    init_log();
    let rt = Runtime::new().unwrap();

    let parked = rt
        .create("parked", |rt| loop {
            rt.yield_now();
        })
        .unwrap();
    rt.transfer(parked).unwrap();
    assert!(!rt.is_reclaimed(parked));

    rt.destroy();
    assert!(rt.is_reclaimed(parked));
}
