use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use fibrio::fiber::{CondVar, Event, Mutex, Runtime};
use fibrio::{Error, ErrorCode};

fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

const NUM_FIBERS: usize = 100;

fn spawn_waiters(rt: &Runtime, mutex: &Mutex, cond: &CondVar, flag: &Rc<Cell<usize>>) {
    for _ in 0..NUM_FIBERS {
        let fiber = rt
            .create("cond_i", {
                let m = mutex.clone();
                let c = cond.clone();
                let flag = flag.clone();
                move |_| {
                    m.lock().unwrap();
                    c.wait(&m).unwrap();
                    flag.set(flag.get() + 1);
                    m.unlock();
                }
            })
            .unwrap();
        rt.transfer(fiber).unwrap();
    }
}

#[test]
fn broadcast_wakes_everybody() {
    init_log();
    let rt = Runtime::new().unwrap();

    let mutex = Mutex::new(&rt);
    let cond = CondVar::new(&rt);
    let flag = Rc::new(Cell::new(0));

    spawn_waiters(&rt, &mutex, &cond, &flag);
    assert_eq!(flag.get(), 0);

    cond.broadcast();
    cond.broadcast();

    rt.run();
    assert_eq!(flag.get(), NUM_FIBERS);
}

#[test]
fn signal_wakes_one_at_a_time() {
    init_log();
    let rt = Runtime::new().unwrap();

    let mutex = Mutex::new(&rt);
    let cond = CondVar::new(&rt);
    let flag = Rc::new(Cell::new(0));

    spawn_waiters(&rt, &mutex, &cond, &flag);
    assert_eq!(flag.get(), 0);

    // one extra signal lands on an empty queue and is lost
    for _ in 0..=NUM_FIBERS {
        cond.signal();
    }

    rt.run();
    assert_eq!(flag.get(), NUM_FIBERS);
}

#[test]
fn wait_with_unheld_mutex_is_invalid() {
    init_log();
    let rt = Runtime::new().unwrap();

    let mutex = Mutex::new(&rt);
    let cond = CondVar::new(&rt);

    match cond.wait(&mutex) {
        Err(e @ Error::Invalid(_)) => assert_eq!(e.code(), ErrorCode::Invalid),
        other => panic!("expected Invalid, got {:?}", other),
    }
}

#[test]
fn waiting_on_two_conds_at_once() {
    init_log();
    let rt = Runtime::new().unwrap();

    let mutex1 = Mutex::new(&rt);
    let cond1 = CondVar::new(&rt);
    let mutex2 = Mutex::new(&rt);
    let cond2 = CondVar::new(&rt);

    let waiter = rt
        .create("cond_waiter", {
            let (m1, c1) = (mutex1.clone(), cond1.clone());
            let (m2, c2) = (mutex2.clone(), cond2.clone());
            move |rt| {
                m1.lock().unwrap();
                m2.lock().unwrap();

                let n = rt
                    .wait(&[Event::Cond(&c1, &m1), Event::Cond(&c2, &m2)])
                    .unwrap();
                // both signals happen before we are resumed
                assert_eq!(n, 2);

                m1.unlock();
                m2.unlock();
            }
        })
        .unwrap();
    rt.transfer(waiter).unwrap();

    let signaller = rt
        .create("cond_signaller", {
            let (c1, c2) = (cond1.clone(), cond2.clone());
            move |rt| {
                rt.sleep(Duration::from_millis(300));
                c1.signal();
                c2.signal();
            }
        })
        .unwrap();
    rt.transfer(signaller).unwrap();

    rt.run();
    assert!(rt.is_reclaimed(waiter));
    assert!(rt.is_reclaimed(signaller));
}
