use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use fibrio::fiber::{FiberId, Runtime};
use fibrio::Error;

fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn stale_id_is_rejected() {
    init_log();
    let rt = Runtime::new().unwrap();

    let fiber = rt
        .create("reclaim_fiber", |rt| {
            assert!(rt.parent().is_none());
        })
        .unwrap();
    rt.transfer(fiber).unwrap();
    assert!(rt.is_reclaimed(fiber));

    // the slot is recycled under a new generation
    let new_fiber = rt
        .create("reclaim_fiber2", |rt| {
            assert!(rt.parent().is_none());
        })
        .unwrap();

    // the old id must not alias the new occupant
    assert!(matches!(rt.transfer(fiber), Err(Error::NoFiber)));

    rt.transfer(new_fiber).unwrap();
    assert!(matches!(rt.transfer(new_fiber), Err(Error::NoFiber)));
}

#[test]
fn disown_moves_to_a_new_parent() {
    init_log();
    let rt = Runtime::new().unwrap();

    let test_fiber = Rc::new(Cell::new(FiberId::NULL));
    let new_parent = rt.create("new_fiber", |_| {}).unwrap();

    let creator = rt
        .create("reclaim_fiber", {
            let test_fiber = test_fiber.clone();
            move |rt| {
                let child = rt
                    .create("test_fiber", {
                        let test_fiber = test_fiber.clone();
                        move |rt| {
                            assert_eq!(rt.self_id(), test_fiber.get());
                            rt.disown(Some(new_parent)).unwrap();
                            assert_eq!(rt.parent(), Some(new_parent));
                            loop {
                                rt.yield_now();
                            }
                        }
                    })
                    .unwrap();
                test_fiber.set(child);
                rt.yield_now();
            }
        })
        .unwrap();

    rt.transfer(creator).unwrap();
    let child = test_fiber.get();
    assert!(!child.is_null());
    assert!(!rt.is_reclaimed(child));

    // the child moves itself under new_parent...
    rt.transfer(child).unwrap();

    // ...so reclaiming its creator leaves it alive
    rt.reclaim(creator).unwrap();
    assert!(rt.is_reclaimed(creator));
    assert!(!rt.is_reclaimed(child));
    rt.transfer(child).unwrap();

    // reclaiming the adoptive parent takes the child with it
    rt.reclaim(new_parent).unwrap();
    assert!(rt.is_reclaimed(new_parent));
    assert!(rt.is_reclaimed(child));
}

#[test]
fn no_reclaim_defers_reclamation() {
    init_log();
    let rt = Runtime::new().unwrap();

    let fiber = rt
        .create("no_reclaim_fiber", |rt| {
            rt.sleep(Duration::from_millis(100));

            let target = rt
                .create("no_reclaim_fiber2", |rt| {
                    let me = rt.self_id();
                    rt.set_noreclaim(me).unwrap();
                    rt.sleep(Duration::from_millis(1500));
                    rt.set_reclaim(me).unwrap();
                })
                .unwrap();
            rt.transfer(target).unwrap();

            let ts1 = rt.now();
            rt.reclaim(target).unwrap();
            let ts2 = rt.now();
            assert!(
                ts2.duration_since(ts1) >= Duration::from_millis(1500),
                "reclaim returned after {:?}",
                ts2.duration_since(ts1)
            );
        })
        .unwrap();

    rt.transfer(fiber).unwrap();
    rt.run();
    assert!(rt.is_reclaimed(fiber));
}

#[test]
fn destructors_run_in_registration_order() {
    init_log();
    let rt = Runtime::new().unwrap();

    let order = Rc::new(RefCell::new(Vec::new()));
    let fiber = rt
        .create("dtors", {
            let order = order.clone();
            move |rt| {
                for i in 0..3 {
                    let order = order.clone();
                    rt.add_destructor(move |_| order.borrow_mut().push(i));
                }
                let removed = {
                    let order = order.clone();
                    rt.add_destructor(move |_| order.borrow_mut().push(99))
                };
                rt.remove_destructor(removed, false);
                loop {
                    rt.yield_now();
                }
            }
        })
        .unwrap();

    rt.transfer(fiber).unwrap();
    assert!(order.borrow().is_empty());

    rt.reclaim(fiber).unwrap();
    assert_eq!(*order.borrow(), vec![0, 1, 2]);
}

#[test]
fn restart_reruns_the_entry() {
    init_log();
    let rt = Runtime::new().unwrap();

    let runs = Rc::new(Cell::new(0));
    let fiber = rt
        .create("phoenix", {
            let runs = runs.clone();
            move |rt| {
                runs.set(runs.get() + 1);
                loop {
                    rt.yield_now();
                }
            }
        })
        .unwrap();

    rt.transfer(fiber).unwrap();
    assert_eq!(runs.get(), 1);

    let reborn = rt.restart(fiber).unwrap();
    assert!(rt.is_reclaimed(fiber));
    assert_eq!(rt.name(reborn).unwrap(), "phoenix");
    assert_eq!(runs.get(), 1);

    rt.transfer(reborn).unwrap();
    assert_eq!(runs.get(), 2);

    rt.reclaim(reborn).unwrap();
}

#[test]
fn pool_values_drain_on_reclaim() {
    init_log();
    let rt = Runtime::new().unwrap();

    let dropped = Rc::new(Cell::new(false));
    let taken = Rc::new(Cell::new(0u32));
    let fiber = rt
        .create("pooled", {
            let dropped = dropped.clone();
            let taken = taken.clone();
            move |rt| {
                let hooked = rt.pool_put_with(String::from("scratch"), {
                    let dropped = dropped.clone();
                    move |_, _| dropped.set(true)
                });
                let plain = rt.pool_put(7u32);
                taken.set(rt.pool_take::<u32>(plain).unwrap());
                assert!(matches!(
                    rt.pool_take::<u32>(plain),
                    Err(Error::Invalid(_))
                ));
                let _ = hooked;
                loop {
                    rt.yield_now();
                }
            }
        })
        .unwrap();

    rt.transfer(fiber).unwrap();
    assert_eq!(taken.get(), 7);
    assert!(!dropped.get());

    rt.reclaim(fiber).unwrap();
    assert!(dropped.get());
}
