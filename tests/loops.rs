#![allow(missing_docs)]
//! Loop driver semantics: repeat, for_each, break/continue, labels.

mod common;

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use common::*;
use stepflow::{codes, AsyncSteps, RootStatus};

#[test]
fn repeat_runs_count_iterations_in_order() {
    let (reactor, clock) = virtual_reactor();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let mut root = AsyncSteps::new(&reactor);

    let s = seen.clone();
    root.repeat(
        5,
        move |_asi, i| {
            s.borrow_mut().push(i);
            Ok(())
        },
        None,
    );

    root.execute();
    drive(&reactor, &clock);

    assert_eq!(seen.borrow().as_slice(), [0, 1, 2, 3, 4]);
    assert_eq!(root.status(), RootStatus::Finished);
}

#[test]
fn repeat_zero_runs_nothing() {
    let (reactor, clock) = virtual_reactor();
    let mut root = AsyncSteps::new(&reactor);

    root.repeat(0, |_asi, _i| panic!("must not run"), None);
    root.add(|asi| {
        asi.state_mut().set("after", true);
        Ok(())
    });

    root.execute();
    drive(&reactor, &clock);
    assert_eq!(root.state_get::<bool>("after"), Some(true));
}

#[test]
fn break_stops_the_loop() {
    let (reactor, clock) = virtual_reactor();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let mut root = AsyncSteps::new(&reactor);

    let s = seen.clone();
    root.repeat(
        5,
        move |asi, i| {
            s.borrow_mut().push(i);
            if i == 2 {
                return asi.break_loop(None);
            }
            Ok(())
        },
        None,
    );

    root.execute();
    drive(&reactor, &clock);

    assert_eq!(seen.borrow().as_slice(), [0, 1, 2]);
    assert_eq!(root.status(), RootStatus::Finished);
}

#[test]
fn continue_skips_the_rest_of_the_iteration() {
    let (reactor, clock) = virtual_reactor();
    let log = EventLog::new();
    let mut root = AsyncSteps::new(&reactor);

    let l = log.clone();
    root.repeat(
        3,
        move |asi, i| {
            l.push(format!("iter-{i}"));
            if i == 1 {
                let l2 = l.clone();
                asi.add(move |asi| {
                    l2.push("skipping");
                    asi.continue_loop(None)
                });
                let l2 = l.clone();
                asi.add(move |_asi| {
                    l2.push("not-reached");
                    Ok(())
                });
            }
            Ok(())
        },
        None,
    );

    root.execute();
    drive(&reactor, &clock);

    log.assert_eq(&["iter-0", "iter-1", "skipping", "iter-2"]);
}

#[test]
fn infinite_loop_breaks_by_signal() {
    let (reactor, clock) = virtual_reactor();
    let count = Rc::new(RefCell::new(0_u32));
    let mut root = AsyncSteps::new(&reactor);

    let c = count.clone();
    root.loop_(
        move |asi| {
            *c.borrow_mut() += 1;
            if *c.borrow() == 100 {
                return asi.break_loop(None);
            }
            Ok(())
        },
        None,
    );

    root.execute();
    drive(&reactor, &clock);

    assert_eq!(*count.borrow(), 100);
    assert_eq!(root.status(), RootStatus::Finished);
}

#[test]
fn for_each_visits_sequence_with_indices() {
    let (reactor, clock) = virtual_reactor();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let mut root = AsyncSteps::new(&reactor);

    let s = seen.clone();
    root.for_each(
        vec!["a", "b", "c"],
        move |_asi, i, item| {
            s.borrow_mut().push((i, item));
            Ok(())
        },
        None,
    );

    root.execute();
    drive(&reactor, &clock);

    assert_eq!(seen.borrow().as_slice(), [(0, "a"), (1, "b"), (2, "c")]);
}

#[test]
fn for_each_kv_visits_map_entries() {
    let (reactor, clock) = virtual_reactor();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let mut root = AsyncSteps::new(&reactor);

    let mut map = BTreeMap::new();
    map.insert("one".to_string(), 1_i32);
    map.insert("two".to_string(), 2_i32);

    let s = seen.clone();
    root.for_each_kv(
        map,
        move |_asi, key, value| {
            s.borrow_mut().push((key, value));
            Ok(())
        },
        None,
    );

    root.execute();
    drive(&reactor, &clock);

    assert_eq!(
        seen.borrow().as_slice(),
        [("one".to_string(), 1), ("two".to_string(), 2)]
    );
}

#[test]
fn labelled_break_reaches_the_outer_loop() {
    let (reactor, clock) = virtual_reactor();
    let log = EventLog::new();
    let mut root = AsyncSteps::new(&reactor);

    let l = log.clone();
    root.repeat(
        3,
        move |asi, i| {
            l.push(format!("outer-{i}"));
            let l2 = l.clone();
            asi.repeat(
                3,
                move |asi, j| {
                    l2.push(format!("inner-{j}"));
                    if j == 1 {
                        return asi.break_loop(Some("outer"));
                    }
                    Ok(())
                },
                None,
            );
            Ok(())
        },
        Some("outer"),
    );

    root.execute();
    drive(&reactor, &clock);

    log.assert_eq(&["outer-0", "inner-0", "inner-1"]);
    assert_eq!(root.status(), RootStatus::Finished);
}

#[test]
fn labelled_continue_restarts_the_outer_loop() {
    let (reactor, clock) = virtual_reactor();
    let log = EventLog::new();
    let mut root = AsyncSteps::new(&reactor);

    let l = log.clone();
    root.repeat(
        2,
        move |asi, i| {
            l.push(format!("outer-{i}"));
            let l2 = l.clone();
            asi.repeat(
                5,
                move |asi, j| {
                    l2.push(format!("inner-{i}-{j}"));
                    if j == 0 {
                        return asi.continue_loop(Some("outer"));
                    }
                    Ok(())
                },
                None,
            );
            Ok(())
        },
        Some("outer"),
    );

    root.execute();
    drive(&reactor, &clock);

    log.assert_eq(&["outer-0", "inner-0-0", "outer-1", "inner-1-0"]);
    assert_eq!(root.status(), RootStatus::Finished);
}

#[test]
fn unmatched_label_surfaces_at_the_root() {
    let (reactor, clock) = virtual_reactor();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let mut root = AsyncSteps::new(&reactor);

    let s = seen.clone();
    root.state_mut().unhandled_error = Some(Box::new(move |code| {
        s.borrow_mut().push(code.as_str().to_string());
    }));
    root.repeat(
        3,
        |asi, _i| asi.break_loop(Some("nonexistent")),
        Some("actual"),
    );

    root.execute();
    drive(&reactor, &clock);

    assert_eq!(seen.borrow().as_slice(), [codes::LOOP_BREAK.as_str()]);
    assert_eq!(root.state().error_loop_label, Some("nonexistent"));
    assert_eq!(root.status(), RootStatus::Finished);
}

#[test]
fn loop_control_never_reaches_unrelated_handlers() {
    let (reactor, clock) = virtual_reactor();
    let log = EventLog::new();
    let mut root = AsyncSteps::new(&reactor);

    let l = log.clone();
    root.repeat(
        2,
        move |asi, i| {
            let l2 = l.clone();
            // A handler inside the loop body must not observe the sentinel.
            asi.add_catch(
                move |asi| {
                    if i == 1 {
                        return asi.break_loop(None);
                    }
                    Ok(())
                },
                move |_asi, code| {
                    l2.push(format!("leaked-{code}"));
                    Ok(())
                },
            );
            Ok(())
        },
        None,
    );

    root.execute();
    drive(&reactor, &clock);

    log.assert_eq(&[] as &[&str]);
    assert_eq!(root.status(), RootStatus::Finished);
}
