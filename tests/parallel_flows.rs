#![allow(missing_docs)]
//! Parallel sub-flow scheduling, join, and first-error cancellation.

mod common;

use std::cell::RefCell;
use std::rc::Rc;

use common::*;
use stepflow::{AsyncSteps, RootStatus};

#[test]
fn sub_flows_interleave_step_by_step() {
    let (reactor, clock) = virtual_reactor();
    let log = EventLog::new();
    let mut root = AsyncSteps::new(&reactor);

    let p = root.parallel();
    for name in ["a", "b", "c"] {
        let l = log.clone();
        p.add(move |asi| {
            l.push(format!("{name}-1"));
            let l2 = l.clone();
            asi.add(move |_asi| {
                l2.push(format!("{name}-2"));
                Ok(())
            });
            Ok(())
        });
    }
    let l = log.clone();
    root.add(move |_asi| {
        l.push("joined");
        Ok(())
    });

    root.execute();
    drive(&reactor, &clock);

    log.assert_eq(&[
        "a-1", "b-1", "c-1", "a-2", "b-2", "c-2", "joined",
    ]);
    assert_eq!(root.status(), RootStatus::Finished);
}

#[test]
fn sub_flows_share_parent_state() {
    let (reactor, clock) = virtual_reactor();
    let mut root = AsyncSteps::new(&reactor);

    root.state_set("order", Vec::<i32>::new());
    let p = root.parallel();
    for i in 1..=3_i32 {
        p.add(move |asi| {
            let mut order: Vec<i32> = asi.state_get("order").expect("order vec");
            order.push(i);
            asi.state_mut().set("order", order);
            Ok(())
        });
    }

    root.execute();
    drive(&reactor, &clock);

    assert_eq!(root.state_get::<Vec<i32>>("order"), Some(vec![1, 2, 3]));
}

#[test]
fn first_error_cancels_remaining_sub_flows() {
    let (reactor, clock) = virtual_reactor();
    let log = EventLog::new();
    let mut root = AsyncSteps::new(&reactor);

    let p = root.parallel_catch({
        let l = log.clone();
        move |asi, code| {
            assert_eq!(*code, "SomeError");
            l.push("parallel-onerr");
            asi.success();
            Ok(())
        }
    });

    let l = log.clone();
    p.add(move |asi| {
        l.push("1");
        let l2 = l.clone();
        asi.add(move |_asi| {
            l2.push("4");
            Ok(())
        });
        Ok(())
    });
    let l = log.clone();
    p.add(move |asi| {
        l.push("2");
        let l2 = l.clone();
        asi.add(move |asi| {
            l2.push("5");
            asi.error("SomeError")
        });
        Ok(())
    });
    let l = log.clone();
    p.add(move |asi| {
        l.push("3");
        let l2 = l.clone();
        asi.add(move |_asi| {
            l2.push("6");
            Ok(())
        });
        Ok(())
    });

    let l = log.clone();
    root.add(move |_asi| {
        l.push("after");
        Ok(())
    });

    root.execute();
    drive(&reactor, &clock);

    // Flow three's second step was cancelled by flow two's error.
    log.assert_eq(&["1", "2", "3", "4", "5", "parallel-onerr", "after"]);
    assert_eq!(root.status(), RootStatus::Finished);
}

#[test]
fn sub_flow_cancel_hooks_fire_on_sibling_error() {
    let (reactor, clock) = virtual_reactor();
    let log = EventLog::new();
    let mut root = AsyncSteps::new(&reactor);

    let p = root.parallel_catch({
        let l = log.clone();
        move |asi, code| {
            assert_eq!(*code, "E");
            l.push("recovered");
            asi.success();
            Ok(())
        }
    });

    // Flow one parks on an external event; it is cancelled by flow two.
    let l = log.clone();
    p.add(move |asi| {
        let l2 = l.clone();
        asi.set_cancel(move |_asi| l2.push("a-cancelled"));
        asi.wait_external();
        Ok(())
    });
    p.add(|asi| asi.error("E"));

    root.execute();
    drive(&reactor, &clock);

    log.assert_eq(&["a-cancelled", "recovered"]);
    assert_eq!(root.status(), RootStatus::Finished);
}

#[test]
fn empty_parallel_block_completes_immediately() {
    let (reactor, clock) = virtual_reactor();
    let log = EventLog::new();
    let mut root = AsyncSteps::new(&reactor);

    let _p = root.parallel();
    let l = log.clone();
    root.add(move |_asi| {
        l.push("after");
        Ok(())
    });

    root.execute();
    drive(&reactor, &clock);
    log.assert_eq(&["after"]);
}

#[test]
fn unrecovered_parallel_error_propagates() {
    let (reactor, clock) = virtual_reactor();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let mut root = AsyncSteps::new(&reactor);

    let s = seen.clone();
    root.state_mut().unhandled_error = Some(Box::new(move |code| {
        s.borrow_mut().push(code.as_str().to_string());
    }));
    let p = root.parallel();
    p.add(|_asi| Ok(()));
    p.add(|asi| asi.error("Unrecovered"));

    root.execute();
    drive(&reactor, &clock);

    assert_eq!(seen.borrow().as_slice(), ["Unrecovered"]);
    assert_eq!(root.status(), RootStatus::Finished);
}

#[test]
fn cancelling_the_root_cancels_sub_flows() {
    let (reactor, clock) = virtual_reactor();
    let log = EventLog::new();
    let mut root = AsyncSteps::new(&reactor);

    let p = root.parallel();
    for name in ["x", "y"] {
        let l = log.clone();
        p.add(move |asi| {
            let l2 = l.clone();
            asi.set_cancel(move |_asi| l2.push(format!("{name}-hook")));
            asi.wait_external();
            Ok(())
        });
    }

    root.execute();
    drive(&reactor, &clock);
    assert_eq!(root.status(), RootStatus::Running);

    root.cancel();
    let mut hooks = log.snapshot();
    hooks.sort();
    assert_eq!(hooks, ["x-hook", "y-hook"]);
    assert_eq!(root.status(), RootStatus::Cancelled);
}
