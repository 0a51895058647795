#![allow(missing_docs)]
//! Timeout arming, firing, and cancellation-on-completion.

mod common;

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use common::*;
use stepflow::{codes, AsyncSteps, RootStatus};

#[test]
fn timeout_raises_after_deadline() {
    let (reactor, clock) = virtual_reactor();
    let log = EventLog::new();
    let mut root = AsyncSteps::new(&reactor);

    let l = log.clone();
    root.add_catch(
        move |asi| {
            l.push("armed");
            asi.set_timeout(Duration::from_millis(50));
            asi.wait_external();
            Ok(())
        },
        {
            let l = log.clone();
            move |asi, code| {
                assert_eq!(*code, codes::TIMEOUT);
                l.push("timed-out");
                asi.success();
                Ok(())
            }
        },
    );

    root.execute();

    // Nothing fires before the deadline.
    drive_for(&reactor, &clock, Duration::from_millis(49));
    log.assert_eq(&["armed"]);

    clock.advance(Duration::from_millis(1));
    drive(&reactor, &clock);
    log.assert_eq(&["armed", "timed-out"]);
    assert_eq!(root.status(), RootStatus::Finished);
}

#[test]
fn unhandled_timeout_reaches_the_hook() {
    let (reactor, clock) = virtual_reactor();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let mut root = AsyncSteps::new(&reactor);

    let s = seen.clone();
    root.state_mut().unhandled_error = Some(Box::new(move |code| {
        s.borrow_mut().push(code.as_str().to_string());
    }));
    root.add(|asi| {
        asi.set_timeout(Duration::from_millis(50));
        asi.wait_external();
        Ok(())
    });

    root.execute();
    drive(&reactor, &clock);

    assert_eq!(seen.borrow().as_slice(), [codes::TIMEOUT.as_str()]);
}

#[test]
fn completion_cancels_the_timeout() {
    let (reactor, clock) = virtual_reactor();
    let mut root = AsyncSteps::new(&reactor);

    let handle_slot = Rc::new(RefCell::new(None));
    let slot = handle_slot.clone();
    root.add_catch(
        move |asi| {
            asi.set_timeout(Duration::from_millis(50));
            asi.wait_external();
            *slot.borrow_mut() = Some(asi.completion_handle());
            Ok(())
        },
        |_asi, _code| panic!("timeout must not fire after completion"),
    );

    root.execute();
    drive_for(&reactor, &clock, Duration::from_millis(10));

    let handle = handle_slot.borrow_mut().take().expect("handle stored");
    assert!(handle.success());

    // Long after the original deadline, nothing fires.
    drive(&reactor, &clock);
    clock.advance(Duration::from_millis(500));
    reactor.iterate();
    assert_eq!(root.status(), RootStatus::Finished);
}

#[test]
fn timeout_unwinds_through_running_children() {
    let (reactor, clock) = virtual_reactor();
    let log = EventLog::new();
    let mut root = AsyncSteps::new(&reactor);

    let l = log.clone();
    root.add_catch(
        move |asi| {
            asi.set_timeout(Duration::from_millis(20));
            // The child loops forever; only the timeout ends it.
            let l2 = l.clone();
            asi.loop_(
                move |_asi| {
                    if l2.snapshot().is_empty() {
                        l2.push("looping");
                    }
                    Ok(())
                },
                None,
            );
            Ok(())
        },
        {
            let l = log.clone();
            move |asi, code| {
                assert_eq!(*code, codes::TIMEOUT);
                l.push("stopped");
                asi.success();
                Ok(())
            }
        },
    );

    root.execute();

    // Drain only zero-delay work first, then let the deadline pass.
    for _ in 0..100 {
        reactor.iterate();
    }
    clock.advance(Duration::from_millis(20));
    drive(&reactor, &clock);

    log.assert_eq(&["looping", "stopped"]);
    assert_eq!(root.status(), RootStatus::Finished);
}

#[test]
fn rearming_replaces_the_previous_timeout() {
    let (reactor, clock) = virtual_reactor();
    let log = EventLog::new();
    let mut root = AsyncSteps::new(&reactor);

    let l = log.clone();
    root.add_catch(
        move |asi| {
            asi.set_timeout(Duration::from_millis(10));
            asi.set_timeout(Duration::from_millis(100));
            asi.wait_external();
            l.push("armed");
            Ok(())
        },
        {
            let l = log.clone();
            move |asi, code| {
                assert_eq!(*code, codes::TIMEOUT);
                l.push("fired");
                asi.success();
                Ok(())
            }
        },
    );

    root.execute();

    // The first (replaced) deadline passes silently.
    drive_for(&reactor, &clock, Duration::from_millis(50));
    log.assert_eq(&["armed"]);

    clock.advance(Duration::from_millis(50));
    drive(&reactor, &clock);
    log.assert_eq(&["armed", "fired"]);
}
