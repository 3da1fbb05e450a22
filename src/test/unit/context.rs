use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crate::error::Error;
use crate::test::support::{RecordingDriver, context};
use crate::Event;

#[test]
fn test_device_indices_match_positions() {
    let driver = RecordingDriver::new();
    let ctx = context(&driver, 4);

    assert_eq!(ctx.device_count(), 4);
    for (position, device) in ctx.devices().iter().enumerate() {
        assert_eq!(device.index(), position);
    }
    assert_eq!(ctx.device(3).unwrap().index(), 3);
}

#[test]
fn test_out_of_range_device_lookup_fails() {
    let driver = RecordingDriver::new();
    let ctx = context(&driver, 2);

    let err = ctx.device(2).unwrap_err();
    assert!(matches!(err, Error::InvalidDevice { index: 2, count: 2 }));
}

#[test]
#[should_panic(expected = "at least one device")]
fn test_empty_context_panics() {
    let driver = RecordingDriver::new();
    context(&driver, 0);
}

#[test]
fn test_completed_event_does_not_block() {
    let driver = RecordingDriver::new();
    let ctx = context(&driver, 1);

    let event = Event::completed(ctx.device(0).unwrap().clone());
    assert!(event.is_complete());
    event.wait();
}

#[test]
fn test_event_wait_blocks_until_complete() {
    let driver = RecordingDriver::new();
    let ctx = context(&driver, 1);

    let event = Event::new(ctx.device(0).unwrap().clone());
    assert!(!event.is_complete());

    let woke = Arc::new(AtomicBool::new(false));
    let waiter = {
        let event = event.clone();
        let woke = Arc::clone(&woke);
        thread::spawn(move || {
            event.wait();
            woke.store(true, Ordering::Release);
        })
    };

    thread::sleep(Duration::from_millis(50));
    assert!(!woke.load(Ordering::Acquire));

    event.complete();
    waiter.join().unwrap();
    assert!(woke.load(Ordering::Acquire));
    assert!(event.is_complete());
}

#[test]
fn test_event_remembers_origin_device() {
    let driver = RecordingDriver::new();
    let ctx = context(&driver, 3);

    let event = Event::new(ctx.device(2).unwrap().clone());
    assert_eq!(event.device().index(), 2);
}
