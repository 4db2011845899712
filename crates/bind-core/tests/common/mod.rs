//! Shared helpers for integration tests.

#![allow(dead_code)]

use bind_core::{Attributes, CollectionEvent, ModelEvent};
use serde_json::Value;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Once;

static TRACING: Once = Once::new();

/// Install a test subscriber once. Filter with `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn bag(value: Value) -> Attributes {
    value
        .as_object()
        .cloned()
        .expect("test attributes must be an object")
}

/// Names of the events seen, in order.
pub type EventLog = Rc<RefCell<Vec<&'static str>>>;

pub fn model_log() -> (EventLog, impl Fn(ModelEvent)) {
    let log: EventLog = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&log);
    (log, move |event: ModelEvent| sink.borrow_mut().push(event.name()))
}

pub fn collection_log() -> (EventLog, impl Fn(CollectionEvent)) {
    let log: EventLog = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&log);
    (log, move |event: CollectionEvent| sink.borrow_mut().push(event.name()))
}

pub fn count(log: &EventLog, name: &str) -> usize {
    log.borrow().iter().filter(|n| **n == name).count()
}
