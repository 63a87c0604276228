//! Opaque `jlong` handles for engine objects owned on the native side.
//!
//! The host never sees an address: a handle is a key into an arena. Unknown
//! and zero handles resolve to nothing, so double frees are no-ops.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, PoisonError};

use jni::sys::jlong;

pub struct HandleArena<T> {
    name: &'static str,
    next: AtomicI64,
    items: Mutex<HashMap<jlong, T>>,
}

impl<T: Clone> HandleArena<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            next: AtomicI64::new(1),
            items: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn insert(&self, item: T) -> jlong {
        let handle = self.next.fetch_add(1, Ordering::Relaxed);
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle, item);
        handle
    }

    pub fn get(&self, handle: jlong) -> Option<T> {
        if handle == 0 {
            return None;
        }
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&handle)
            .cloned()
    }

    pub fn remove(&self, handle: jlong) -> Option<T> {
        if handle == 0 {
            return None;
        }
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle)
    }

    pub fn len(&self) -> usize {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
