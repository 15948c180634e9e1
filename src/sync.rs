// Synchronization primitive shim.
//
// Under `cfg(loom)`, re-exports from the `loom` crate so the global manager's
// locking can be model-checked. Otherwise, re-exports from `std`.
//
// Files in this crate import atomics and locks through this module. A direct
// `use std::sync::Mutex` would bypass loom's scheduler.
#![allow(unused_imports, unused_macros)]

// ---------------------------------------------------------------------------
// atomic
// ---------------------------------------------------------------------------
pub(crate) mod atomic {
    #[cfg(loom)]
    pub(crate) use loom::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};

    #[cfg(not(loom))]
    pub(crate) use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
}

// ---------------------------------------------------------------------------
// sync (Mutex, Arc, RwLock)
// ---------------------------------------------------------------------------
#[cfg(loom)]
pub(crate) use loom::sync::{Arc, Mutex, RwLock};

#[cfg(not(loom))]
pub(crate) use std::sync::{Arc, Mutex, RwLock};

// ---------------------------------------------------------------------------
// thread
// ---------------------------------------------------------------------------
pub(crate) mod thread {
    #[cfg(loom)]
    pub(crate) use loom::thread::{JoinHandle, spawn};

    #[cfg(not(loom))]
    pub(crate) use std::thread::{JoinHandle, spawn};
}

// ---------------------------------------------------------------------------
// OnceLock shim
//
// loom does not provide OnceLock. Under cfg(loom) we use a std
// Mutex<Option<T>> because OnceLock is used in `static` items and loom's
// Mutex::new() is not const. The one-shot initialisation is not a
// synchronization point loom needs to explore.
// ---------------------------------------------------------------------------
#[cfg(not(loom))]
pub(crate) use std::sync::OnceLock;

#[cfg(loom)]
pub(crate) struct OnceLock<T> {
    inner: std::sync::Mutex<Option<T>>,
}

#[cfg(loom)]
impl<T> OnceLock<T> {
    pub(crate) const fn new() -> Self {
        Self {
            inner: std::sync::Mutex::new(None),
        }
    }

    pub(crate) fn get_or_init<F: FnOnce() -> T>(&self, f: F) -> &T {
        let mut guard = self.inner.lock().unwrap();
        let ptr: *const T = guard.get_or_insert_with(f);
        // Safety: the value is never moved or dropped while &self is live.
        unsafe { &*ptr }
    }
}

#[cfg(loom)]
// Safety: access is serialised by the inner Mutex.
unsafe impl<T: Send> Sync for OnceLock<T> {}

// ---------------------------------------------------------------------------
// Static initialisation helpers
//
// loom atomics and locks are not const-constructible. These macros create
// statics that work under both loom and std.
// ---------------------------------------------------------------------------

/// Declare a `static` atomic. Under std, uses `const` init. Under loom,
/// uses `loom::lazy_static!` so the value is re-created for each model run.
///
/// Usage: `static_atomic! { [pub] static NAME: Type = init_expr; }`
#[allow(unused_macro_rules)]
macro_rules! static_atomic {
    (pub static $NAME:ident : $Ty:ty = $init:expr ;) => {
        #[cfg(not(loom))]
        pub static $NAME: $Ty = $init;

        #[cfg(loom)]
        loom::lazy_static! {
            pub static ref $NAME: $Ty = $init;
        }
    };
    (static $NAME:ident : $Ty:ty = $init:expr ;) => {
        #[cfg(not(loom))]
        static $NAME: $Ty = $init;

        #[cfg(loom)]
        loom::lazy_static! {
            static ref $NAME: $Ty = $init;
        }
    };
}
pub(crate) use static_atomic;

/// Declare a `static` `RwLock`. Same scheme as [`static_atomic!`].
#[allow(unused_macro_rules)]
macro_rules! static_rwlock {
    (pub static $NAME:ident : $Ty:ty = $init:expr ;) => {
        #[cfg(not(loom))]
        pub static $NAME: $Ty = $init;

        #[cfg(loom)]
        loom::lazy_static! {
            pub static ref $NAME: $Ty = $init;
        }
    };
    (static $NAME:ident : $Ty:ty = $init:expr ;) => {
        #[cfg(not(loom))]
        static $NAME: $Ty = $init;

        #[cfg(loom)]
        loom::lazy_static! {
            static ref $NAME: $Ty = $init;
        }
    };
}
pub(crate) use static_rwlock;
