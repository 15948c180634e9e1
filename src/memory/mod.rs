pub(crate) mod chunk;
pub(crate) mod config;
pub(crate) mod error;
pub(crate) mod manager;
pub(crate) mod map;
pub(crate) mod stats;
pub(crate) mod util;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}

#[cfg(all(test, not(loom)))]
pub(crate) fn init_test_logging() {
    drop(env_logger::builder().is_test(true).try_init());
}
