pub(crate) mod adapter;
pub(crate) mod arena;
pub(crate) mod error;
pub(crate) mod global;
pub(crate) mod occupancy;
pub(crate) mod size_class;
pub(crate) mod slots;
pub mod stats;
pub(crate) mod vm;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
