pub(crate) mod binned;
pub(crate) mod chunk;
pub(crate) mod global_cache;
pub(crate) mod integration;
pub(crate) mod manager;
pub(crate) mod mip_map;
pub(crate) mod size_class;
pub(crate) mod stats;
pub(crate) mod thread_cache;
#[cfg(debug_assertions)]
pub(crate) mod validate;
pub(crate) mod vm;
pub(crate) mod vm_cache;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
