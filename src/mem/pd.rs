// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Per-device protection-domain registry.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU64, Ordering},
};

use dashmap::DashMap;
use once_cell::sync::Lazy;

/// Opaque handle to a protection domain, stable for the process lifetime
/// of the underlying device context.
#[derive(Debug, Clone)]
pub struct ProtectionDomain {
    pub id: u64,
    /// Opaque device-context identity this PD was created for (an address,
    /// file descriptor, or similar — never dereferenced by this crate).
    pub context: u64,
}

static NEXT_PD_ID: AtomicU64 = AtomicU64::new(1);

struct PdRegistry {
    by_context: DashMap<u64, Arc<ProtectionDomain>>,
    // Construction (first-insert race) is serialized; the data-plane path
    // (cache hit) only touches the lock-free DashMap.
    construct_lock: Mutex<()>,
}

static REGISTRY: Lazy<PdRegistry> = Lazy::new(|| PdRegistry {
    by_context: DashMap::new(),
    construct_lock: Mutex::new(()),
});

/// Idempotent cache keyed by device context.
pub fn get_pd(context: u64) -> Arc<ProtectionDomain> {
    if let Some(pd) = REGISTRY.by_context.get(&context) {
        return pd.clone();
    }
    let _guard = REGISTRY.construct_lock.lock().expect("pd registry poisoned");
    if let Some(pd) = REGISTRY.by_context.get(&context) {
        return pd.clone();
    }
    let pd = Arc::new(ProtectionDomain {
        id: NEXT_PD_ID.fetch_add(1, Ordering::Relaxed),
        context,
    });
    REGISTRY.by_context.insert(context, pd.clone());
    pd
}
