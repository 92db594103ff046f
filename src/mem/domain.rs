// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Memory-domain singleton registry, one handle per (pd, domain-type),
//! refcounted so the last release can tear the domain down.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU64, Ordering},
};

use dashmap::DashMap;
use once_cell::sync::Lazy;

use crate::mem::pd::ProtectionDomain;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DomainType {
    Tcp,
    Rdma,
}

struct MemoryDomainInner {
    pd: Arc<ProtectionDomain>,
    kind: DomainType,
    refs: AtomicU64,
}

/// A handle to a shared memory domain. Cloning bumps the refcount; drop
/// decrements it. The domain itself is torn down only once the refcount
/// reaches zero, at which point the registry entry is removed.
#[derive(Debug)]
pub struct MemoryDomain(Arc<MemoryDomainInner>);

impl MemoryDomain {
    pub fn pd(&self) -> &Arc<ProtectionDomain> {
        &self.0.pd
    }

    pub fn kind(&self) -> DomainType {
        self.0.kind
    }

    pub fn ref_count(&self) -> u64 {
        self.0.refs.load(Ordering::Acquire)
    }
}

impl Clone for MemoryDomain {
    fn clone(&self) -> Self {
        self.0.refs.fetch_add(1, Ordering::AcqRel);
        MemoryDomain(self.0.clone())
    }
}

impl Drop for MemoryDomain {
    fn drop(&mut self) {
        let remaining = self.0.refs.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 {
            REGISTRY.remove(&(self.0.pd.id, self.0.kind));
        }
    }
}

type DomainKey = (u64, DomainType);

static REGISTRY: Lazy<DashMap<DomainKey, Arc<MemoryDomainInner>>> = Lazy::new(DashMap::new);
static CONSTRUCT_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// `get_memory_domain(pd, type) -> handle`: returns the existing domain
/// for this (pd, type) pair, bumping its refcount, or constructs a fresh
/// one with refcount 1.
pub fn get_memory_domain(pd: Arc<ProtectionDomain>, kind: DomainType) -> MemoryDomain {
    let key = (pd.id, kind);
    if let Some(existing) = REGISTRY.get(&key) {
        existing.refs.fetch_add(1, Ordering::AcqRel);
        return MemoryDomain(existing.clone());
    }
    let _guard = CONSTRUCT_LOCK.lock().expect("memory domain registry poisoned");
    if let Some(existing) = REGISTRY.get(&key) {
        existing.refs.fetch_add(1, Ordering::AcqRel);
        return MemoryDomain(existing.clone());
    }
    let inner = Arc::new(MemoryDomainInner {
        pd,
        kind,
        refs: AtomicU64::new(1),
    });
    REGISTRY.insert(key, inner.clone());
    MemoryDomain(inner)
}
