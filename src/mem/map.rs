// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Per-domain memory-region cache producing (local-key, remote-key)
//! translations for a virtual-address range.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU32, Ordering},
};

use bitflags::bitflags;
use dashmap::DashMap;
use once_cell::sync::Lazy;

use crate::{error::MemRegistryError, mem::pd::ProtectionDomain};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccessFlags: u32 {
        const LOCAL_WRITE    = 0x1;
        const REMOTE_READ    = 0x2;
        const REMOTE_WRITE   = 0x4;
        const RELAXED_ORDERING = 0x8;
    }
}

/// A single registered memory region: the [addr, addr+len) span and the
/// keys a remote peer (or local HW) must present to touch it.
#[derive(Debug, Clone, Copy)]
pub struct MemRegion {
    pub addr: u64,
    pub len: u64,
    pub local_key: u32,
    pub remote_key: u32,
    pub access: AccessFlags,
}

impl MemRegion {
    fn contains_start(&self, addr: u64) -> bool {
        addr >= self.addr && addr < self.addr.saturating_add(self.len)
    }

    fn covers(&self, addr: u64, len: u64) -> bool {
        addr >= self.addr && addr.saturating_add(len) <= self.addr.saturating_add(self.len)
    }
}

/// Result of `translate`.
#[derive(Debug, Clone, Copy)]
pub struct Translation {
    pub local_key: u32,
    pub remote_key: u32,
    pub addr: u64,
    pub len: u64,
}

struct MemMapInner {
    pd: Arc<ProtectionDomain>,
    access: AccessFlags,
    /// Sorted by `addr`; linear scan is fine, registration counts are
    /// small relative to the request hot path.
    regions: Mutex<Vec<MemRegion>>,
}

/// A mem-map: builds or reuses memory regions for one (PD, access-flags)
/// pair, keyed the way `create_mem_map` specifies.
#[derive(Clone)]
pub struct MemMap(Arc<MemMapInner>);

static NEXT_KEY: AtomicU32 = AtomicU32::new(1);

impl MemMap {
    /// Install a region covering `[addr, addr+len)`, as if the process
    /// allocator's notify callback had just registered that span. IWARP
    /// devices imply `REMOTE_WRITE`; `RELAXED_ORDERING` is requested when
    /// the caller's flags already ask for it.
    pub fn register_region(&self, addr: u64, len: u64, is_iwarp: bool) -> MemRegion {
        let mut access = self.0.access;
        if is_iwarp {
            access |= AccessFlags::REMOTE_WRITE;
        }
        let region = MemRegion {
            addr,
            len,
            local_key: NEXT_KEY.fetch_add(1, Ordering::Relaxed),
            remote_key: NEXT_KEY.fetch_add(1, Ordering::Relaxed),
            access,
        };
        let mut regions = self.0.regions.lock().expect("mem map regions poisoned");
        regions.push(region);
        region
    }

    pub fn unregister_region(&self, addr: u64) {
        let mut regions = self.0.regions.lock().expect("mem map regions poisoned");
        regions.retain(|r| r.addr != addr);
    }

    /// `translate(map, addr, len) -> {local_key, remote_key, addr, len}`.
    /// Translation must cover the entire requested range; shorter coverage
    /// is an error.
    pub fn translate(&self, addr: u64, len: u64) -> Result<Translation, MemRegistryError> {
        let regions = self.0.regions.lock().expect("mem map regions poisoned");
        let region = regions
            .iter()
            .find(|r| r.contains_start(addr))
            .ok_or(MemRegistryError::NoRegion)?;
        if !region.covers(addr, len) {
            return Err(MemRegistryError::ShortTranslation);
        }
        Ok(Translation {
            local_key: region.local_key,
            remote_key: region.remote_key,
            addr,
            len,
        })
    }

    pub fn pd(&self) -> &Arc<ProtectionDomain> {
        &self.0.pd
    }
}

type MapKey = (u64, u32);

static MAPS: Lazy<DashMap<MapKey, MemMap>> = Lazy::new(DashMap::new);

/// `create_mem_map(pd, access_flags) -> map`: builds or reuses a mem-map,
/// keyed on (pd, access_flags).
pub fn create_mem_map(pd: Arc<ProtectionDomain>, access: AccessFlags) -> MemMap {
    let key = (pd.id, access.bits());
    if let Some(existing) = MAPS.get(&key) {
        return existing.clone();
    }
    let map = MemMap(Arc::new(MemMapInner {
        pd,
        access,
        regions: Mutex::new(Vec::new()),
    }));
    MAPS.entry(key).or_insert(map).clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::pd::get_pd;

    #[test]
    fn translate_requires_full_coverage() {
        let pd = get_pd(0x1111);
        let map = create_mem_map(pd, AccessFlags::LOCAL_WRITE);
        map.register_region(0x1000, 0x1000, false);

        let t = map.translate(0x1000, 0x100).expect("covered");
        assert_eq!(t.addr, 0x1000);

        let err = map.translate(0x1f00, 0x200).unwrap_err();
        assert_eq!(err, MemRegistryError::ShortTranslation);
    }

    #[test]
    fn translate_outside_any_region_is_no_region() {
        let pd = get_pd(0x2222);
        let map = create_mem_map(pd, AccessFlags::LOCAL_WRITE);
        map.register_region(0x1000, 0x1000, false);

        let err = map.translate(0x5000, 0x10).unwrap_err();
        assert_eq!(err, MemRegistryError::NoRegion);
    }

    #[test]
    fn iwarp_registration_implies_remote_write() {
        let pd = get_pd(0x3333);
        let map = create_mem_map(pd, AccessFlags::LOCAL_WRITE);
        let region = map.register_region(0x1000, 0x1000, true);
        assert!(region.access.contains(AccessFlags::REMOTE_WRITE));
    }

    #[test]
    fn create_mem_map_is_keyed_on_pd_and_access() {
        let pd = get_pd(0x4444);
        let a = create_mem_map(pd.clone(), AccessFlags::LOCAL_WRITE);
        let b = create_mem_map(pd.clone(), AccessFlags::LOCAL_WRITE);
        a.register_region(0x2000, 0x1000, false);
        // Same (pd, access) key must return the same underlying map.
        assert!(b.translate(0x2000, 0x10).is_ok());

        let c = create_mem_map(pd, AccessFlags::REMOTE_READ);
        assert!(c.translate(0x2000, 0x10).is_err());
    }

    #[test]
    fn unregister_region_removes_coverage() {
        let pd = get_pd(0x5555);
        let map = create_mem_map(pd, AccessFlags::LOCAL_WRITE);
        map.register_region(0x9000, 0x1000, false);
        assert!(map.translate(0x9000, 0x10).is_ok());

        map.unregister_region(0x9000);
        assert_eq!(map.translate(0x9000, 0x10).unwrap_err(), MemRegistryError::NoRegion);
    }
}
