// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Filesystem-device façade shape: API surface only, so the
//! transport's `fsdev_io_pool_size`/`fsdev_io_cache_size` options
//! type-check against something concrete. No target or filesystem logic
//! is implemented — that's an explicit non-goal.

use std::ops::Range;

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FsdevError {
    #[error("fsdev façade has no production implementation")]
    NotImplemented,
}

type Result<T> = std::result::Result<T, FsdevError>;

#[derive(Debug, Clone, Copy, Default)]
pub struct FsdevOpenOptions {
    pub max_write: u32,
    pub writeback_cache_enabled: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct FsdevHandle(pub u64);

#[derive(Debug, Clone, Copy, Default)]
pub struct FsdevAttr {
    pub size: u64,
    pub blocks: u64,
}

pub trait FsdevFacade {
    fn open(&self, path: &str, opts: FsdevOpenOptions) -> Result<FsdevHandle>;
    fn getattr(&self, handle: &FsdevHandle) -> Result<FsdevAttr>;
    fn read(&self, handle: &FsdevHandle, offset: u64, buf: &mut [u8]) -> Result<usize>;
    fn write(&self, handle: &FsdevHandle, offset: u64, buf: &[u8]) -> Result<usize>;
    fn setxattr(&self, handle: &FsdevHandle, name: &str, value: &[u8]) -> Result<()>;
    fn lock(&self, handle: &FsdevHandle, range: Range<u64>) -> Result<()>;
}

/// Shape-only façade: every method returns `NotImplemented`.
#[derive(Debug, Default)]
pub struct NullFsdev;

impl FsdevFacade for NullFsdev {
    fn open(&self, _path: &str, _opts: FsdevOpenOptions) -> Result<FsdevHandle> {
        Err(FsdevError::NotImplemented)
    }

    fn getattr(&self, _handle: &FsdevHandle) -> Result<FsdevAttr> {
        Err(FsdevError::NotImplemented)
    }

    fn read(&self, _handle: &FsdevHandle, _offset: u64, _buf: &mut [u8]) -> Result<usize> {
        Err(FsdevError::NotImplemented)
    }

    fn write(&self, _handle: &FsdevHandle, _offset: u64, _buf: &[u8]) -> Result<usize> {
        Err(FsdevError::NotImplemented)
    }

    fn setxattr(&self, _handle: &FsdevHandle, _name: &str, _value: &[u8]) -> Result<()> {
        Err(FsdevError::NotImplemented)
    }

    fn lock(&self, _handle: &FsdevHandle, _range: Range<u64>) -> Result<()> {
        Err(FsdevError::NotImplemented)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_method_is_not_implemented() {
        let fsdev = NullFsdev;
        let handle = FsdevHandle(0);
        assert_eq!(fsdev.open("/x", FsdevOpenOptions::default()), Err(FsdevError::NotImplemented));
        assert_eq!(fsdev.getattr(&handle), Err(FsdevError::NotImplemented));
    }
}
