//! Maps guest physical address ranges to registered devices (§4.B).
//!
//! An ordered interval map keyed by `base`, so `lookup` is a single
//! `BTreeMap::range` probe rather than a linear scan over every device. The
//! map is generic over the per-device handle `H` the caller wants to recover
//! on a hit (the façade plugs in its own `(shadow window, transport)` pair;
//! this crate has no business knowing about either).

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("range [{base:#x}, {base:#x}+{size:#x}) overlaps an existing device")]
    Overlap { base: u64, size: u64 },
    #[error("base {base:#x} / size {size:#x} is not page-aligned")]
    Align { base: u64, size: u64 },
    #[error("device id {0} is already registered")]
    DuplicateId(u32),
    #[error("address {0:#x} is not covered by any registered device")]
    Unmapped(u64),
    #[error("device id {0} is not registered")]
    Unknown(u32),
}

struct Entry<H> {
    device_id: u32,
    size: u64,
    handle: H,
}

/// A successful [`Registry::lookup`]: the device that covers the queried
/// address, and the byte offset of the address within its range.
#[derive(Debug, Clone, Copy)]
pub struct Hit<H> {
    pub device_id: u32,
    pub offset: u64,
    pub handle: H,
}

pub struct Registry<H> {
    by_base: RwLock<BTreeMap<u64, Entry<H>>>,
    id_to_base: RwLock<HashMap<u32, u64>>,
}

impl<H: Clone> Default for Registry<H> {
    fn default() -> Self {
        Registry {
            by_base: RwLock::new(BTreeMap::new()),
            id_to_base: RwLock::new(HashMap::new()),
        }
    }
}

impl<H: Clone> Registry<H> {
    pub fn new() -> Self {
        Self::default()
    }

    fn page_size() -> u64 {
        // SAFETY: sysconf with a valid name never fails in a way that matters here.
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as u64 }
    }

    fn is_aligned(base: u64, size: u64) -> bool {
        let page = Self::page_size();
        page != 0 && base % page == 0 && size % page == 0
    }

    /// Shared by [`insert`](Registry::insert) and
    /// [`check_available`](Registry::check_available): overlap is checked
    /// *before* alignment, so a range that is both overlapping and
    /// misaligned reports `OVERLAP`, not `ALIGN` (spec §8 S4 — the existing
    /// device is still the reason the registration can't proceed, whether or
    /// not the new range happens to also be misaligned).
    fn validate(
        id_to_base: &HashMap<u32, u64>,
        by_base: &BTreeMap<u64, Entry<H>>,
        device_id: u32,
        base: u64,
        size: u64,
    ) -> Result<(), RegistryError> {
        let end = base + size;
        if let Some((&prev_base, prev)) = by_base.range(..base).next_back() {
            if prev_base + prev.size > base {
                return Err(RegistryError::Overlap { base, size });
            }
        }
        if let Some((&next_base, _)) = by_base.range(base..).next() {
            if next_base < end {
                return Err(RegistryError::Overlap { base, size });
            }
        }

        if size == 0 || !Self::is_aligned(base, size) {
            return Err(RegistryError::Align { base, size });
        }

        if id_to_base.contains_key(&device_id) {
            return Err(RegistryError::DuplicateId(device_id));
        }

        Ok(())
    }

    /// Registers `device_id` for `[base, base+size)`. Fails if the range
    /// overlaps an existing device, is misaligned, or `device_id` is already
    /// in use — ids are registration handles, not reusable without an
    /// explicit [`Registry::remove`] first.
    pub fn insert(&self, device_id: u32, base: u64, size: u64, handle: H) -> Result<(), RegistryError> {
        let mut id_to_base = self.id_to_base.write().unwrap();
        let mut by_base = self.by_base.write().unwrap();

        Self::validate(&id_to_base, &by_base, device_id, base, size)?;

        by_base.insert(
            base,
            Entry {
                device_id,
                size,
                handle,
            },
        );
        id_to_base.insert(device_id, base);
        Ok(())
    }

    /// Checks whether `device_id`/`[base, base+size)` could be registered
    /// right now, without mutating anything. Callers that must allocate other
    /// per-device resources (the façade's shadow window, the transport) call
    /// this first so a registry-level rejection is detected before those
    /// resources are touched.
    pub fn check_available(&self, device_id: u32, base: u64, size: u64) -> Result<(), RegistryError> {
        let id_to_base = self.id_to_base.read().unwrap();
        let by_base = self.by_base.read().unwrap();
        Self::validate(&id_to_base, &by_base, device_id, base, size)
    }

    /// Finds the device covering `addr`, if any, along with the offset of
    /// `addr` within that device's range.
    pub fn lookup(&self, addr: u64) -> Result<Hit<H>, RegistryError> {
        let by_base = self.by_base.read().unwrap();
        let (&base, entry) = by_base
            .range(..=addr)
            .next_back()
            .ok_or(RegistryError::Unmapped(addr))?;
        if addr >= base + entry.size {
            return Err(RegistryError::Unmapped(addr));
        }
        Ok(Hit {
            device_id: entry.device_id,
            offset: addr - base,
            handle: entry.handle.clone(),
        })
    }

    /// Removes `device_id`. Fails with [`RegistryError::Unknown`] if it was
    /// never registered (or was already removed).
    pub fn remove(&self, device_id: u32) -> Result<H, RegistryError> {
        let mut id_to_base = self.id_to_base.write().unwrap();
        let base = id_to_base
            .remove(&device_id)
            .ok_or(RegistryError::Unknown(device_id))?;
        let mut by_base = self.by_base.write().unwrap();
        let entry = by_base.remove(&base).expect("id_to_base/by_base out of sync");
        Ok(entry.handle)
    }

    pub fn len(&self) -> usize {
        self.by_base.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
