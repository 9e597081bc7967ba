//! Reserves and releases the protected virtual memory windows backing
//! registered devices (§4.C).
//!
//! A reservation is an anonymous, `PROT_NONE` mapping at an exact address:
//! any load or store the driver issues against it raises `SIGSEGV`/`SIGBUS`
//! synchronously, which is the entire mechanism the trap handler depends on.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShadowError {
    #[error("base {base:#x} / size {size:#x} is not page-aligned")]
    Align { base: u64, size: u64 },
    #[error("address {0:#x} is already mapped by another reservation")]
    AddressTaken(u64),
    #[error("mmap/munmap failed: {0}")]
    Io(#[source] std::io::Error),
}

/// A live reservation. Dropping this without calling [`release`] leaks the
/// mapping for the lifetime of the process — callers must release explicitly,
/// the same way the registry ties a device's lifecycle to `unregister_device`.
#[derive(Debug)]
pub struct ShadowWindow {
    base: u64,
    size: u64,
}

impl ShadowWindow {
    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

fn page_size() -> u64 {
    // SAFETY: sysconf with a valid name never fails in a way that matters here.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as u64 }
}

fn is_aligned(base: u64, size: u64) -> bool {
    let page = page_size();
    page != 0 && base % page == 0 && size % page == 0
}

#[cfg(target_os = "linux")]
fn reserve_flags() -> libc::c_int {
    libc::MAP_FIXED_NOREPLACE | libc::MAP_PRIVATE | libc::MAP_ANONYMOUS
}

#[cfg(not(target_os = "linux"))]
fn reserve_flags() -> libc::c_int {
    // No MAP_FIXED_NOREPLACE on this target: map without MAP_FIXED (the
    // kernel treats `base` as a hint) and verify placement below, unmapping
    // and reporting AddressTaken on a mismatch rather than ever clobbering
    // whatever was already there.
    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS
}

/// Reserves `[base, base+size)`, removing all access permissions. Fails with
/// [`ShadowError::Align`] if `base`/`size` are not page-size multiples, or
/// [`ShadowError::AddressTaken`] if the host cannot place the mapping at
/// exactly `base`.
pub fn reserve(base: u64, size: u64) -> Result<ShadowWindow, ShadowError> {
    if size == 0 || !is_aligned(base, size) {
        return Err(ShadowError::Align { base, size });
    }

    let addr = unsafe {
        libc::mmap(
            base as *mut libc::c_void,
            size as usize,
            libc::PROT_NONE,
            reserve_flags(),
            -1,
            0,
        )
    };

    if addr == libc::MAP_FAILED {
        let err = std::io::Error::last_os_error();
        return match err.raw_os_error() {
            #[cfg(target_os = "linux")]
            Some(e) if e == libc::EEXIST => Err(ShadowError::AddressTaken(base)),
            _ => Err(ShadowError::Io(err)),
        };
    }

    if addr as u64 != base {
        // SAFETY: `addr` is the address this same mmap call just returned,
        // with the exact `size` that was requested.
        unsafe {
            libc::munmap(addr, size as usize);
        }
        return Err(ShadowError::AddressTaken(base));
    }

    Ok(ShadowWindow { base, size })
}

/// Undoes a reservation. A subsequent [`reserve`] at the same address
/// succeeds once this returns `Ok`.
pub fn release(window: ShadowWindow) -> Result<(), ShadowError> {
    // SAFETY: `window` owns exactly the mapping created by `reserve`, and it
    // is consumed here so the same address cannot be released twice.
    let rc = unsafe { libc::munmap(window.base as *mut libc::c_void, window.size as usize) };
    if rc != 0 {
        return Err(ShadowError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Reservations in these tests use a high, unlikely-to-collide base so
    // they don't race the test binary's own heap/stack/library mappings.
    fn test_base(salt: u64) -> u64 {
        let page = page_size();
        0x5000_0000_0000u64 + salt * page * 4096
    }

    #[test]
    fn reserve_then_release_then_reserve_again_succeeds() {
        let base = test_base(1);
        let page = page_size();
        let w = reserve(base, page).expect("first reserve");
        assert_eq!(w.base(), base);
        assert_eq!(w.size(), page);
        release(w).expect("release");
        let w2 = reserve(base, page).expect("second reserve");
        release(w2).expect("release again");
    }

    #[test]
    fn misaligned_base_is_rejected() {
        let page = page_size();
        let err = reserve(test_base(2) + 1, page).unwrap_err();
        assert!(matches!(err, ShadowError::Align { .. }));
    }

    #[test]
    fn misaligned_size_is_rejected() {
        let page = page_size();
        let err = reserve(test_base(3), page + 1).unwrap_err();
        assert!(matches!(err, ShadowError::Align { .. }));
    }

    #[test]
    fn reserving_an_already_reserved_address_fails() {
        let base = test_base(4);
        let page = page_size();
        let first = reserve(base, page).expect("first reserve");
        let err = reserve(base, page).unwrap_err();
        assert!(matches!(err, ShadowError::AddressTaken(b) if b == base));
        release(first).unwrap();
    }

    #[test]
    fn zero_size_is_rejected() {
        assert!(matches!(
            reserve(test_base(5), 0),
            Err(ShadowError::Align { .. })
        ));
    }
}
