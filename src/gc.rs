//! Process-global manager for memory-mapped regions.
//!
//! Every region a map allocates is registered here together with a
//! reclamation callback supplied by its owner. Owners return regions
//! voluntarily with [`recycle`]; an external sweep ([`reclaim`] or
//! [`reclaim_all`]) may instead ask owners to give regions up at a
//! quiescent point, which the owner can refuse by returning `false` from
//! its callback (for example while its lock is held, or when the region is
//! a stale mapping left over from a rehash).

use std::collections::HashMap;
use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::OnceLock;

use parking_lot::Mutex;

/// Reclamation callback registered by a region's owner.
///
/// Invoked as `callback(base, force)` at a quiescent point; returning
/// `true` hands the region back to the manager for unmapping.
pub type ReclaimFn = Box<dyn Fn(*mut u8, bool) -> bool + Send + Sync>;

struct Region {
    len: usize,
    fd: RawFd,
    file: Option<PathBuf>,
    reclaim: ReclaimFn,
}

static REGIONS: OnceLock<Mutex<HashMap<usize, Region>>> = OnceLock::new();

fn regions() -> &'static Mutex<HashMap<usize, Region>> {
    REGIONS.get_or_init(|| Mutex::new(HashMap::new()))
}

fn page_size() -> usize {
    // Safety: sysconf has no memory preconditions.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

fn cpath(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))
}

/// Open (or create) a backing file for mapping.
pub fn open(path: &Path) -> io::Result<RawFd> {
    let path = cpath(path)?;
    // Safety: path is a valid NUL-terminated string.
    let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDWR | libc::O_CREAT | libc::O_CLOEXEC, 0o644) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

/// Read the leading 8-byte word of a backing file, if present.
///
/// The word is the stored `mask` of a previously persisted map; a short
/// read means the file is fresh.
pub(crate) fn read_mask_hint(fd: RawFd) -> Option<u64> {
    let mut buf = [0u8; 8];
    // Safety: buf is 8 writable bytes.
    let n = unsafe { libc::pread(fd, buf.as_mut_ptr() as *mut libc::c_void, 8, 0) };
    if n != 8 {
        return None;
    }
    Some(u64::from_le_bytes(buf))
}

/// Map a region of at least `len` bytes and register it with the manager.
///
/// The length is rounded up to the page size; the returned length is the
/// rounded value. File-backed regions (`fd >= 0`) are extended with
/// `ftruncate` and mapped shared so stores persist; anonymous regions are
/// private and zero-filled.
pub fn map_region(
    file: Option<&Path>,
    fd: RawFd,
    len: usize,
    reclaim: ReclaimFn,
) -> io::Result<(NonNull<u8>, usize)> {
    let page = page_size();
    let len = (len + page - 1) & !(page - 1);

    let base = unsafe {
        if fd >= 0 {
            if libc::ftruncate(fd, len as libc::off_t) != 0 {
                return Err(io::Error::last_os_error());
            }
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        } else {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        }
    };
    if base == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    let base = base as *mut u8;

    regions().lock().insert(
        base as usize,
        Region {
            len,
            fd,
            file: file.map(Path::to_path_buf),
            reclaim,
        },
    );
    tracing::debug!(base = base as usize, len, file_backed = fd >= 0, "region mapped");

    // Safety: mmap success implies a non-null base.
    Ok((unsafe { NonNull::new_unchecked(base) }, len))
}

/// Unmap a region and close its file descriptor.
fn unmap(base: *mut u8, region: &Region) {
    // Safety: (base, len) came from a successful mmap and is deregistered
    // by the caller, so no other unmap of the same range can race.
    unsafe {
        libc::munmap(base as *mut libc::c_void, region.len);
        if region.fd >= 0 {
            libc::close(region.fd);
        }
    }
    tracing::debug!(base = base as usize, len = region.len, "region unmapped");
}

/// Owner-initiated return of a region: unmap immediately, no callback.
///
/// The owner has already detached its own state; a region unknown to the
/// manager is ignored.
pub fn recycle(base: *mut u8) {
    if let Some(region) = regions().lock().remove(&(base as usize)) {
        unmap(base, &region);
    }
}

/// Unlink a region's backing file now, keeping the live mapping intact.
///
/// The mapped pages keep the inode alive until the region is unmapped, so
/// existing contents stay readable while a subsequent `open` of the same
/// name creates a fresh file. Used by rehash to retire the old geometry.
pub fn delete_file(base: *mut u8) {
    let mut regions = regions().lock();
    if let Some(region) = regions.get_mut(&(base as usize)) {
        if let Some(file) = region.file.take() {
            let _ = std::fs::remove_file(&file);
        }
    }
}

/// Ask one region's owner to give the region up, as a GC sweep would.
///
/// Returns true when the owner agreed and the region was unmapped. The
/// callback runs outside the registry lock; a refused region stays
/// registered.
pub fn reclaim(base: *mut u8, force: bool) -> bool {
    let Some(region) = regions().lock().remove(&(base as usize)) else {
        return false;
    };
    if (region.reclaim)(base, force) {
        unmap(base, &region);
        true
    } else {
        regions().lock().insert(base as usize, region);
        false
    }
}

/// Sweep every registered region; returns how many were reclaimed.
pub fn reclaim_all(force: bool) -> usize {
    let bases: Vec<usize> = regions().lock().keys().copied().collect();
    bases
        .into_iter()
        .filter(|&base| reclaim(base as *mut u8, force))
        .count()
}
