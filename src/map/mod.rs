//! The persistent map: Robin Hood slot table, lifecycle, and public API.
//!
//! All table storage lives in one mapped region laid out per
//! [`crate::layout`]. The instance itself only carries pointers into that
//! region plus a small heap-pinned fallback header that answers size
//! queries while no region is mapped. Every operation that touches storage
//! first reattaches the region if the manager reclaimed it.

pub mod iter;

mod grow;

#[cfg(test)]
mod tests;

use std::cell::UnsafeCell;
use std::io;
use std::marker::PhantomData;
use std::mem;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::{Arc, Weak};
use std::{fs, fmt};

use bytemuck::Pod;

use crate::constants::{
    INFO_SENTINEL, INITIAL_INFO_HASH_SHIFT, INITIAL_INFO_INC, INITIAL_SLOTS,
};
use crate::gc;
use crate::hash::{MapHasher, MixHasher, BAD_HASH_PREVENTION};
use crate::layout::{self, Entry};
use crate::lock::MapLock;

use self::iter::MapIter;

/// Header storage used while no region is mapped.
///
/// Heap-pinned so the header pointers in [`MapState`] can target it with a
/// stable address. Holds zeros (plus the initial info geometry) for a fresh
/// map, or a snapshot of the last mapped header after reclamation.
struct FallbackHeader {
    mask: u64,
    num_elements: u64,
    max_allowed: u64,
    info_inc: u32,
    info_hash_shift: u32,
}

impl Default for FallbackHeader {
    fn default() -> Self {
        Self {
            mask: 0,
            num_elements: 0,
            max_allowed: 0,
            info_inc: INITIAL_INFO_INC,
            info_hash_shift: INITIAL_INFO_HASH_SHIFT,
        }
    }
}

/// Mutable map state, guarded by the write mutex.
///
/// The five header pointers target either the mapped header (authoritative
/// while `base` is non-null) or the fallback header (authoritative while
/// unmapped); they are switched on every attach and detach.
struct MapState<K, V> {
    slots: *mut Entry<K, V>,
    info: *mut u8,
    mask: *mut u64,
    num_elements: *mut u64,
    max_allowed: *mut u64,
    info_inc: *mut u32,
    info_hash_shift: *mut u32,
    base: *mut u8,
    fd: RawFd,
    /// Byte size of the last mapping; kept across reclamation so a reattach
    /// can skip re-reading the file's stored geometry.
    region_len: usize,
    fallback: Box<FallbackHeader>,
    #[cfg(debug_assertions)]
    conflicts: u64,
}

impl<K, V> MapState<K, V> {
    fn new() -> Self {
        let mut state = Self {
            slots: ptr::null_mut(),
            info: ptr::null_mut(),
            mask: ptr::null_mut(),
            num_elements: ptr::null_mut(),
            max_allowed: ptr::null_mut(),
            info_inc: ptr::null_mut(),
            info_hash_shift: ptr::null_mut(),
            base: ptr::null_mut(),
            fd: -1,
            region_len: 0,
            fallback: Box::new(FallbackHeader::default()),
            #[cfg(debug_assertions)]
            conflicts: 0,
        };
        state.point_at_fallback();
        state
    }

    /// Aim the header pointers at the fallback storage.
    fn point_at_fallback(&mut self) {
        let fb = &mut *self.fallback;
        self.mask = &mut fb.mask;
        self.num_elements = &mut fb.num_elements;
        self.max_allowed = &mut fb.max_allowed;
        self.info_inc = &mut fb.info_inc;
        self.info_hash_shift = &mut fb.info_hash_shift;
    }

    /// Zero the fallback header back to its fresh-map values.
    fn reset_fallback(&mut self) {
        *self.fallback = FallbackHeader::default();
    }

    /// Aim the header pointers at the freshly mapped region.
    ///
    /// # Safety
    /// `base` must point at a live mapping of at least header size.
    unsafe fn attach_header(&mut self) {
        let base = self.base;
        self.mask = base.add(layout::MASK_OFFSET) as *mut u64;
        self.num_elements = base.add(layout::NUM_ELEMENTS_OFFSET) as *mut u64;
        self.max_allowed = base.add(layout::MAX_ALLOWED_OFFSET) as *mut u64;
        self.info_inc = base.add(layout::INFO_INC_OFFSET) as *mut u32;
        self.info_hash_shift = base.add(layout::INFO_HASH_SHIFT_OFFSET) as *mut u32;
        self.info = base.add(layout::HEADER_BYTES);
    }

    /// Snapshot the mapped header into the fallback and drop the mapping
    /// pointers. The caller hands the region itself back to the manager.
    ///
    /// # Safety
    /// A region must be attached and the write mutex held.
    unsafe fn detach_to_fallback(&mut self) {
        self.fallback.mask = *self.mask;
        self.fallback.num_elements = *self.num_elements;
        self.fallback.max_allowed = *self.max_allowed;
        self.fallback.info_inc = *self.info_inc;
        self.fallback.info_hash_shift = *self.info_hash_shift;
        self.base = ptr::null_mut();
        self.slots = ptr::null_mut();
        self.info = ptr::null_mut();
        self.fd = -1;
        self.point_at_fallback();
    }

    /// Number of slots in the attached table.
    ///
    /// # Safety
    /// A region must be attached.
    #[inline]
    unsafe fn slots_len(&self) -> usize {
        (*self.mask + 1) as usize
    }

    /// Info byte at `idx`, widened for displacement arithmetic. Index
    /// `slots_len()` reads the sentinel.
    ///
    /// # Safety
    /// A region must be attached and `idx <= slots_len()`.
    #[inline]
    unsafe fn info_at(&self, idx: usize) -> u32 {
        u32::from(*self.info.add(idx))
    }

    /// Pointer to the slot at `idx`.
    ///
    /// # Safety
    /// A region must be attached and `idx < slots_len()`.
    #[inline]
    unsafe fn entry_ptr(&self, idx: usize) -> *mut Entry<K, V> {
        self.slots.add(idx)
    }

    /// Key stored at `idx`.
    ///
    /// # Safety
    /// A region must be attached and slot `idx` occupied.
    #[inline]
    unsafe fn key_at(&self, idx: usize) -> &K {
        &(*self.slots.add(idx)).key
    }
}

/// Shared map internals behind the `PMap` handle.
///
/// Kept in an `Arc` so the reclamation callback registered with the region
/// manager can reach it through a `Weak` without pinning the map alive.
pub(crate) struct MapCore<K, V, H, const MLF: u64> {
    state: UnsafeCell<MapState<K, V>>,
    pub(crate) lock: MapLock,
    dir: Option<PathBuf>,
    file: Option<PathBuf>,
    name: Option<String>,
    weak_self: Weak<MapCore<K, V, H, MLF>>,
    _hasher: PhantomData<H>,
}

// Safety: all state behind the UnsafeCell is guarded by the write mutex,
// and Pod keys/values are plain bytes (no references, no drop), so moving
// or sharing the core across threads cannot observe unsynchronised state.
unsafe impl<K: Pod + Eq, V: Pod, H, const MLF: u64> Send for MapCore<K, V, H, MLF> {}
unsafe impl<K: Pod + Eq, V: Pod, H, const MLF: u64> Sync for MapCore<K, V, H, MLF> {}

impl<K, V, H, const MLF: u64> MapCore<K, V, H, MLF>
where
    K: Pod + Eq,
    V: Pod,
    H: MapHasher<K>,
{
    fn new_arc(dir: Option<PathBuf>, file: Option<PathBuf>, name: Option<String>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            state: UnsafeCell::new(MapState::new()),
            lock: MapLock::new(),
            dir,
            file,
            name,
            weak_self: weak.clone(),
            _hasher: PhantomData,
        })
    }

    /// Split a key's hash into its home bucket and initial info code.
    ///
    /// # Safety
    /// The write mutex must be held; the header pointers are dereferenced.
    #[inline]
    unsafe fn key_to_idx(&self, st: &MapState<K, V>, key: &K) -> (usize, u32) {
        let mut h = H::hash(key);
        if !H::AVALANCHING {
            h = h.wrapping_mul(BAD_HASH_PREVENTION);
        }
        let info = *st.info_inc + (h >> *st.info_hash_shift) as u32;
        let idx = (h & *st.mask) as usize;
        (idx, info)
    }

    /// Robin Hood lookup: slot index of `key`, or -1 when absent.
    ///
    /// # Safety
    /// The write mutex must be held and a region attached.
    unsafe fn find_idx(&self, st: &MapState<K, V>, key: &K) -> isize {
        let mask = *st.mask as usize;
        let inc = *st.info_inc;
        let (mut idx, mut info) = self.key_to_idx(st, key);

        loop {
            // Unrolled in pairs; more did not help in the original either.
            if info == st.info_at(idx) && *st.key_at(idx) == *key {
                return idx as isize;
            }
            idx = (idx + 1) & mask;
            info += inc;
            if info == st.info_at(idx) && *st.key_at(idx) == *key {
                return idx as isize;
            }
            idx = (idx + 1) & mask;
            info += inc;
            if info > st.info_at(idx) {
                return -1;
            }
        }
    }

    /// Attach the region if a probe can possibly hit; false means the map
    /// is empty and nothing was mapped.
    ///
    /// A read-only probe must not create the backing file, but it must see
    /// data that is already on disk or memoized from a reclaimed mapping.
    ///
    /// # Safety
    /// The write mutex must be held.
    unsafe fn ensure_probe_ready(&self, st: &mut MapState<K, V>) -> bool {
        if !st.base.is_null() {
            return true;
        }
        if st.region_len == 0 && !self.file.as_deref().is_some_and(Path::exists) {
            return false;
        }
        if let Err(err) = self.setup_mmap(st, 0) {
            self.mmap_panic(err);
        }
        true
    }

    /// Attach the region, creating it if necessary.
    ///
    /// # Safety
    /// The write mutex must be held.
    unsafe fn reload(&self, st: &mut MapState<K, V>) {
        if st.base.is_null() {
            if let Err(err) = self.setup_mmap(st, 0) {
                self.mmap_panic(err);
            }
        }
    }

    fn mmap_panic(&self, err: io::Error) -> ! {
        panic!("pmap: cannot map region for {:?}: {err}", self.file);
    }

    /// Map the backing region and wire up the header pointers.
    ///
    /// `n_request` forces a slot count (rehash path); zero means "reuse
    /// what the file or the size memo says, or start fresh".
    ///
    /// # Safety
    /// The write mutex must be held and no region attached.
    unsafe fn setup_mmap(&self, st: &mut MapState<K, V>, n_request: usize) -> io::Result<()> {
        debug_assert!(st.base.is_null());
        let entry_size = mem::size_of::<Entry<K, V>>();
        let mut n = n_request;
        let want_len;

        match self.file.as_deref() {
            None => {
                debug_assert!(st.fd < 0);
                if n == 0 {
                    debug_assert_eq!(st.region_len, 0);
                    n = INITIAL_SLOTS;
                }
                want_len = layout::region_bytes(n, entry_size);
            }
            Some(path) => {
                if st.fd < 0 {
                    st.fd = gc::open(path)?;
                }
                if n != 0 {
                    want_len = layout::region_bytes(n, entry_size);
                } else if st.region_len == 0 {
                    // First attach: the leading word of the file is the
                    // stored mask, so the slot count is that plus one.
                    n = match gc::read_mask_hint(st.fd) {
                        None | Some(0) => INITIAL_SLOTS,
                        Some(mask) => {
                            let slots = (mask + 1) as usize;
                            assert!(
                                slots.is_power_of_two() && slots >= INITIAL_SLOTS,
                                "pmap: corrupted header in {path:?} (stored mask {mask:#x})"
                            );
                            slots
                        }
                    };
                    want_len = layout::region_bytes(n, entry_size);
                } else {
                    // Reattach after reclamation: the size memo avoids
                    // re-reading the file; the mapped header is
                    // authoritative for the geometry.
                    n = INITIAL_SLOTS;
                    want_len = st.region_len;
                }
            }
        }

        let (base, len) = gc::map_region(self.file.as_deref(), st.fd, want_len, self.reclaim_callback())?;
        st.base = base.as_ptr();
        st.region_len = len;
        st.attach_header();

        if *st.num_elements != 0 {
            let slots = st.slots_len();
            assert!(
                *st.max_allowed <= *st.mask
                    && layout::region_bytes(slots, entry_size) <= st.region_len,
                "pmap: mapped region disagrees with stored header for {:?}",
                self.file
            );
            st.slots = st.base.add(layout::slot_offset(slots)) as *mut Entry<K, V>;
            debug_assert_eq!(*st.info.add(slots), INFO_SENTINEL);
        } else {
            *st.mask = (n - 1) as u64;
            *st.max_allowed = layout::max_elements_allowed(n, MLF);
            *st.info_inc = INITIAL_INFO_INC;
            *st.info_hash_shift = INITIAL_INFO_HASH_SHIFT;
            *st.info.add(n) = INFO_SENTINEL;
            st.slots = st.base.add(layout::slot_offset(n)) as *mut Entry<K, V>;
        }
        Ok(())
    }

    fn reclaim_callback(&self) -> gc::ReclaimFn {
        let weak = self.weak_self.clone();
        Box::new(move |base, force| weak.upgrade().map_or(true, |core| core.gc_done(base, force)))
    }

    /// Reclamation handshake, invoked by the region manager at a quiescent
    /// point. Returns true when the region was handed back.
    fn gc_done(&self, base: *mut u8, _force: bool) -> bool {
        if !self.lock.try_acquire() {
            // An operation or iterator is mid-flight; refuse.
            return false;
        }
        // Safety: write mutex held.
        let st = unsafe { &mut *self.state.get() };
        if st.base != base {
            // Two mappings are alive during a rehash; the stale one is
            // already owned by the manager, not by us.
            self.lock.release();
            return false;
        }
        assert_eq!(self.lock.read_locks(), 0, "reclamation with read-locks outstanding");

        // Safety: region attached, mutex held.
        unsafe {
            if st.fd >= 0 {
                if *st.num_elements == 0 {
                    if let Some(file) = self.file.as_deref() {
                        let _ = fs::remove_file(file);
                    }
                    st.region_len = 0;
                }
            } else {
                st.region_len = 0;
            }
            st.detach_to_fallback();
        }
        self.lock.release();
        tracing::debug!(file = ?self.file, "map released its region");
        true
    }

    /// Insert or update under the held write mutex.
    ///
    /// # Safety
    /// The write mutex must be held and a region attached.
    unsafe fn do_insert(&self, st: &mut MapState<K, V>, key: K, value: V) -> usize {
        loop {
            let mask = *st.mask as usize;
            let inc = *st.info_inc;
            let (mut idx, mut info) = self.key_to_idx(st, &key);

            // Entries displaced at least as far as ours keep their slots.
            while info < st.info_at(idx) {
                idx = (idx + 1) & mask;
                info += inc;
            }

            let mut found = false;
            while info == st.info_at(idx) {
                if *st.key_at(idx) == key {
                    found = true;
                    break;
                }
                idx = (idx + 1) & mask;
                info += inc;
            }

            if found {
                st.entry_ptr(idx).write(Entry { key, value });
                return idx;
            }

            if *st.num_elements >= *st.max_allowed {
                self.increase_size(st);
                continue;
            }

            if info + inc > 0xFF {
                // This displacement depth exhausts the info byte; force a
                // growth step before the next insert.
                *st.max_allowed = 0;
            }

            let insertion_idx = idx;
            let insertion_info = info;

            while st.info_at(idx) != 0 {
                idx = (idx + 1) & mask;
                info += inc;
            }
            if idx != insertion_idx {
                self.shift_up(st, idx, insertion_idx);
            }

            st.entry_ptr(insertion_idx).write(Entry { key, value });
            *st.info.add(insertion_idx) = insertion_info as u8;
            *st.num_elements += 1;
            return insertion_idx;
        }
    }

    /// Move the run `[insertion_idx, empty_idx)` up one slot, bumping each
    /// displaced entry's info byte.
    ///
    /// # Safety
    /// The write mutex must be held; `empty_idx` must be an empty slot
    /// reachable from `insertion_idx` by forward probing.
    unsafe fn shift_up(&self, st: &mut MapState<K, V>, mut idx: usize, insertion_idx: usize) {
        let mask = *st.mask as usize;
        let inc = *st.info_inc;
        while idx != insertion_idx {
            let prev = idx.wrapping_sub(1) & mask;
            ptr::copy(st.entry_ptr(prev), st.entry_ptr(idx), 1);
            let shifted = st.info_at(prev) + inc;
            if shifted + inc > 0xFF {
                *st.max_allowed = 0;
            }
            *st.info.add(idx) = shifted as u8;
            idx = prev;
        }
    }

    /// Backward-shift compaction after removing the entry at `idx`.
    ///
    /// The walk wraps at the table end like the probe sequence does, so a
    /// chain pushed across the boundary by shift-up is pulled back whole.
    /// Termination: the table is never full, so every chain ends at a slot
    /// whose successor is empty or sits in its home bucket.
    ///
    /// # Safety
    /// The write mutex must be held and slot `idx` occupied.
    unsafe fn shift_down(&self, st: &mut MapState<K, V>, mut idx: usize) {
        let mask = *st.mask as usize;
        let inc = *st.info_inc;
        loop {
            let next = (idx + 1) & mask;
            let next_info = st.info_at(next);
            if next_info < 2 * inc {
                break;
            }
            *st.info.add(idx) = (next_info - inc) as u8;
            ptr::copy(st.entry_ptr(next), st.entry_ptr(idx), 1);
            idx = next;
        }
        *st.info.add(idx) = 0;
    }
}

impl<K, V, H, const MLF: u64> Drop for MapCore<K, V, H, MLF> {
    fn drop(&mut self) {
        let st = self.state.get_mut();
        if !st.base.is_null() {
            // Hand the region back; file-backed contents stay on disk.
            gc::recycle(st.base);
        }
    }
}

/// A persistent, memory-mapped Robin Hood hash map.
///
/// Keys and values are plain data ([`Pod`]): they are stored inline in the
/// mapped slot array and moved with raw byte copies. Variable-size payloads
/// belong in an interner; store the fixed-size handle here.
///
/// `MAX_LOAD_FACTOR_100` is the growth threshold in percent, exclusive
/// bounds (10, 100).
///
/// All operations take `&self`; an internal lock serialises mutation, and
/// iterators and [`RefGuard`]s hold a read-lock that blocks writers (and
/// region reclamation) for their lifetime.
pub struct PMap<K, V, H = MixHasher, const MAX_LOAD_FACTOR_100: u64 = 80> {
    pub(crate) core: Arc<MapCore<K, V, H, MAX_LOAD_FACTOR_100>>,
}

impl<K, V, H, const MLF: u64> PMap<K, V, H, MLF>
where
    K: Pod + Eq,
    V: Pod,
    H: MapHasher<K>,
{
    fn contract_checks() {
        assert!(
            MLF > 10 && MLF < 100,
            "pmap: load factor must be in (10, 100) percent"
        );
        assert!(
            mem::align_of::<Entry<K, V>>() <= 8,
            "pmap: entries must be at most 8-byte aligned"
        );
    }

    /// Open (or create) a file-backed map at `<dir>/<name>`.
    ///
    /// The directory is created with mode 0755 if absent. No file is
    /// created until the first insert; a file left by a previous run is
    /// picked up lazily on first use.
    pub fn open(dir: impl AsRef<Path>, name: impl AsRef<str>) -> io::Result<Self> {
        Self::contract_checks();
        let name = name.as_ref();
        assert!(!name.is_empty(), "pmap: map name must not be empty");

        let dir = dir.as_ref();
        let dir: PathBuf = if dir.as_os_str().is_empty() {
            PathBuf::from(".")
        } else {
            dir.to_path_buf()
        };
        if dir != Path::new(".") && !dir.is_dir() {
            fs::create_dir_all(&dir)?;
            fs::set_permissions(&dir, fs::Permissions::from_mode(0o755))?;
        }
        let file = dir.join(name);
        Ok(Self {
            core: MapCore::new_arc(Some(dir), Some(file), Some(name.to_owned())),
        })
    }

    /// Create an anonymous in-memory map. Contents do not survive
    /// reclamation or drop.
    pub fn anonymous() -> Self {
        Self::contract_checks();
        Self {
            core: MapCore::new_arc(None, None, None),
        }
    }

    /// Insert `key -> value`, or update the value in place if the key is
    /// present. Returns the slot index of the entry.
    pub fn set(&self, key: K, value: V) -> usize {
        let _op = self.core.lock.lock_for_op();
        // Safety: write mutex held for the whole operation.
        unsafe {
            let st = &mut *self.core.state.get();
            self.core.reload(st);
            self.core.do_insert(st, key, value)
        }
    }

    /// Copy out the value stored under `key`.
    ///
    /// # Panics
    /// Panics if the key is absent; use [`has`](Self::has) or
    /// [`find`](Self::find) when presence is uncertain.
    pub fn get(&self, key: &K) -> V {
        let _op = self.core.lock.lock_for_op();
        // Safety: write mutex held.
        unsafe {
            let st = &mut *self.core.state.get();
            assert!(
                self.core.ensure_probe_ready(st),
                "pmap: get() on absent key"
            );
            let idx = self.core.find_idx(st, key);
            assert!(idx >= 0, "pmap: get() on absent key");
            (*st.entry_ptr(idx as usize)).value
        }
    }

    /// True if `key` is present.
    pub fn has(&self, key: &K) -> bool {
        let _op = self.core.lock.lock_for_op();
        // Safety: write mutex held.
        unsafe {
            let st = &mut *self.core.state.get();
            self.core.ensure_probe_ready(st) && self.core.find_idx(st, key) >= 0
        }
    }

    /// Remove `key`; returns the number of entries removed (0 or 1).
    pub fn erase(&self, key: &K) -> usize {
        let _op = self.core.lock.lock_for_op();
        // Safety: write mutex held.
        unsafe {
            let st = &mut *self.core.state.get();
            if !self.core.ensure_probe_ready(st) {
                return 0;
            }
            let idx = self.core.find_idx(st, key);
            if idx < 0 {
                return 0;
            }
            self.core.shift_down(st, idx as usize);
            *st.num_elements -= 1;
            1
        }
    }

    /// Remove the entry an iterator is positioned at.
    ///
    /// Returns true when the vacated slot stayed empty; false when
    /// compaction shifted a successor into it, in which case the iterator
    /// position holds a not-yet-visited entry and should be re-examined
    /// before advancing.
    pub fn erase_iter(&self, pos: &MapIter<'_, K, V, H, MLF>) -> bool {
        assert!(
            self.core.lock.read_locks() > 0,
            "pmap: erase_iter() without the iterator's read-lock"
        );
        assert!(!pos.is_end(), "pmap: erase_iter() at end");
        // Safety: the iterator's read-lock holds the write mutex, and the
        // iterator can only point into the attached region.
        unsafe {
            let st = &mut *self.core.state.get();
            let idx = pos.slot_ptr().offset_from(st.slots) as usize;
            self.core.shift_down(st, idx);
            *st.num_elements -= 1;
            *pos.info_ptr() == 0
        }
    }

    /// Look up `key` and return an iterator positioned at it, or an end
    /// iterator when absent. The iterator owns a read-lock either way.
    pub fn find(&self, key: &K) -> MapIter<'_, K, V, H, MLF> {
        self.core.lock.ref_lock();
        // Safety: the read-lock holds the write mutex.
        unsafe {
            let st = &mut *self.core.state.get();
            if !self.core.ensure_probe_ready(st) {
                return MapIter::detached(self);
            }
            let end = st.entry_ptr(st.slots_len()) as *const Entry<K, V>;
            match self.core.find_idx(st, key) {
                idx if idx >= 0 => MapIter::at(
                    self,
                    st.entry_ptr(idx as usize),
                    st.info.add(idx as usize),
                    end,
                ),
                _ => MapIter::at(self, end, ptr::null(), end),
            }
        }
    }

    /// Iterate over all live entries in table order.
    ///
    /// The iterator holds a read-lock for its lifetime: writers on other
    /// threads block until every iterator is dropped, so one pass observes
    /// a stable snapshot.
    pub fn iter(&self) -> MapIter<'_, K, V, H, MLF> {
        self.core.lock.ref_lock();
        // Safety: the read-lock holds the write mutex.
        unsafe {
            let st = &mut *self.core.state.get();
            if !self.core.ensure_probe_ready(st) {
                return MapIter::detached(self);
            }
            let end = st.entry_ptr(st.slots_len()) as *const Entry<K, V>;
            if *st.num_elements == 0 {
                return MapIter::at(self, end, ptr::null(), end);
            }
            let mut it = MapIter::at(self, st.slots, st.info, end);
            it.skip_empty();
            it
        }
    }

    /// Take a scoped read-lock for pointer-stable value access.
    ///
    /// While any read-lock is held, writers on other threads and region
    /// reclamation are blocked, so references handed out by the guard stay
    /// valid. Mutating the map **on the same thread** while holding such
    /// references is not checked and invalidates them; keep reference use
    /// bracketed.
    pub fn lock_ref(&self) -> RefGuard<'_, K, V, H, MLF> {
        self.core.lock.ref_lock();
        RefGuard { map: self }
    }

    /// Grow the table until `count` entries fit within the load budget.
    pub fn reserve(&self, count: usize) {
        let _op = self.core.lock.lock_for_op();
        // Safety: write mutex held.
        unsafe {
            let st = &mut *self.core.state.get();
            let mut new_slots = INITIAL_SLOTS.max((*st.mask + 1) as usize);
            while layout::max_elements_allowed(new_slots, MLF) < count as u64 {
                new_slots *= 2;
            }
            self.core.rehash(st, new_slots);
        }
    }

    /// Drop all entries and the backing file, keeping the instance usable.
    ///
    /// # Panics
    /// Panics if any read-lock (iterator or [`RefGuard`]) is outstanding.
    pub fn clear(&self) {
        assert_eq!(
            self.core.lock.read_locks(),
            0,
            "pmap: clear() with outstanding read-locks"
        );
        self.core.lock.acquire();
        // Safety: write mutex held.
        unsafe {
            let st = &mut *self.core.state.get();
            if !st.base.is_null() {
                gc::recycle(st.base);
                st.base = ptr::null_mut();
                st.slots = ptr::null_mut();
                st.info = ptr::null_mut();
                st.fd = -1;
            }
            if let Some(file) = self.core.file.as_deref() {
                let _ = fs::remove_file(file);
            }
            st.region_len = 0;
            st.reset_fallback();
            st.point_at_fallback();
            #[cfg(debug_assertions)]
            {
                st.conflicts = 0;
            }
        }
        self.core.lock.release();
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let _op = self.core.lock.lock_for_op();
        // Safety: write mutex held; the pointer targets either the mapped
        // or the fallback header.
        unsafe { *(*self.core.state.get()).num_elements as usize }
    }

    /// True when the map holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries the current table can hold before growing.
    pub fn capacity(&self) -> usize {
        let _op = self.core.lock.lock_for_op();
        // Safety: write mutex held.
        unsafe {
            let st = &*self.core.state.get();
            if !st.base.is_null() {
                *st.max_allowed as usize
            } else {
                layout::max_elements_allowed(INITIAL_SLOTS, MLF) as usize
            }
        }
    }

    /// Live entries divided by slot count.
    pub fn load_factor(&self) -> f32 {
        let _op = self.core.lock.lock_for_op();
        // Safety: write mutex held.
        unsafe {
            let st = &*self.core.state.get();
            *st.num_elements as f32 / (*st.mask + 1) as f32
        }
    }

    /// The compile-time growth threshold as a fraction.
    pub fn max_load_factor(&self) -> f32 {
        MLF as f32 / 100.0
    }

    /// Outstanding scoped read-locks; mainly useful in tests and asserts.
    pub fn read_locks(&self) -> u32 {
        self.core.lock.read_locks()
    }

    /// Directory this map is bound to, if file-backed.
    pub fn path(&self) -> Option<&Path> {
        self.core.dir.as_deref()
    }

    /// Map name within the directory, if file-backed.
    pub fn name(&self) -> Option<&str> {
        self.core.name.as_deref()
    }

    /// Full path of the backing file, if file-backed.
    pub fn backing_file(&self) -> Option<&Path> {
        self.core.file.as_deref()
    }

    /// Walk the whole table and assert every internal invariant: header
    /// bounds, the iteration sentinel, the live-entry count, and the Robin
    /// Hood placement of every occupied slot. Debugging aid; O(slots).
    pub fn validate(&self) {
        let _op = self.core.lock.lock_for_op();
        // Safety: write mutex held.
        unsafe {
            let st = &*self.core.state.get();
            if st.base.is_null() {
                return;
            }
            let slots = st.slots_len();
            assert!(slots.is_power_of_two() && slots >= INITIAL_SLOTS);
            assert!(*st.max_allowed <= slots as u64);
            assert_eq!(*st.info.add(slots), INFO_SENTINEL, "sentinel lost");

            let inc = *st.info_inc;
            let mut live = 0u64;
            for idx in 0..slots {
                let stored = st.info_at(idx);
                if stored == 0 {
                    continue;
                }
                live += 1;
                let (home, base_info) = self.core.key_to_idx(st, st.key_at(idx));
                let displacement = (idx + slots - home) & (slots - 1);
                let expected = base_info + displacement as u32 * inc;
                assert_eq!(stored, expected, "slot {idx} violates Robin Hood placement");
            }
            assert_eq!(live, *st.num_elements, "info bytes disagree with the element count");
        }
    }
}

impl<K, V, H, const MLF: u64> fmt::Debug for PMap<K, V, H, MLF>
where
    K: Pod + Eq,
    V: Pod,
    H: MapHasher<K>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PMap")
            .field("name", &self.core.name)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

/// Scoped read-lock for pointer-stable access; see [`PMap::lock_ref`].
pub struct RefGuard<'a, K, V, H, const MLF: u64> {
    map: &'a PMap<K, V, H, MLF>,
}

impl<K, V, H, const MLF: u64> RefGuard<'_, K, V, H, MLF>
where
    K: Pod + Eq,
    V: Pod,
    H: MapHasher<K>,
{
    /// Reference to the value stored under `key`.
    ///
    /// # Panics
    /// Panics if the key is absent.
    pub fn value(&self, key: &K) -> &V {
        // Safety: the guard's read-lock holds the write mutex.
        unsafe {
            let st = &mut *self.map.core.state.get();
            assert!(
                self.map.core.ensure_probe_ready(st),
                "pmap: value() on absent key"
            );
            let idx = self.map.core.find_idx(st, key);
            assert!(idx >= 0, "pmap: value() on absent key");
            &(*st.entry_ptr(idx as usize)).value
        }
    }

    /// Mutable reference to the value stored under `key`; the update lands
    /// directly in mapped (and thus persisted) memory.
    ///
    /// # Panics
    /// Panics if the key is absent.
    pub fn value_mut(&mut self, key: &K) -> &mut V {
        // Safety: as in value(); the &mut receiver keeps multiple mutable
        // borrows from one guard apart.
        unsafe {
            let st = &mut *self.map.core.state.get();
            assert!(
                self.map.core.ensure_probe_ready(st),
                "pmap: value_mut() on absent key"
            );
            let idx = self.map.core.find_idx(st, key);
            assert!(idx >= 0, "pmap: value_mut() on absent key");
            &mut (*st.entry_ptr(idx as usize)).value
        }
    }
}

impl<K, V, H, const MLF: u64> Drop for RefGuard<'_, K, V, H, MLF> {
    fn drop(&mut self) {
        self.map.core.lock.ref_unlock();
    }
}
