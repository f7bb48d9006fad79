//! Forward iteration over the slot table.
//!
//! An iterator carries a slot pointer and the parallel info pointer, and
//! skips empty slots eight info bytes at a time; the sentinel byte past the
//! last slot stops the scan without a bounds check. Every live iterator
//! owns one scoped read-lock, so the table cannot move, grow, or be
//! reclaimed underneath it.

use std::ptr;

use bytemuck::Pod;

use crate::hash::MapHasher;
use crate::layout::Entry;

use super::PMap;

/// Iterator over the live entries of a [`PMap`]; see [`PMap::iter`] and
/// [`PMap::find`].
///
/// Yields `(key, value)` copies in table order (unspecified and unstable
/// across mutation). Cloning takes an additional read-lock; dropping
/// releases one.
pub struct MapIter<'a, K, V, H, const MLF: u64> {
    map: &'a PMap<K, V, H, MLF>,
    slot: *const Entry<K, V>,
    info: *const u8,
    end: *const Entry<K, V>,
}

impl<'a, K, V, H, const MLF: u64> MapIter<'a, K, V, H, MLF>
where
    K: Pod + Eq,
    V: Pod,
    H: MapHasher<K>,
{
    /// Iterator over a map with no attached region: always at end.
    pub(super) fn detached(map: &'a PMap<K, V, H, MLF>) -> Self {
        Self {
            map,
            slot: ptr::null(),
            info: ptr::null(),
            end: ptr::null(),
        }
    }

    /// Iterator positioned at `slot` (occupied, or one past the table).
    pub(super) fn at(
        map: &'a PMap<K, V, H, MLF>,
        slot: *const Entry<K, V>,
        info: *const u8,
        end: *const Entry<K, V>,
    ) -> Self {
        Self { map, slot, info, end }
    }

    pub(super) fn slot_ptr(&self) -> *const Entry<K, V> {
        self.slot
    }

    pub(super) fn info_ptr(&self) -> *const u8 {
        self.info
    }

    /// True when the iterator is past the last entry.
    pub fn is_end(&self) -> bool {
        self.slot.is_null() || self.slot >= self.end
    }

    /// The entry at the current position without advancing.
    pub fn current(&self) -> Option<(K, V)> {
        if self.is_end() {
            return None;
        }
        // Safety: not at end, so slot points at a live entry.
        let entry = unsafe { ptr::read(self.slot) };
        Some((entry.key, entry.value))
    }

    /// Advance to the next occupied slot (or the sentinel).
    ///
    /// # Safety
    /// The iterator must point into an attached region at an index no
    /// greater than the sentinel.
    pub(super) unsafe fn skip_empty(&mut self) {
        loop {
            // One unaligned load covers eight info bytes; the count of
            // zero bytes on the low-address side is the number of empty
            // slots to skip. The zero padding past the sentinel keeps the
            // load in bounds.
            let word = ptr::read_unaligned(self.info as *const u64);
            let step = if cfg!(target_endian = "little") {
                word.trailing_zeros() / 8
            } else {
                word.leading_zeros() / 8
            } as usize;
            self.slot = self.slot.add(step);
            self.info = self.info.add(step);
            if step != 8 {
                return;
            }
        }
    }
}

impl<K, V, H, const MLF: u64> Iterator for MapIter<'_, K, V, H, MLF>
where
    K: Pod + Eq,
    V: Pod,
    H: MapHasher<K>,
{
    type Item = (K, V);

    fn next(&mut self) -> Option<(K, V)> {
        if self.is_end() {
            return None;
        }
        // Safety: not at end, so the current slot is live and the info
        // walk stays within the padded info area.
        unsafe {
            let entry = ptr::read(self.slot);
            self.slot = self.slot.add(1);
            self.info = self.info.add(1);
            self.skip_empty();
            Some((entry.key, entry.value))
        }
    }
}

impl<K, V, H, const MLF: u64> Clone for MapIter<'_, K, V, H, MLF>
where
    K: Pod + Eq,
    V: Pod,
    H: MapHasher<K>,
{
    fn clone(&self) -> Self {
        // The copy owns its own read-lock.
        self.map.core.lock.ref_lock();
        Self {
            map: self.map,
            slot: self.slot,
            info: self.info,
            end: self.end,
        }
    }
}

impl<K, V, H, const MLF: u64> PartialEq for MapIter<'_, K, V, H, MLF> {
    fn eq(&self, other: &Self) -> bool {
        self.slot == other.slot
    }
}

impl<K, V, H, const MLF: u64> Drop for MapIter<'_, K, V, H, MLF> {
    fn drop(&mut self) {
        self.map.core.lock.ref_unlock();
    }
}
