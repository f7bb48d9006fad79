//! Growth machinery: load policy, info widening, and rehash.
//!
//! When an insert hits the load budget the table first tries to widen the
//! displacement range of the info bytes (dropping one hash bit per byte),
//! which costs a single masked sweep over the info array. Only when the
//! info bytes are exhausted does it fall back to doubling the region.

use std::ptr;

use bytemuck::Pod;

use crate::gc;
use crate::hash::MapHasher;
use crate::layout::{self, Entry};

use super::{MapCore, MapState};

impl<K, V, H, const MLF: u64> MapCore<K, V, H, MLF>
where
    K: Pod + Eq,
    V: Pod,
    H: MapHasher<K>,
{
    /// Reinsert an entry that is guaranteed absent (rehash path); skips the
    /// key-equality scan of the regular insert.
    ///
    /// # Safety
    /// The write mutex must be held, a region attached, and `entry.key`
    /// absent from the table.
    pub(super) unsafe fn insert_move(&self, st: &mut MapState<K, V>, entry: Entry<K, V>) -> usize {
        if *st.max_allowed == 0 {
            // A previous reinsertion overflowed its info byte; reclaim a
            // hash bit instead of failing, the fresh table has room.
            let _widened = self.try_increase_info(st);
            debug_assert!(_widened, "info bytes exhausted during bulk reinsertion");
        }

        let mask = *st.mask as usize;
        let inc = *st.info_inc;
        let (mut idx, mut info) = self.key_to_idx(st, &entry.key);

        // The key is certainly new; skip forward with <=.
        while info <= st.info_at(idx) {
            idx = (idx + 1) & mask;
            info += inc;
        }

        let insertion_idx = idx;
        let insertion_info = info;
        if insertion_info + inc > 0xFF {
            *st.max_allowed = 0;
        }

        while st.info_at(idx) != 0 {
            idx = (idx + 1) & mask;
            info += inc;
            #[cfg(debug_assertions)]
            {
                st.conflicts += 1;
            }
        }

        if idx != insertion_idx {
            self.shift_up(st, idx, insertion_idx);
        }
        st.entry_ptr(insertion_idx).write(entry);
        *st.info.add(insertion_idx) = insertion_info as u8;
        *st.num_elements += 1;

        #[cfg(debug_assertions)]
        self.maybe_warn_conflicts(st);

        insertion_idx
    }

    #[cfg(debug_assertions)]
    unsafe fn maybe_warn_conflicts(&self, st: &MapState<K, V>) {
        let n = *st.num_elements;
        if n > 100 && n & 0xFFFF == 0 {
            let factor = st.conflicts as f64 / (n as f64 + 1.0);
            if factor > 0.05 {
                tracing::warn!(
                    conflicts = st.conflicts,
                    elements = n,
                    file = ?self.file,
                    "high probe conflict rate; check the hasher"
                );
            }
        }
    }

    /// Halve the displacement step, reclaiming one hash bit per info byte.
    ///
    /// Doubles the displacement range every occupied slot can express, at
    /// the price of one fingerprint bit, and costs one sweep over the info
    /// array done eight bytes at a time. The info array length is a
    /// multiple of eight, so the sentinel byte past it is never touched.
    ///
    /// # Safety
    /// The write mutex must be held and a region attached.
    pub(super) unsafe fn try_increase_info(&self, st: &mut MapState<K, V>) -> bool {
        if *st.info_inc <= 2 {
            // The byte-wide shift below needs a step of at least two.
            return false;
        }
        *st.info_inc >>= 1;
        *st.info_hash_shift += 1;

        let slots = st.slots_len();
        let words = st.info as *mut u64;
        for i in 0..slots / 8 {
            let w = words.add(i);
            *w = (*w >> 1) & 0x7f7f_7f7f_7f7f_7f7f;
        }
        *st.max_allowed = layout::max_elements_allowed(slots, MLF);
        true
    }

    /// Make room for one more insert: widen info bytes or double the table.
    ///
    /// # Safety
    /// The write mutex must be held and a region attached (inserts always
    /// attach first).
    pub(super) unsafe fn increase_size(&self, st: &mut MapState<K, V>) {
        let slots = st.slots_len();
        let budget = layout::max_elements_allowed(slots, MLF);
        if *st.num_elements < budget && self.try_increase_info(st) {
            return;
        }

        debug_assert!(
            *st.num_elements * 2 >= budget,
            "growth forced far below the load budget; the hasher is degenerate"
        );
        self.rehash(st, slots * 2);
    }

    /// Move the table into a fresh region of `num_buckets` slots.
    ///
    /// The current file (if any) is unlinked first so the new geometry gets
    /// a fresh inode under the same name; the old region stays readable
    /// through its live mapping until every entry is reinserted, then goes
    /// back to the region manager.
    ///
    /// # Safety
    /// The write mutex must be held.
    pub(super) unsafe fn rehash(&self, st: &mut MapState<K, V>, num_buckets: usize) {
        debug_assert!(num_buckets.is_power_of_two());
        self.reload(st);

        let old_slots = st.slots_len();
        if old_slots >= num_buckets {
            return;
        }

        if tracing::enabled!(tracing::Level::INFO) {
            tracing::info!(
                old_slots,
                new_slots = num_buckets,
                file = ?self.file,
                "map growth started"
            );
        }

        if st.fd >= 0 {
            gc::delete_file(st.base);
            st.fd = -1;
        }

        let old_base = st.base;
        let old_info = st.info as *const u8;
        let old_entries = st.slots as *const Entry<K, V>;

        st.base = ptr::null_mut();
        st.slots = ptr::null_mut();
        st.info = ptr::null_mut();
        st.reset_fallback();
        st.point_at_fallback();
        if let Err(err) = self.setup_mmap(st, num_buckets) {
            self.mmap_panic(err);
        }

        debug_assert!(st.base != old_base);
        debug_assert_eq!(*st.num_elements, 0);
        debug_assert_eq!(*st.mask, (num_buckets - 1) as u64);

        for idx in 0..old_slots {
            if *old_info.add(idx) != 0 {
                self.insert_move(st, ptr::read(old_entries.add(idx)));
            }
        }

        gc::recycle(old_base);
    }
}
