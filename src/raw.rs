//! Control plane shared by every table shape: ctrl bytes, redirection slots,
//! linear probing, backward-shift deletion and stored-hash rehashing.
//!
//! `RawTable` knows nothing about keys or values. Callers hand it a 64-bit
//! hash and a closure that answers "does the entry at this dense index match";
//! everything else (partial-hash filtering, probe order, slot bookkeeping)
//! lives here so the map, set and multi variants share one set of hot paths.

use core::mem;

/// Buckets are never allocated below this count.
pub(crate) const FLOOR_BUCKETS: usize = 1024;

/// Cursor bucket sentinel: the position is unknown and must be re-derived
/// from the key before the control plane may be touched through it.
pub(crate) const NO_BUCKET: usize = usize::MAX;

/// A rehash is forced once `occupied / buckets` exceeds 4/5.
const LOAD_NUM: usize = 4;
const LOAD_DEN: usize = 5;

/// High bit of a ctrl byte; set on every occupied slot so a stored partial
/// hash can never collide with the empty sentinel `0`.
const OCCUPIED_BIT: u8 = 0x80;

/// Mixing constant for the partial-hash byte.
const PARTIAL_SEED: u64 = 0x9ddf_ea08_eb38_2d69;

/// Folded 64x64 -> 128 multiply, high half xor low half.
#[inline(always)]
fn mix64(a: u64, b: u64) -> u64 {
    let wide = u128::from(a) * u128::from(b);
    (wide >> 64) as u64 ^ wide as u64
}

/// Derives the 7-bit probe filter from a full hash. Bit 7 is always set.
#[inline(always)]
fn partial(hash: u64) -> u8 {
    mix64(hash, PARTIAL_SEED) as u8 | OCCUPIED_BIT
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for u32 {}
    impl Sealed for u64 {}
}

/// Width of the cached hash and value index stored per bucket.
///
/// The default `u32` keeps a bucket at nine bytes (one ctrl byte plus two
/// 32-bit words) and caps the table at `u32::MAX - 1` entries; `u64` lifts
/// the cap at seventeen bytes per bucket. Implemented for exactly those two
/// types; the trait is sealed.
pub trait IndexWidth: sealed::Sealed + Copy + Eq + Default + 'static {
    /// Dense-entry count at which insertion must refuse to grow.
    #[doc(hidden)]
    const MAX_ENTRIES: usize;

    #[doc(hidden)]
    fn truncate(hash: u64) -> Self;
    #[doc(hidden)]
    fn from_index(index: usize) -> Self;
    #[doc(hidden)]
    fn widen(self) -> u64;
    #[doc(hidden)]
    fn index(self) -> usize;
}

impl IndexWidth for u32 {
    const MAX_ENTRIES: usize = (u32::MAX - 1) as usize;

    #[inline(always)]
    fn truncate(hash: u64) -> Self {
        hash as u32
    }
    #[inline(always)]
    fn from_index(index: usize) -> Self {
        index as u32
    }
    #[inline(always)]
    fn widen(self) -> u64 {
        u64::from(self)
    }
    #[inline(always)]
    fn index(self) -> usize {
        self as usize
    }
}

impl IndexWidth for u64 {
    const MAX_ENTRIES: usize = usize::MAX;

    #[inline(always)]
    fn truncate(hash: u64) -> Self {
        hash
    }
    #[inline(always)]
    fn from_index(index: usize) -> Self {
        index as u64
    }
    #[inline(always)]
    fn widen(self) -> u64 {
        self
    }
    #[inline(always)]
    fn index(self) -> usize {
        self as usize
    }
}

/// One redirection slot: the truncated hash of the occupant plus the index of
/// its entry in the dense array. Meaningful only while the matching ctrl byte
/// is non-zero.
#[derive(Clone, Copy, Default)]
pub(crate) struct Slot<W> {
    hash: W,
    index: W,
}

/// Outcome of a successful probe: the bucket that matched and the dense index
/// it redirects to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Hit {
    pub bucket: usize,
    pub index: usize,
}

#[derive(Clone)]
pub(crate) struct RawTable<W> {
    ctrl: Vec<u8>,
    slots: Vec<Slot<W>>,
    /// Bumped whenever the bucket arrays are rebuilt or wiped (rehash, clear,
    /// fast clear); cursors snapshot it to detect stale bucket positions.
    epoch: u64,
}

impl<W> RawTable<W> {
    pub(crate) const fn new() -> Self {
        RawTable {
            ctrl: Vec::new(),
            slots: Vec::new(),
            epoch: 0,
        }
    }

    #[inline]
    pub(crate) fn bucket_count(&self) -> usize {
        self.ctrl.len()
    }

    #[inline]
    pub(crate) fn is_allocated(&self) -> bool {
        !self.ctrl.is_empty()
    }

    #[inline]
    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }
}

impl<W: IndexWidth> RawTable<W> {
    pub(crate) fn with_buckets(buckets: usize) -> Self {
        let buckets = buckets.max(FLOOR_BUCKETS);
        RawTable {
            ctrl: vec![0; buckets],
            slots: vec![Slot::default(); buckets],
            epoch: 0,
        }
    }

    /// Lazily brings the bucket arrays up at the floor size. First insertion
    /// into a default-constructed table lands here.
    pub(crate) fn allocate_floor(&mut self) {
        if self.ctrl.is_empty() {
            self.ctrl = vec![0; FLOOR_BUCKETS];
            self.slots = vec![Slot::default(); FLOOR_BUCKETS];
        }
    }

    /// Home bucket for a truncated hash. Probing, displacement and rehashing
    /// all derive positions from the truncated hash so they agree for any
    /// bucket count; for power-of-two counts this is identical to reducing
    /// the full 64-bit hash.
    #[inline(always)]
    fn home(&self, stored: W) -> usize {
        (stored.widen() % self.ctrl.len() as u64) as usize
    }

    /// How far the occupant of `bucket` sits from its home position.
    #[inline]
    fn displacement(&self, bucket: usize) -> usize {
        let buckets = self.ctrl.len();
        let home = self.home(self.slots[bucket].hash);
        (bucket + buckets - home) % buckets
    }

    /// Whether `bucket` is occupied and redirects to dense `index`. Cursor
    /// snapshots are checked against this before being trusted: an erasure
    /// elsewhere can backward-shift this bucket's occupant without touching
    /// the epoch.
    #[inline]
    pub(crate) fn redirects_to(&self, bucket: usize, index: usize) -> bool {
        self.ctrl[bucket] != 0 && self.slots[bucket].index.index() == index
    }

    /// Walks the probe sequence for `hash`. `Ok` carries the bucket whose
    /// occupant satisfied `eq`; `Err` carries the first empty bucket, where a
    /// new entry belongs.
    ///
    /// `verify_stored` gates the second-tier filter: when set, the cached
    /// truncated hash must match before `eq` is consulted. Callers with
    /// trivially comparable keys pass `false` and go straight from the ctrl
    /// byte to `eq`.
    pub(crate) fn probe(
        &self,
        hash: u64,
        verify_stored: bool,
        mut eq: impl FnMut(usize) -> bool,
    ) -> Result<Hit, usize> {
        debug_assert!(self.is_allocated());
        let buckets = self.ctrl.len();
        let stored = W::truncate(hash);
        let wanted = partial(hash);
        let mut bucket = self.home(stored);
        loop {
            let ctrl = self.ctrl[bucket];
            if ctrl == 0 {
                return Err(bucket);
            }
            if ctrl == wanted && (!verify_stored || self.slots[bucket].hash == stored) {
                let index = self.slots[bucket].index.index();
                if eq(index) {
                    return Ok(Hit { bucket, index });
                }
            }
            bucket = (bucket + 1) % buckets;
        }
    }

    /// Finds the bucket currently redirecting to dense `index`, probing from
    /// the home of `hash` (the occupant's own hash). The occupant must exist;
    /// uniqueness of dense indices across occupied buckets makes the match
    /// unambiguous, and the partial byte is only a filter on the way.
    pub(crate) fn locate_index(&self, hash: u64, index: usize) -> usize {
        let buckets = self.ctrl.len();
        let stored = W::truncate(hash);
        let wanted = partial(hash);
        let mut bucket = self.home(stored);
        loop {
            if self.ctrl[bucket] == wanted && self.slots[bucket].index.index() == index {
                return bucket;
            }
            bucket = (bucket + 1) % buckets;
        }
    }

    /// Claims an empty bucket for the entry at dense `index`.
    pub(crate) fn occupy(&mut self, bucket: usize, hash: u64, index: usize) {
        debug_assert_eq!(self.ctrl[bucket], 0);
        self.ctrl[bucket] = partial(hash);
        self.slots[bucket] = Slot {
            hash: W::truncate(hash),
            index: W::from_index(index),
        };
    }

    /// Releases `bucket` and repairs the table around it.
    ///
    /// `last_bucket` must be the bucket redirecting to the dense array's last
    /// entry (`locate_index` on the pre-removal layout); it inherits the
    /// freed dense index before anything moves, so the caller's subsequent
    /// swap-remove of the dense entry lands where the plane expects it. The
    /// freed dense index is returned. When the freed entry *is* the last one,
    /// `last_bucket == bucket` and the patch self-cancels.
    pub(crate) fn release(&mut self, bucket: usize, last_bucket: usize) -> usize {
        let freed = self.slots[bucket].index.index();
        self.slots[last_bucket].index = self.slots[bucket].index;
        self.backward_shift(bucket);
        freed
    }

    /// Closes the gap at `vacated` without tombstones: displaced occupants
    /// slide one slot toward their home until an empty slot or a home-resident
    /// ends the run, then the trailing slot of the run is cleared.
    fn backward_shift(&mut self, vacated: usize) {
        let buckets = self.ctrl.len();
        let mut hole = vacated;
        let mut cur = (vacated + 1) % buckets;
        while self.ctrl[cur] != 0 && self.displacement(cur) > 0 {
            self.ctrl[hole] = self.ctrl[cur];
            self.slots[hole] = self.slots[cur];
            hole = cur;
            cur = (cur + 1) % buckets;
        }
        self.ctrl[hole] = 0;
    }

    #[inline]
    pub(crate) fn needs_grow(&self, occupied: usize) -> bool {
        occupied * LOAD_DEN > self.ctrl.len() * LOAD_NUM
    }

    /// Doubles the bucket arrays. Called after an insertion pushed the load
    /// past the threshold.
    pub(crate) fn grow(&mut self) {
        self.rehash(self.ctrl.len() * 2);
    }

    /// Explicitly requested rehash: shrinks below 40% load, grows at or above
    /// 80%, otherwise rebuilds at the same size. No-op before the first
    /// allocation.
    pub(crate) fn rebalance(&mut self, occupied: usize) {
        let buckets = self.ctrl.len();
        if buckets == 0 {
            return;
        }
        let target = if occupied * LOAD_DEN >= buckets * LOAD_NUM {
            buckets * 2
        } else if occupied * LOAD_DEN < buckets * 2 {
            (buckets / 2).max(FLOOR_BUCKETS)
        } else {
            buckets
        };
        self.rehash(target);
    }

    /// Rebuilds the bucket arrays at `buckets`, re-probing every occupant
    /// from its cached truncated hash. Dense storage is untouched and every
    /// slot travels with its dense index, so this never reads a key and
    /// never recomputes a hash.
    fn rehash(&mut self, buckets: usize) {
        let mut ctrl = vec![0u8; buckets];
        let mut slots = vec![Slot::default(); buckets];
        for from in 0..self.ctrl.len() {
            if self.ctrl[from] == 0 {
                continue;
            }
            let mut to = (self.slots[from].hash.widen() % buckets as u64) as usize;
            while ctrl[to] != 0 {
                to = (to + 1) % buckets;
            }
            ctrl[to] = self.ctrl[from];
            slots[to] = self.slots[from];
        }
        self.ctrl = ctrl;
        self.slots = slots;
        self.epoch += 1;
    }

    /// Drops the bucket arrays entirely. The next insertion re-allocates at
    /// the floor size.
    pub(crate) fn clear(&mut self) {
        self.ctrl = Vec::new();
        self.slots = Vec::new();
        self.epoch += 1;
    }

    /// Wipes occupancy in O(buckets) but keeps the allocation.
    pub(crate) fn fast_clear(&mut self) {
        self.ctrl.fill(0);
        self.slots.fill(Slot::default());
        self.epoch += 1;
    }

    /// Test-only structural audit: ctrl encoding, dense-index permutation and
    /// the no-gap probing invariant.
    #[cfg(test)]
    pub(crate) fn audit(&self, occupied: usize) {
        let buckets = self.ctrl.len();
        let mut seen = vec![false; occupied];
        let mut live = 0usize;
        for bucket in 0..buckets {
            let ctrl = self.ctrl[bucket];
            if ctrl == 0 {
                continue;
            }
            assert!(ctrl & OCCUPIED_BIT != 0, "ctrl byte without occupancy bit");
            live += 1;
            let index = self.slots[bucket].index.index();
            assert!(index < occupied, "dense index out of range");
            assert!(!seen[index], "dense index referenced twice");
            seen[index] = true;
            // Every slot between home and the occupant must be occupied.
            let mut walk = self.home(self.slots[bucket].hash);
            while walk != bucket {
                assert_ne!(self.ctrl[walk], 0, "gap on the probe path");
                walk = (walk + 1) % buckets;
            }
        }
        assert_eq!(live, occupied, "occupied bucket count disagrees");
    }
}

impl<W: IndexWidth> Default for RawTable<W> {
    fn default() -> Self {
        Self::new()
    }
}

/// True when equality on `K` is no more work than the cached-hash compare
/// itself, making the second-tier filter pure overhead. Holds for primitive
/// numerics and other small plain-data keys; heap-owning keys (`String`,
/// boxes) fail the `needs_drop` test and keep the filter.
#[inline(always)]
pub(crate) const fn trivial_eq<K>() -> bool {
    mem::size_of::<K>() <= mem::size_of::<u64>() && !mem::needs_drop::<K>()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spread(i: u64) -> u64 {
        // Cheap stand-in hash with decent bucket spread.
        mix64(i, 0x9e37_79b9_7f4a_7c15)
    }

    /// Partial bytes always carry the occupancy bit, so no stored byte can
    /// read as empty.
    #[test]
    fn partial_never_zero() {
        for i in 0..4096u64 {
            assert_ne!(partial(spread(i)), 0);
            assert!(partial(spread(i)) & OCCUPIED_BIT != 0);
        }
    }

    /// Insert-only workload: every index findable, audit passes, growth kicks
    /// in past the load threshold.
    #[test]
    fn occupy_then_probe_round_trip() {
        let mut table: RawTable<u32> = RawTable::new();
        table.allocate_floor();
        let hashes: Vec<u64> = (0..800).map(spread).collect();
        for (i, &h) in hashes.iter().enumerate() {
            match table.probe(h, true, |_| false) {
                Ok(_) => panic!("nothing should match yet"),
                Err(vacant) => table.occupy(vacant, h, i),
            }
        }
        table.audit(hashes.len());
        for (i, &h) in hashes.iter().enumerate() {
            let hit = table.probe(h, true, |idx| idx == i).expect("must find");
            assert_eq!(hit.index, i);
        }
        assert!(!table.needs_grow(800));
        assert!(table.needs_grow(820));
    }

    /// Backward shift keeps probe paths gap-free and clears exactly one
    /// trailing slot per removal, under a fully colliding cluster.
    #[test]
    fn release_repairs_cluster() {
        let mut table: RawTable<u32> = RawTable::new();
        table.allocate_floor();
        // Identical hashes share one home bucket: worst-case displaced run.
        let colliders = vec![spread(7); 16];
        let mut len = 0usize;
        for (i, &h) in colliders.iter().enumerate() {
            let vacant = table.probe(h, true, |_| false).unwrap_err();
            table.occupy(vacant, h, i);
            len = i + 1;
        }
        table.audit(len);
        // Remove from the middle of the run repeatedly; swap the dense tail
        // index the way the owning table would.
        while len > 0 {
            let victim = len / 2;
            let hit = table.probe(colliders[victim], true, |idx| idx == victim).unwrap();
            let last_bucket = table.locate_index(colliders[len - 1], len - 1);
            let freed = table.release(hit.bucket, last_bucket);
            assert_eq!(freed, victim);
            len -= 1;
            // Mirror of the dense swap-remove: the entry formerly at `len`
            // now answers to index `victim`.
            if victim != len {
                let moved = table.probe(colliders[len], true, |idx| idx == victim);
                assert!(moved.is_ok(), "patched redirect must resolve");
            }
            table.audit(len);
        }
    }

    /// Rehash preserves occupancy and dense indices while changing geometry.
    #[test]
    fn rehash_is_index_preserving() {
        let mut table: RawTable<u32> = RawTable::new();
        table.allocate_floor();
        let hashes: Vec<u64> = (0..900).map(spread).collect();
        for (i, &h) in hashes.iter().enumerate() {
            let vacant = table.probe(h, true, |_| false).unwrap_err();
            table.occupy(vacant, h, i);
        }
        let before = table.epoch();
        table.grow();
        assert_eq!(table.bucket_count(), 2 * FLOOR_BUCKETS);
        assert_eq!(table.epoch(), before + 1);
        table.audit(hashes.len());
        for (i, &h) in hashes.iter().enumerate() {
            assert!(table.probe(h, true, |idx| idx == i).is_ok());
        }
    }

    /// Rebalance shrinks a lightly loaded table but never below the floor.
    #[test]
    fn rebalance_respects_floor() {
        let mut table: RawTable<u32> = RawTable::with_buckets(4096);
        for i in 0..100u64 {
            let h = spread(i);
            let vacant = table.probe(h, true, |_| false).unwrap_err();
            table.occupy(vacant, h, i as usize);
        }
        table.rebalance(100);
        assert_eq!(table.bucket_count(), 2048);
        table.rebalance(100);
        table.rebalance(100);
        assert_eq!(table.bucket_count(), FLOOR_BUCKETS);
        table.audit(100);
    }
}
