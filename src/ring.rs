/// Fixed-capacity, age-ordered record ring used for windowed counting.
///
/// Records are written at the head, which then advances modulo `N`, so the
/// slot under the head is always either vacant or the oldest record. Slots
/// are invalidated in place rather than compacted; insertion is O(1) and
/// every scan is O(N).
pub struct RecordRing<T, const N: usize> {
    slots: [Option<T>; N],
    head: usize,
}

impl<T, const N: usize> RecordRing<T, N> {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| None),
            head: 0,
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// The slot the next `push` will overwrite.
    pub fn evict_slot(&self) -> usize {
        self.head
    }

    /// Store a record, returning whatever valid record it displaced.
    pub fn push(&mut self, record: T) -> Option<T> {
        if N == 0 {
            return Some(record);
        }
        let slot = self.evict_slot();
        let evicted = self.slots[slot].replace(record);
        self.head = (slot + 1) % N;
        evicted
    }

    /// Number of valid records.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|s| s.is_none())
    }

    /// Valid records, in slot order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter().filter_map(|s| s.as_ref())
    }

    pub fn count_where<F: FnMut(&T) -> bool>(&self, mut pred: F) -> usize {
        self.iter().filter(|r| pred(r)).count()
    }

    /// Invalidate every record for which `keep` returns `false`.
    pub fn retain<F: FnMut(&T) -> bool>(&mut self, mut keep: F) {
        for slot in self.slots.iter_mut() {
            if slot.as_ref().is_some_and(|r| !keep(r)) {
                *slot = None;
            }
        }
    }

    /// Invalidate every record. The head keeps its position.
    pub fn invalidate_all(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
    }

    /// Invalidate every record and rewind the head.
    pub fn clear(&mut self) {
        self.invalidate_all();
        self.head = 0;
    }
}

impl<T, const N: usize> Default for RecordRing<T, N> {
    fn default() -> Self {
        Self::new()
    }
}
