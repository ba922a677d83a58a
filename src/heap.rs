//! The tracing value heap.
//!
//! Values are stored in a slab of slots addressed by [`ValueRef`]. Each slot
//! carries a strong-root count: `retain`/`release` adjust it, and a value
//! with a nonzero count is a collection root. Everything else stays alive
//! only by being reachable from a root through value fields (struct fields,
//! union arguments, function statics, link queues, ref cells), which the
//! collector traces directly. Cycles are collected; ports are deliberately
//! opaque (their contents are rooted by whichever side stored them).
//!
//! Collections are stop-the-world mark-sweep and happen only in `full_gc`
//! (and `maybe_gc`, which callers invoke at instruction boundaries), never
//! inside `alloc`. An instruction can therefore allocate several values and
//! wire them together without intermediate states being collectable.

use tracing::debug;

use crate::value::{Value, ValueRef};

/// Collect once this many allocations have happened since the last
/// collection (the threshold then adapts to the live set).
const INITIAL_GC_THRESHOLD: usize = 4096;

#[derive(Debug)]
struct Slot {
    value: Value,
    roots: u32,
}

/// Running allocation and collection counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Values allocated over the heap's lifetime
    pub allocated: u64,
    /// Values reclaimed by collections
    pub freed: u64,
    /// Completed collections
    pub collections: u64,
    /// Highest live count observed
    pub peak_live: usize,
}

/// The value heap.
#[derive(Debug)]
pub struct Heap {
    slots: Vec<Option<Slot>>,
    free: Vec<u32>,
    live_count: usize,
    allocs_since_gc: usize,
    gc_threshold: usize,
    stats: HeapStats,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    /// Create an empty heap
    pub fn new() -> Self {
        Self::with_gc_threshold(INITIAL_GC_THRESHOLD)
    }

    /// Create an empty heap with a custom collection threshold
    pub fn with_gc_threshold(gc_threshold: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live_count: 0,
            allocs_since_gc: 0,
            gc_threshold,
            stats: HeapStats::default(),
        }
    }

    /// Allocate a value. The new value is born with one strong root, which
    /// the caller owns and must eventually `release`.
    pub fn alloc(&mut self, value: Value) -> ValueRef {
        self.allocs_since_gc += 1;
        self.live_count += 1;
        self.stats.allocated += 1;
        self.stats.peak_live = self.stats.peak_live.max(self.live_count);
        let slot = Slot { value, roots: 1 };
        match self.free.pop() {
            Some(index) => {
                debug_assert!(self.slots[index as usize].is_none());
                self.slots[index as usize] = Some(slot);
                ValueRef(index)
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Some(slot));
                ValueRef(index)
            }
        }
    }

    fn slot(&self, v: ValueRef) -> &Slot {
        self.slots[v.index()]
            .as_ref()
            .expect("use of collected value")
    }

    fn slot_mut(&mut self, v: ValueRef) -> &mut Slot {
        self.slots[v.index()]
            .as_mut()
            .expect("use of collected value")
    }

    /// Read a value
    pub fn get(&self, v: ValueRef) -> &Value {
        &self.slot(v).value
    }

    /// Mutate a value. Reserved for the few legitimately mutable cases:
    /// tying ref cells and link queues.
    pub fn get_mut(&mut self, v: ValueRef) -> &mut Value {
        &mut self.slot_mut(v).value
    }

    /// Take a strong root on a value
    pub fn retain(&mut self, v: ValueRef) {
        self.slot_mut(v).roots += 1;
    }

    /// Drop a strong root. The value is not freed eagerly; unreachable
    /// values are reclaimed at the next collection.
    pub fn release(&mut self, v: ValueRef) {
        let slot = self.slot_mut(v);
        debug_assert!(slot.roots > 0, "release without matching retain");
        slot.roots = slot.roots.saturating_sub(1);
    }

    /// Follow `Ref` chains to the strict value behind `v`. Returns `None` if
    /// the chain ends at a still-untied ref (the value is undefined).
    pub fn strict(&self, v: ValueRef) -> Option<ValueRef> {
        let mut current = v;
        loop {
            match self.get(current) {
                Value::Ref { value: Some(next) } => current = *next,
                Value::Ref { value: None } => return None,
                _ => return Some(current),
            }
        }
    }

    /// Collect if enough allocation has happened since the last collection.
    /// Called at instruction boundaries only.
    pub fn maybe_gc(&mut self) {
        if self.allocs_since_gc >= self.gc_threshold {
            self.full_gc();
        }
    }

    /// Perform a complete collection now.
    pub fn full_gc(&mut self) {
        let mut marked = vec![false; self.slots.len()];
        let mut worklist: Vec<ValueRef> = Vec::new();

        for (index, slot) in self.slots.iter().enumerate() {
            if let Some(slot) = slot {
                if slot.roots > 0 {
                    marked[index] = true;
                    worklist.push(ValueRef(index as u32));
                }
            }
        }

        while let Some(v) = worklist.pop() {
            self.refs(v, |child| {
                if !marked[child.index()] {
                    marked[child.index()] = true;
                    worklist.push(child);
                }
            });
        }

        let mut freed = 0usize;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_some() && !marked[index] {
                // Dropping the slot runs the value's cleanup: link queue
                // nodes, executable references, port cell handles.
                *slot = None;
                self.free.push(index as u32);
                freed += 1;
            }
        }

        self.live_count -= freed;
        self.allocs_since_gc = 0;
        self.stats.freed += freed as u64;
        self.stats.collections += 1;
        let live = self.live_count;
        self.gc_threshold = self.gc_threshold.max(live);
        debug!(target: "rill::heap", live, freed, "collection finished");
    }

    /// Enumerate the outgoing heap references of a value.
    pub fn refs(&self, v: ValueRef, callback: impl FnMut(ValueRef)) {
        trace_refs(&self.slot(v).value, callback);
    }

    /// Number of live (allocated, uncollected) values
    pub fn live(&self) -> usize {
        self.live_count
    }

    /// Allocation and collection counters since the heap was created
    pub fn stats(&self) -> HeapStats {
        self.stats
    }

    /// Root count of a value, for tests
    #[cfg(test)]
    pub(crate) fn roots(&self, v: ValueRef) -> u32 {
        self.slot(v).roots
    }
}

/// Enumerate the outgoing heap references of a value.
fn trace_refs(value: &Value, mut visit: impl FnMut(ValueRef)) {
    match value {
        Value::Type => {}
        Value::Struct { fields } => {
            for &field in fields.iter() {
                visit(field);
            }
        }
        Value::Union { arg, .. } => visit(*arg),
        Value::Func { statics, .. } => {
            for &s in statics.iter() {
                visit(s);
            }
        }
        Value::Link { queue } => {
            for &queued in queue {
                visit(queued);
            }
        }
        // Port contents are rooted by whichever side stored them; the slot
        // is shared with the host and not traced.
        Value::Port { .. } => {}
        Value::Ref { value } => {
            if let Some(v) = value {
                visit(*v);
            }
        }
    }
}
