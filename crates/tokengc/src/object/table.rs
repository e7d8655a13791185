//! Object table
//!
//! Every managed object occupies one slot. A slot records the payload
//! allocation, the descriptor it was allocated with, the flag word and a
//! serial number bumped whenever the slot is freed, so handles to a reused
//! slot are recognised as stale.
//!
//! Slots below the permanent limit form the permanent pool: objects that
//! existed when the pool was closed. Reachability passes neither flag nor
//! trace them (unless rooted) and references to them are ignored.
//!
//! ```text
//! ┌──────┬──────────────┬────────────┬─────────┬────────┐
//! │ slot │ payload ptr  │ descriptor │ flags   │ serial │
//! ├──────┼──────────────┼────────────┼─────────┼────────┤
//! │  0   │ 0x7f..a0     │ Node       │ ROOT    │   0    │
//! │  1   │ -            │ -          │ -       │   3    │ ← free list
//! │  2   │ 0x7f..e0     │ Holder     │ UNREACH │   1    │
//! └──────┴──────────────┴────────────┴─────────┴────────┘
//! ```

use super::flags::{AtomicObjectFlags, ObjectFlags};
use super::handle::{ObjectId, ObjectRef};
use crate::types::{Managed, TypeDescriptor};
use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::ptr::NonNull;
use std::sync::Arc;

/// One slot of the object table
#[derive(Debug, Default)]
pub struct ObjectItem {
    payload: Option<NonNull<u8>>,
    descriptor: Option<Arc<TypeDescriptor>>,
    flags: AtomicObjectFlags,
    serial: u32,
    /// Cluster this object belongs to, root included
    cluster: Option<u32>,
}

// SAFETY: payloads are `Managed` (Send + Sync); slots are only freed through
// `&mut ObjectTable`, so a shared item never sees its payload released.
unsafe impl Send for ObjectItem {}
unsafe impl Sync for ObjectItem {}

impl ObjectItem {
    /// Payload base, `None` for a free slot
    #[inline(always)]
    pub fn payload(&self) -> Option<NonNull<u8>> {
        self.payload
    }

    /// Descriptor, `None` for a free slot
    #[inline(always)]
    pub fn descriptor(&self) -> Option<&Arc<TypeDescriptor>> {
        self.descriptor.as_ref()
    }

    /// Type name, or `"<free>"`
    pub fn type_name(&self) -> &'static str {
        self.descriptor.as_ref().map_or("<free>", |d| d.name())
    }

    /// Flag word
    #[inline(always)]
    pub fn flags(&self) -> &AtomicObjectFlags {
        &self.flags
    }

    /// Check whether the slot holds an object
    #[inline(always)]
    pub fn is_live(&self) -> bool {
        self.payload.is_some()
    }

    /// Check whether the last pass found this object unreachable
    #[inline(always)]
    pub fn is_unreachable(&self) -> bool {
        self.flags.intersects(ObjectFlags::UNREACHABLE)
    }

    /// Current serial number
    pub fn serial(&self) -> u32 {
        self.serial
    }

    /// Index of the owning cluster
    #[inline(always)]
    pub(crate) fn cluster(&self) -> Option<u32> {
        self.cluster
    }
}

/// All managed objects of one collector
#[derive(Debug, Default)]
pub struct ObjectTable {
    items: Vec<ObjectItem>,
    free_list: Vec<u32>,
    live: usize,
    allocated_bytes: usize,
    permanent_limit: u32,
}

impl ObjectTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate `value` described by `descriptor`
    ///
    /// The caller guarantees `descriptor` describes `T`.
    pub(crate) fn allocate<T: Managed>(
        &mut self,
        descriptor: Arc<TypeDescriptor>,
        value: T,
        flags: ObjectFlags,
    ) -> ObjectRef {
        let layout = Layout::new::<T>();
        let payload = if layout.size() == 0 {
            NonNull::<T>::dangling().cast::<u8>()
        } else {
            // SAFETY: layout has non-zero size.
            let ptr = unsafe { alloc(layout) };
            match NonNull::new(ptr) {
                Some(ptr) => ptr,
                None => handle_alloc_error(layout),
            }
        };
        // SAFETY: payload is valid and aligned for T.
        unsafe { payload.cast::<T>().as_ptr().write(value) };

        let index = match self.free_list.pop() {
            Some(index) => index,
            None => {
                self.items.push(ObjectItem::default());
                (self.items.len() - 1) as u32
            }
        };
        let item = &mut self.items[index as usize];
        item.payload = Some(payload);
        item.descriptor = Some(descriptor);
        item.flags = AtomicObjectFlags::new(flags);

        self.live += 1;
        self.allocated_bytes += layout.size();
        ObjectRef::new(ObjectId(index), item.serial)
    }

    /// Drop the payload and release the slot
    ///
    /// # Safety
    ///
    /// No reference into the payload may outlive this call.
    pub(crate) unsafe fn free(&mut self, id: ObjectId) {
        let Some(item) = self.items.get_mut(id.index()) else {
            return;
        };
        let (Some(payload), Some(descriptor)) = (item.payload.take(), item.descriptor.take()) else {
            return;
        };
        (descriptor.hooks().drop_fn)(payload);
        let layout = descriptor.layout();
        if layout.size() != 0 {
            dealloc(payload.as_ptr(), layout);
        }
        item.flags = AtomicObjectFlags::default();
        item.serial = item.serial.wrapping_add(1);
        item.cluster = None;

        if id.0 >= self.permanent_limit {
            self.free_list.push(id.0);
        }
        self.live -= 1;
        self.allocated_bytes -= layout.size();
    }

    /// Link `id` to a cluster, or unlink it
    pub(crate) fn set_cluster(&mut self, id: ObjectId, cluster: Option<u32>) {
        if let Some(item) = self.items.get_mut(id.index()) {
            item.cluster = cluster;
        }
    }

    /// Make every current slot permanent; returns the live objects it covers
    ///
    /// Free slots below the limit are never reused.
    pub(crate) fn close_permanent_pool(&mut self) -> usize {
        self.permanent_limit = self.items.len() as u32;
        self.free_list.clear();
        self.live
    }

    /// Return the permanent pool to ordinary collection
    pub(crate) fn open_permanent_pool(&mut self) {
        self.permanent_limit = 0;
    }

    /// Slots `0..limit` are permanent
    pub fn permanent_limit(&self) -> usize {
        self.permanent_limit as usize
    }

    /// Check whether `id` lies in the permanent pool
    #[inline(always)]
    pub fn is_permanent(&self, id: ObjectId) -> bool {
        id.0 < self.permanent_limit
    }

    /// Slot by id
    #[inline(always)]
    pub fn item(&self, id: ObjectId) -> Option<&ObjectItem> {
        self.items.get(id.index())
    }

    /// Slot of a handle, if the handle still names a live object
    #[inline(always)]
    pub fn resolve(&self, reference: ObjectRef) -> Option<(ObjectId, &ObjectItem)> {
        let id = reference.id()?;
        let item = self.items.get(id.index())?;
        if item.is_live() && item.serial == reference.serial() {
            Some((id, item))
        } else {
            None
        }
    }

    /// Current handle for a live slot
    pub fn reference_to(&self, id: ObjectId) -> ObjectRef {
        match self.items.get(id.index()) {
            Some(item) if item.is_live() => ObjectRef::new(id, item.serial),
            _ => ObjectRef::NULL,
        }
    }

    /// Number of slots, live or free
    pub fn capacity(&self) -> usize {
        self.items.len()
    }

    /// Number of live objects
    pub fn len(&self) -> usize {
        self.live
    }

    /// Check if no object is live
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Bytes held by live payloads
    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes
    }

    /// Live objects in slot order
    pub fn iter(&self) -> impl Iterator<Item = (ObjectId, &ObjectItem)> + '_ {
        self.items
            .iter()
            .enumerate()
            .filter(|(_, item)| item.is_live())
            .map(|(index, item)| (ObjectId(index as u32), item))
    }

    /// All slots, live or free
    pub(crate) fn slots(&self) -> &[ObjectItem] {
        &self.items
    }
}

impl Drop for ObjectTable {
    fn drop(&mut self) {
        for index in 0..self.items.len() {
            // SAFETY: the table is going away; nothing can observe payloads.
            unsafe { self.free(ObjectId(index as u32)) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static DROPS: AtomicUsize = AtomicUsize::new(0);

    struct Counted(#[allow(dead_code)] u64);
    impl Managed for Counted {}
    impl Drop for Counted {
        fn drop(&mut self) {
            DROPS.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Empty;
    impl Managed for Empty {}

    fn counted_descriptor() -> Arc<TypeDescriptor> {
        TypeDescriptor::leaf::<Counted>("Counted").unwrap()
    }

    #[test]
    fn test_allocate_and_resolve() {
        let mut table = ObjectTable::new();
        let r = table.allocate(counted_descriptor(), Counted(1), ObjectFlags::empty());
        assert_eq!(table.len(), 1);
        let (id, item) = table.resolve(r).unwrap();
        assert_eq!(id, ObjectId(0));
        assert_eq!(item.type_name(), "Counted");
        assert_eq!(table.reference_to(id), r);
        assert_eq!(table.allocated_bytes(), 8);
    }

    #[test]
    fn test_free_bumps_serial() {
        let mut table = ObjectTable::new();
        let before = DROPS.load(Ordering::SeqCst);
        let first = table.allocate(counted_descriptor(), Counted(1), ObjectFlags::empty());
        unsafe { table.free(first.id().unwrap()) };
        assert!(DROPS.load(Ordering::SeqCst) > before);
        assert!(table.resolve(first).is_none());

        let second = table.allocate(counted_descriptor(), Counted(2), ObjectFlags::empty());
        assert_eq!(second.id(), first.id());
        assert_ne!(second.serial(), first.serial());
        assert!(table.resolve(first).is_none());
        assert!(table.resolve(second).is_some());
    }

    #[test]
    fn test_zero_sized_payload() {
        let mut table = ObjectTable::new();
        let descriptor = TypeDescriptor::leaf::<Empty>("Empty").unwrap();
        let r = table.allocate(descriptor, Empty, ObjectFlags::ROOT_SET);
        assert!(table.resolve(r).is_some());
        unsafe { table.free(r.id().unwrap()) };
        assert!(table.is_empty());
    }

    #[test]
    fn test_iter_skips_free_slots() {
        let mut table = ObjectTable::new();
        let a = table.allocate(counted_descriptor(), Counted(1), ObjectFlags::empty());
        let _b = table.allocate(counted_descriptor(), Counted(2), ObjectFlags::empty());
        unsafe { table.free(a.id().unwrap()) };
        let ids: Vec<_> = table.iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![ObjectId(1)]);
        assert_eq!(table.capacity(), 2);
    }

    #[test]
    fn test_permanent_pool_does_not_reuse_slots() {
        let mut table = ObjectTable::new();
        let kept = table.allocate(counted_descriptor(), Counted(1), ObjectFlags::empty());
        let dropped = table.allocate(counted_descriptor(), Counted(2), ObjectFlags::empty());
        unsafe { table.free(dropped.id().unwrap()) };

        assert_eq!(table.close_permanent_pool(), 1);
        assert_eq!(table.permanent_limit(), 2);
        assert!(table.is_permanent(kept.id().unwrap()));

        let fresh = table.allocate(counted_descriptor(), Counted(3), ObjectFlags::empty());
        assert_eq!(fresh.id(), Some(ObjectId(2)));
        assert!(!table.is_permanent(ObjectId(2)));

        table.open_permanent_pool();
        assert!(!table.is_permanent(kept.id().unwrap()));
    }
}
