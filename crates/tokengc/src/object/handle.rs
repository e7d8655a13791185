//! Object identity and reference handles

use std::fmt;

/// Index of an object in its collector's object table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub(crate) u32);

impl ObjectId {
    /// Create an id from a table index
    pub const fn from_index(index: u32) -> Self {
        Self(index)
    }

    /// Table index
    #[inline(always)]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Strong reference to a managed object
///
/// This is the value stored inside instance memory and described by token
/// streams. The low half holds `index + 1` (so zero is null), the high half
/// the serial number of the table slot at allocation time, which makes a
/// handle to a freed and reused slot detectable.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct ObjectRef(u64);

impl ObjectRef {
    /// The null reference
    pub const NULL: ObjectRef = ObjectRef(0);

    pub(crate) fn new(id: ObjectId, serial: u32) -> Self {
        Self(((serial as u64) << 32) | (id.0 as u64 + 1))
    }

    /// Check for null
    #[inline(always)]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Object id, or `None` for null
    #[inline(always)]
    pub fn id(self) -> Option<ObjectId> {
        match self.0 as u32 {
            0 => None,
            low => Some(ObjectId(low - 1)),
        }
    }

    /// Serial number of the slot this handle was issued for
    #[inline(always)]
    pub fn serial(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Reset to null
    pub fn clear(&mut self) {
        self.0 = 0;
    }

    /// Take the reference, leaving null behind
    pub fn take(&mut self) -> ObjectRef {
        std::mem::take(self)
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id() {
            None => write!(f, "ObjectRef(null)"),
            Some(id) => write!(f, "ObjectRef({}:{})", id, self.serial()),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id() {
            None => write!(f, "null"),
            Some(id) => write!(f, "{}:{}", id, self.serial()),
        }
    }
}

/// Weak reference to a managed object
///
/// Never keeps its target alive. Reset to null during the purge that
/// destroys the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct WeakObjectRef(ObjectRef);

impl WeakObjectRef {
    /// The null weak reference
    pub const NULL: WeakObjectRef = WeakObjectRef(ObjectRef::NULL);

    /// Weak reference to `target`
    pub fn new(target: ObjectRef) -> Self {
        Self(target)
    }

    /// Current target (null once the target died)
    #[inline(always)]
    pub fn get(self) -> ObjectRef {
        self.0
    }

    /// Check for null
    pub fn is_null(self) -> bool {
        self.0.is_null()
    }

    /// Retarget
    pub fn set(&mut self, target: ObjectRef) {
        self.0 = target;
    }

    /// Reset to null
    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub(crate) fn as_strong_mut(&mut self) -> &mut ObjectRef {
        &mut self.0
    }
}

impl From<ObjectRef> for WeakObjectRef {
    fn from(target: ObjectRef) -> Self {
        Self(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_ref() {
        let r = ObjectRef::NULL;
        assert!(r.is_null());
        assert_eq!(r.id(), None);
        assert_eq!(ObjectRef::default(), ObjectRef::NULL);
    }

    #[test]
    fn test_ref_packs_index_and_serial() {
        let r = ObjectRef::new(ObjectId(0), 7);
        assert!(!r.is_null());
        assert_eq!(r.id(), Some(ObjectId(0)));
        assert_eq!(r.serial(), 7);

        let r = ObjectRef::new(ObjectId(41), 0);
        assert_eq!(r.id(), Some(ObjectId(41)));
        assert_eq!(r.serial(), 0);
    }

    #[test]
    fn test_take_leaves_null() {
        let mut r = ObjectRef::new(ObjectId(3), 1);
        let taken = r.take();
        assert!(r.is_null());
        assert_eq!(taken.id(), Some(ObjectId(3)));
    }

    #[test]
    fn test_weak_ref_layout_matches_strong() {
        assert_eq!(
            std::mem::size_of::<WeakObjectRef>(),
            std::mem::size_of::<ObjectRef>()
        );
        let mut weak = WeakObjectRef::new(ObjectRef::new(ObjectId(2), 1));
        assert!(!weak.is_null());
        weak.clear();
        assert!(weak.is_null());
    }

    #[test]
    fn test_display() {
        assert_eq!(ObjectRef::new(ObjectId(5), 2).to_string(), "#5:2");
        assert_eq!(ObjectRef::NULL.to_string(), "null");
        assert_eq!(format!("{:?}", ObjectRef::NULL), "ObjectRef(null)");
    }
}
