//! Token stream tracer
//!
//! Walks an instance's token stream and reports every reference it holds to
//! a `ReferenceCollector`. The walk keeps an explicit stack of array contexts
//! (element base, stride, remaining elements, loop start); a token's return
//! count pops contexts, and a context with elements left jumps back to its
//! loop start instead. The same tracer drives marking and every diagnostic.

use crate::defaults::MAX_NESTING_DEPTH;
use crate::object::{ObjectId, ObjectRef, RawArrayHeader, WeakObjectRef};
use crate::types::{ReferenceInfo, SkipInfo, TokenKind, TypeDescriptor};
use crate::{fatal, GcError};
use std::marker::PhantomData;
use std::ptr::NonNull;

/// How a reference was found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceKind {
    /// `Object` token or array element
    Strong,
    /// `PersistentObject` token
    Persistent,
    /// `WeakObject` token or `add_weak_reference`
    Weak,
    /// Reported by a custom callback
    Native,
}

/// Where a reference came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceOrigin {
    /// Object being traced
    pub referencer: ObjectId,
    /// Token that produced the reference; `None` for custom callbacks
    pub token_index: Option<u32>,
    /// Reference kind
    pub kind: ReferenceKind,
}

/// A reference reported by the tracer
///
/// Either a field inside instance memory, which the collector may reset, or
/// a value reported by a custom callback, which is read-only.
pub struct ReferenceSlot<'a> {
    field: Option<NonNull<ObjectRef>>,
    value: ObjectRef,
    _instance: PhantomData<&'a mut ObjectRef>,
}

impl<'a> ReferenceSlot<'a> {
    /// Slot for a field
    #[inline(always)]
    pub fn field(field: &'a mut ObjectRef) -> Self {
        let value = *field;
        Self {
            field: Some(NonNull::from(field)),
            value,
            _instance: PhantomData,
        }
    }

    /// Read-only reference
    #[inline(always)]
    pub fn value(value: ObjectRef) -> Self {
        Self {
            field: None,
            value,
            _instance: PhantomData,
        }
    }

    /// # Safety
    ///
    /// `field` must point to a live `ObjectRef` for `'a`.
    #[inline(always)]
    unsafe fn from_raw(field: *mut ObjectRef) -> Self {
        Self {
            field: Some(NonNull::new_unchecked(field)),
            value: *field,
            _instance: PhantomData,
        }
    }

    /// Referenced object
    #[inline(always)]
    pub fn get(&self) -> ObjectRef {
        self.value
    }

    /// Whether the reference can be reset in place
    pub fn is_field(&self) -> bool {
        self.field.is_some()
    }

    /// Reset the field to null; no-op for read-only references
    ///
    /// # Safety
    ///
    /// The caller must have exclusive access to the field, which the
    /// collector has for the object it is tracing during a pass.
    pub(crate) unsafe fn clear(&self) {
        if let Some(field) = self.field {
            field.as_ptr().write(ObjectRef::NULL);
        }
    }
}

/// Receiver of traced references
pub trait ReferenceCollector {
    /// Strong, persistent or native reference
    fn handle_object_reference(&mut self, slot: &ReferenceSlot<'_>, origin: ReferenceOrigin);

    /// Weak reference
    ///
    /// Weak references never keep their target alive; the default ignores them.
    fn handle_weak_reference(&mut self, slot: &ReferenceSlot<'_>, origin: ReferenceOrigin) {
        let _ = (slot, origin);
    }

    /// Stop tracing the current object once this returns true
    #[inline(always)]
    fn is_satisfied(&self) -> bool {
        false
    }
}

/// Interface handed to custom trace callbacks
pub struct ReferenceVisitor<'a> {
    collector: &'a mut dyn ReferenceCollector,
    referencer: ObjectId,
}

impl<'a> ReferenceVisitor<'a> {
    /// Wrap a collector for references held by `referencer`
    pub fn new(collector: &'a mut dyn ReferenceCollector, referencer: ObjectId) -> Self {
        Self {
            collector,
            referencer,
        }
    }

    /// Object whose references are being reported
    pub fn referencer(&self) -> ObjectId {
        self.referencer
    }

    fn origin(&self, kind: ReferenceKind) -> ReferenceOrigin {
        ReferenceOrigin {
            referencer: self.referencer,
            token_index: None,
            kind,
        }
    }

    /// Report a reference field the collector may reset
    pub fn add_referenced_object(&mut self, reference: &mut ObjectRef) {
        let origin = self.origin(ReferenceKind::Native);
        self.collector
            .handle_object_reference(&ReferenceSlot::field(reference), origin);
    }

    /// Report a reference that cannot be reset (e.g. a map key)
    pub fn add_referenced_value(&mut self, reference: ObjectRef) {
        let origin = self.origin(ReferenceKind::Native);
        self.collector
            .handle_object_reference(&ReferenceSlot::value(reference), origin);
    }

    /// Report a run of reference fields
    pub fn add_referenced_objects(&mut self, references: &mut [ObjectRef]) {
        for reference in references {
            self.add_referenced_object(reference);
        }
    }

    /// Report a weak reference
    pub fn add_weak_reference(&mut self, reference: &mut WeakObjectRef) {
        let origin = self.origin(ReferenceKind::Weak);
        self.collector
            .handle_weak_reference(&ReferenceSlot::field(reference.as_strong_mut()), origin);
    }
}

#[derive(Debug, Clone, Copy)]
struct StackEntry {
    data: *mut u8,
    stride: usize,
    remaining: usize,
    loop_start: usize,
}

/// Reusable token stream walker
///
/// Holds the array context stack so repeated traces do not allocate.
#[derive(Debug)]
pub struct Tracer {
    stack: Vec<StackEntry>,
}

// SAFETY: the stack only holds pointers between `trace` entry and exit.
unsafe impl Send for Tracer {}

impl Default for Tracer {
    fn default() -> Self {
        Self::new()
    }
}

impl Tracer {
    /// Create a tracer
    pub fn new() -> Self {
        Self {
            stack: Vec::with_capacity(8),
        }
    }

    /// Report every reference of `instance` to `collector`
    ///
    /// # Safety
    ///
    /// `instance` must be the payload of a live object described by
    /// `descriptor`, and no other thread may write its reference fields
    /// during the call.
    pub unsafe fn trace<C: ReferenceCollector>(
        &mut self,
        instance: NonNull<u8>,
        descriptor: &TypeDescriptor,
        referencer: ObjectId,
        collector: &mut C,
    ) {
        let stream = descriptor.token_stream();
        let tokens = stream.tokens();

        self.stack.clear();
        self.stack.push(StackEntry {
            data: instance.as_ptr(),
            stride: 0,
            remaining: 1,
            loop_start: 0,
        });
        let mut data = instance.as_ptr();
        let mut index = 0usize;

        loop {
            if collector.is_satisfied() {
                return;
            }
            let token_index = index;
            let info = ReferenceInfo::from_word(tokens[index]);
            index += 1;

            let mut returns = match info.kind() {
                Some(TokenKind::Object) => {
                    let slot = ReferenceSlot::from_raw(data.add(info.offset() as usize) as *mut ObjectRef);
                    collector.handle_object_reference(
                        &slot,
                        origin(referencer, token_index, ReferenceKind::Strong),
                    );
                    info.return_count()
                }
                Some(TokenKind::PersistentObject) => {
                    let slot = ReferenceSlot::from_raw(data.add(info.offset() as usize) as *mut ObjectRef);
                    collector.handle_object_reference(
                        &slot,
                        origin(referencer, token_index, ReferenceKind::Persistent),
                    );
                    info.return_count()
                }
                Some(TokenKind::WeakObject) => {
                    let slot = ReferenceSlot::from_raw(data.add(info.offset() as usize) as *mut ObjectRef);
                    collector.handle_weak_reference(
                        &slot,
                        origin(referencer, token_index, ReferenceKind::Weak),
                    );
                    info.return_count()
                }
                Some(TokenKind::ArrayObject) => {
                    let header = RawArrayHeader::read(data.add(info.offset() as usize));
                    let elements = header.data as *mut ObjectRef;
                    for element in 0..header.len {
                        let slot = ReferenceSlot::from_raw(elements.add(element));
                        collector.handle_object_reference(
                            &slot,
                            origin(referencer, token_index, ReferenceKind::Strong),
                        );
                    }
                    info.return_count()
                }
                Some(TokenKind::ArrayStruct) => {
                    let header = RawArrayHeader::read(data.add(info.offset() as usize));
                    let stride = tokens[index] as usize;
                    let skip_index = index + 1;
                    let skip = SkipInfo::from_word(tokens[skip_index]);
                    index += 2;
                    self.push(StackEntry {
                        data: header.data,
                        stride,
                        remaining: header.len,
                        loop_start: index,
                    }, descriptor, token_index);
                    data = header.data;
                    if header.len == 0 {
                        index = skip_index + skip.distance() as usize;
                        let last = ReferenceInfo::from_word(tokens[index - 1]);
                        last.return_count() - skip.inner_return_count()
                    } else {
                        0
                    }
                }
                Some(TokenKind::FixedArray) => {
                    let base = data.add(info.offset() as usize);
                    let stride = tokens[index] as usize;
                    let count = tokens[index + 1] as usize;
                    index += 2;
                    self.push(StackEntry {
                        data: base,
                        stride,
                        remaining: count,
                        loop_start: index,
                    }, descriptor, token_index);
                    data = base;
                    0
                }
                Some(TokenKind::Custom) => {
                    let callback = match stream.callback(info.offset()) {
                        Some(callback) => callback,
                        None => fatal(GcError::UnresolvedCallback {
                            type_name: descriptor.name().to_string(),
                            id: info.offset(),
                        }),
                    };
                    let mut visitor = ReferenceVisitor::new(collector, referencer);
                    callback(NonNull::new_unchecked(data), &mut visitor);
                    info.return_count()
                }
                Some(TokenKind::EndOfStream) => return,
                None => fatal(GcError::MalformedTokenStream {
                    type_name: descriptor.name().to_string(),
                    index: token_index as u32,
                    reason: format!("unknown token word {:#x}", info.word()),
                }),
            };

            while returns > 0 {
                let depth = self.stack.len() - 1;
                let entry = &mut self.stack[depth];
                if entry.remaining > 1 {
                    entry.remaining -= 1;
                    entry.data = entry.data.add(entry.stride);
                    data = entry.data;
                    index = entry.loop_start;
                    break;
                }
                returns -= 1;
                self.stack.pop();
                data = match self.stack.last() {
                    Some(parent) => parent.data,
                    None => fatal(GcError::MalformedTokenStream {
                        type_name: descriptor.name().to_string(),
                        index: token_index as u32,
                        reason: "return count pops the instance context".to_string(),
                    }),
                };
            }
        }
    }

    #[inline(always)]
    fn push(&mut self, entry: StackEntry, descriptor: &TypeDescriptor, token_index: usize) {
        if self.stack.len() > MAX_NESTING_DEPTH {
            fatal(GcError::MalformedTokenStream {
                type_name: descriptor.name().to_string(),
                index: token_index as u32,
                reason: "array nesting too deep".to_string(),
            });
        }
        self.stack.push(entry);
    }
}

/// Trace `instance` with a one-off tracer
///
/// # Safety
///
/// Same contract as [`Tracer::trace`].
pub unsafe fn trace_object<C: ReferenceCollector>(
    instance: NonNull<u8>,
    descriptor: &TypeDescriptor,
    referencer: ObjectId,
    collector: &mut C,
) {
    Tracer::new().trace(instance, descriptor, referencer, collector)
}

#[inline(always)]
fn origin(referencer: ObjectId, token_index: usize, kind: ReferenceKind) -> ReferenceOrigin {
    ReferenceOrigin {
        referencer,
        token_index: Some(token_index as u32),
        kind,
    }
}
