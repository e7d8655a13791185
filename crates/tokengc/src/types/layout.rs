//! Field layouts
//!
//! A `FieldLayout` lists the reference-bearing fields of a type in
//! declaration order and compiles them into a token stream, the same way
//! `PointerMap` describes pointer slots for a plain mark-sweep heap.

use super::token::{ReferenceTokenStream, TokenKind};
use crate::defaults::MAX_TOKEN_OFFSET;
use crate::gc::ReferenceVisitor;
use crate::{GcError, GcResult};
use std::fmt;
use std::ptr::NonNull;

/// Custom trace callback
///
/// Receives the base of the innermost context (the object itself, or the
/// array element being traced) and must report every reference it owns.
///
/// # Safety
///
/// The pointer is the base of a live value of the type the callback was
/// registered for; the callback may only reinterpret it as that type.
pub type CustomTraceFn = unsafe fn(NonNull<u8>, &mut ReferenceVisitor<'_>);

/// One reference-bearing field
#[derive(Clone)]
pub enum Field {
    /// `ObjectRef`
    Object {
        /// Byte offset
        offset: usize,
        /// Field name
        name: String,
    },
    /// `ObjectRef` that keeps its target alive unconditionally
    Persistent {
        /// Byte offset
        offset: usize,
        /// Field name
        name: String,
    },
    /// `WeakObjectRef`
    Weak {
        /// Byte offset
        offset: usize,
        /// Field name
        name: String,
    },
    /// `ManagedArray<ObjectRef>`
    ObjectArray {
        /// Byte offset
        offset: usize,
        /// Field name
        name: String,
    },
    /// `ManagedArray<S>` with element fields in `fields`
    StructArray {
        /// Byte offset
        offset: usize,
        /// Field name
        name: String,
        /// `size_of::<S>()`
        stride: usize,
        /// Fields of one element, relative to the element
        fields: FieldLayout,
    },
    /// `[S; N]` with element fields in `fields`
    FixedArray {
        /// Byte offset
        offset: usize,
        /// Field name
        name: String,
        /// `size_of::<S>()`
        stride: usize,
        /// `N`
        count: usize,
        /// Fields of one element, relative to the element
        fields: FieldLayout,
    },
    /// Embedded struct with fields relative to `offset`
    Struct {
        /// Byte offset
        offset: usize,
        /// Field name
        name: String,
        /// Fields of the struct
        fields: FieldLayout,
    },
    /// Custom callback for members tokens cannot describe
    Custom {
        /// Name shown in diagnostics
        name: String,
        /// Callback
        callback: CustomTraceFn,
    },
}

/// Declared reference-bearing fields of a type or struct
///
/// # Safety
///
/// Offsets are trusted. Compiling a layout checks that every field lies
/// inside the instance and is aligned for its kind, but not that the bytes
/// there hold the declared type. A layout registered for `T` must name, at
/// each offset, a field of exactly the declared kind:
///
/// - `object`, `persistent`: an `ObjectRef`
/// - `weak`: a `WeakObjectRef`
/// - `object_array`: a `ManagedArray<ObjectRef>`
/// - `struct_array`, `fixed_array`: a `ManagedArray<S>` or `[S; count]`
///   whose `S` is `stride` bytes and matches the nested layout
/// - `inline_struct`: a struct matching the nested layout
///
/// Use `offset_of!` on the real field. Any other offset makes the tracer
/// read and write memory as the wrong type.
#[derive(Clone, Default)]
pub struct FieldLayout {
    fields: Vec<Field>,
}

impl FieldLayout {
    /// Create an empty layout
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field
    pub fn field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    /// Add an `ObjectRef` field
    ///
    /// `offset` must be `offset_of!` an `ObjectRef`; see the layout contract
    /// on [`FieldLayout`].
    pub fn object(self, offset: usize, name: &str) -> Self {
        self.field(Field::Object {
            offset,
            name: name.to_string(),
        })
    }

    /// Add an always-rooting `ObjectRef` field
    pub fn persistent(self, offset: usize, name: &str) -> Self {
        self.field(Field::Persistent {
            offset,
            name: name.to_string(),
        })
    }

    /// Add a `WeakObjectRef` field
    pub fn weak(self, offset: usize, name: &str) -> Self {
        self.field(Field::Weak {
            offset,
            name: name.to_string(),
        })
    }

    /// Add a `ManagedArray<ObjectRef>` field
    pub fn object_array(self, offset: usize, name: &str) -> Self {
        self.field(Field::ObjectArray {
            offset,
            name: name.to_string(),
        })
    }

    /// Add a `ManagedArray<S>` field, `stride` being `size_of::<S>()`
    ///
    /// `fields` are relative to one element and follow the same contract.
    pub fn struct_array(self, offset: usize, name: &str, stride: usize, fields: FieldLayout) -> Self {
        self.field(Field::StructArray {
            offset,
            name: name.to_string(),
            stride,
            fields,
        })
    }

    /// Add a `[S; count]` field
    pub fn fixed_array(
        self,
        offset: usize,
        name: &str,
        stride: usize,
        count: usize,
        fields: FieldLayout,
    ) -> Self {
        self.field(Field::FixedArray {
            offset,
            name: name.to_string(),
            stride,
            count,
            fields,
        })
    }

    /// Add a `[ObjectRef; count]` field
    pub fn fixed_objects(self, offset: usize, name: &str, count: usize) -> Self {
        let stride = std::mem::size_of::<crate::object::ObjectRef>();
        self.fixed_array(offset, name, stride, count, FieldLayout::new().object(0, ""))
    }

    /// Add an embedded struct
    pub fn inline_struct(self, offset: usize, name: &str, fields: FieldLayout) -> Self {
        self.field(Field::Struct {
            offset,
            name: name.to_string(),
            fields,
        })
    }

    /// Add a custom callback
    pub fn custom(self, name: &str, callback: CustomTraceFn) -> Self {
        self.field(Field::Custom {
            name: name.to_string(),
            callback,
        })
    }

    /// Append all fields of `other`
    pub fn extend(mut self, other: FieldLayout) -> Self {
        self.fields.extend(other.fields);
        self
    }

    /// Declared fields
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Check whether any field can hold a reference
    pub fn has_references(&self) -> bool {
        self.fields.iter().any(|field| match field {
            Field::StructArray { fields, .. } | Field::Struct { fields, .. } => {
                fields.has_references()
            }
            Field::FixedArray { fields, count, .. } => *count > 0 && fields.has_references(),
            _ => true,
        })
    }

    /// Compile into `stream` for an instance of `size` bytes
    pub fn emit_into(
        &self,
        stream: &mut ReferenceTokenStream,
        type_name: &str,
        size: usize,
    ) -> GcResult<()> {
        let mut emitter = Emitter {
            stream,
            type_name,
        };
        emitter.emit_fields(self, 0, size, "")
    }
}

struct Emitter<'a> {
    stream: &'a mut ReferenceTokenStream,
    type_name: &'a str,
}

impl Emitter<'_> {
    fn emit_fields(&mut self, layout: &FieldLayout, base: usize, bound: usize, prefix: &str) -> GcResult<()> {
        for field in &layout.fields {
            match field {
                Field::Object { offset, name } => {
                    self.emit_ref(TokenKind::Object, base + offset, bound, &join(prefix, name))?;
                }
                Field::Persistent { offset, name } => {
                    self.emit_ref(TokenKind::PersistentObject, base + offset, bound, &join(prefix, name))?;
                }
                Field::Weak { offset, name } => {
                    self.emit_ref(TokenKind::WeakObject, base + offset, bound, &join(prefix, name))?;
                }
                Field::ObjectArray { offset, name } => {
                    self.emit_ref(TokenKind::ArrayObject, base + offset, bound, &join(prefix, name))?;
                }
                Field::StructArray {
                    offset,
                    name,
                    stride,
                    fields,
                } => {
                    if !fields.has_references() {
                        continue;
                    }
                    let path = join(prefix, name);
                    self.emit_ref(TokenKind::ArrayStruct, base + offset, bound, &path)?;
                    self.stream.emit_stride(self.word(*stride, &path)?);
                    let placeholder = self.stream.emit_skip_placeholder();
                    self.emit_fields(fields, 0, *stride, &format!("{}[].", path))?;
                    let target = self.stream.emit_return()?;
                    self.stream.patch_skip(placeholder, target)?;
                }
                Field::FixedArray {
                    offset,
                    name,
                    stride,
                    count,
                    fields,
                } => {
                    if *count == 0 || !fields.has_references() {
                        continue;
                    }
                    let path = join(prefix, name);
                    let start = base + offset;
                    self.check_bounds(start, stride * count, bound, &path)?;
                    self.stream
                        .emit_named(TokenKind::FixedArray, self.word(start, &path)?, &path);
                    self.stream.emit_stride(self.word(*stride, &path)?);
                    self.stream.emit_count(self.word(*count, &path)?);
                    self.emit_fields(fields, 0, *stride, &format!("{}[].", path))?;
                    self.stream.emit_return()?;
                }
                Field::Struct {
                    offset,
                    name,
                    fields,
                } => {
                    self.emit_fields(fields, base + offset, bound, &format!("{}.", join(prefix, name)))?;
                }
                Field::Custom { name, callback } => {
                    self.stream.emit_custom(*callback, &join(prefix, name));
                }
            }
        }
        Ok(())
    }

    fn emit_ref(&mut self, kind: TokenKind, offset: usize, bound: usize, path: &str) -> GcResult<u32> {
        self.check_bounds(offset, kind.field_size(), bound, path)?;
        let align = kind.field_align();
        if offset % align != 0 {
            return Err(GcError::MisalignedField {
                type_name: self.type_name.to_string(),
                field: path.to_string(),
                offset,
                align,
            });
        }
        let offset = self.word(offset, path)?;
        Ok(self.stream.emit_named(kind, offset, path))
    }

    fn check_bounds(&self, offset: usize, len: usize, bound: usize, path: &str) -> GcResult<()> {
        if offset + len > bound {
            return Err(GcError::OffsetOutOfBounds {
                type_name: self.type_name.to_string(),
                field: path.to_string(),
                offset,
                size: bound,
            });
        }
        Ok(())
    }

    fn word(&self, value: usize, path: &str) -> GcResult<u32> {
        if value > MAX_TOKEN_OFFSET as usize {
            return Err(GcError::MalformedTokenStream {
                type_name: self.type_name.to_string(),
                index: self.stream.len() as u32,
                reason: format!("{} does not fit a token ({})", path, value),
            });
        }
        Ok(value as u32)
    }
}

fn join(prefix: &str, name: &str) -> String {
    match (prefix.is_empty(), name.is_empty()) {
        (_, true) => prefix.trim_end_matches('.').to_string(),
        (true, false) => name.to_string(),
        (false, false) => format!("{}{}", prefix, name),
    }
}

impl fmt::Debug for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::Object { offset, name } => write!(f, "Object({} @{})", name, offset),
            Field::Persistent { offset, name } => write!(f, "Persistent({} @{})", name, offset),
            Field::Weak { offset, name } => write!(f, "Weak({} @{})", name, offset),
            Field::ObjectArray { offset, name } => write!(f, "ObjectArray({} @{})", name, offset),
            Field::StructArray {
                offset,
                name,
                stride,
                fields,
            } => write!(f, "StructArray({} @{}, stride {}, {:?})", name, offset, stride, fields),
            Field::FixedArray {
                offset,
                name,
                stride,
                count,
                fields,
            } => write!(
                f,
                "FixedArray({} @{}, stride {}, count {}, {:?})",
                name, offset, stride, count, fields
            ),
            Field::Struct {
                offset,
                name,
                fields,
            } => write!(f, "Struct({} @{}, {:?})", name, offset, fields),
            Field::Custom { name, .. } => write!(f, "Custom({})", name),
        }
    }
}

impl fmt::Debug for FieldLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(&self.fields).finish()
    }
}
