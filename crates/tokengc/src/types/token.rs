//! Reference token streams
//!
//! A token stream is a compact, per-type program describing where object
//! references live inside an instance. Each word of the stream is one of:
//!
//! ```text
//! ReferenceInfo  [ return count : 8 | kind : 5 | offset : 19 ]
//! Stride         element size of the enclosing array
//! Count          element count of a fixed-size array
//! SkipInfo       [ distance : 24 | inner return count : 8 ]
//! ```
//!
//! Arrays of structs are encoded as
//! `ArrayStruct, Stride, SkipInfo, <element tokens...>` where the last element
//! token carries a return count that pops the array context. The skip word
//! lets the tracer jump over the element tokens of an empty array in O(1).

use super::layout::CustomTraceFn;
use crate::defaults::{MAX_NESTING_DEPTH, MAX_RETURN_COUNT, MAX_SKIP_DISTANCE, MAX_TOKEN_OFFSET};
use crate::object::{ObjectRef, RawArrayHeader};
use crate::{GcError, GcResult};
use std::fmt;

/// Kind of a reference token
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    /// Strong reference (`ObjectRef`)
    Object = 1,
    /// Strong reference that is never eliminated and roots its target
    PersistentObject = 2,
    /// Weak reference (`WeakObjectRef`)
    WeakObject = 3,
    /// `ManagedArray<ObjectRef>`
    ArrayObject = 4,
    /// `ManagedArray<S>` whose elements are described by a nested sub-stream
    ArrayStruct = 5,
    /// Inline `[S; N]` described by a nested sub-stream
    FixedArray = 6,
    /// Custom trace callback; the offset field holds the callback id
    Custom = 7,
    /// Terminator
    EndOfStream = 8,
}

impl TokenKind {
    /// Decode a kind from its 5-bit encoding
    #[inline(always)]
    pub fn from_bits(bits: u32) -> Option<Self> {
        Some(match bits {
            1 => TokenKind::Object,
            2 => TokenKind::PersistentObject,
            3 => TokenKind::WeakObject,
            4 => TokenKind::ArrayObject,
            5 => TokenKind::ArrayStruct,
            6 => TokenKind::FixedArray,
            7 => TokenKind::Custom,
            8 => TokenKind::EndOfStream,
            _ => return None,
        })
    }

    /// Bytes the referenced field occupies in the instance
    pub fn field_size(self) -> usize {
        match self {
            TokenKind::Object | TokenKind::PersistentObject | TokenKind::WeakObject => {
                std::mem::size_of::<ObjectRef>()
            }
            TokenKind::ArrayObject | TokenKind::ArrayStruct => {
                std::mem::size_of::<RawArrayHeader>()
            }
            TokenKind::FixedArray | TokenKind::Custom | TokenKind::EndOfStream => 0,
        }
    }

    /// Required alignment of the field a token points at
    pub fn field_align(self) -> usize {
        match self {
            TokenKind::Object | TokenKind::PersistentObject | TokenKind::WeakObject => {
                std::mem::align_of::<ObjectRef>()
            }
            TokenKind::ArrayObject | TokenKind::ArrayStruct => {
                std::mem::align_of::<RawArrayHeader>()
            }
            TokenKind::FixedArray | TokenKind::Custom | TokenKind::EndOfStream => 1,
        }
    }
}

/// Packed reference token
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReferenceInfo(u32);

const OFFSET_BITS: u32 = 19;
const KIND_BITS: u32 = 5;
const KIND_SHIFT: u32 = OFFSET_BITS;
const RETURN_SHIFT: u32 = OFFSET_BITS + KIND_BITS;

impl ReferenceInfo {
    /// Create a token with a zero return count
    pub fn new(kind: TokenKind, offset: u32) -> Self {
        debug_assert!(offset <= MAX_TOKEN_OFFSET);
        Self(((kind as u32) << KIND_SHIFT) | (offset & MAX_TOKEN_OFFSET))
    }

    /// Decode a stream word
    #[inline(always)]
    pub fn from_word(word: u32) -> Self {
        Self(word)
    }

    /// Raw word
    pub fn word(self) -> u32 {
        self.0
    }

    /// Token kind, `None` for a corrupt word
    #[inline(always)]
    pub fn kind(self) -> Option<TokenKind> {
        TokenKind::from_bits((self.0 >> KIND_SHIFT) & ((1 << KIND_BITS) - 1))
    }

    /// Byte offset (or callback id for `Custom`)
    #[inline(always)]
    pub fn offset(self) -> u32 {
        self.0 & MAX_TOKEN_OFFSET
    }

    /// Array contexts to pop after this token
    #[inline(always)]
    pub fn return_count(self) -> u32 {
        self.0 >> RETURN_SHIFT
    }

    fn with_return_count(self, return_count: u32) -> Self {
        Self((self.0 & ((1 << RETURN_SHIFT) - 1)) | (return_count << RETURN_SHIFT))
    }
}

impl fmt::Debug for ReferenceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReferenceInfo")
            .field("kind", &self.kind())
            .field("offset", &self.offset())
            .field("return_count", &self.return_count())
            .finish()
    }
}

/// Packed skip record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkipInfo(u32);

impl SkipInfo {
    fn new(distance: u32, inner_return_count: u32) -> Self {
        Self((distance << 8) | (inner_return_count & 0xFF))
    }

    /// Decode a stream word
    #[inline(always)]
    pub fn from_word(word: u32) -> Self {
        Self(word)
    }

    /// Distance from the skip word to the first token after the array
    #[inline(always)]
    pub fn distance(self) -> u32 {
        self.0 >> 8
    }

    /// Return count of the last element token minus the array's own return
    #[inline(always)]
    pub fn inner_return_count(self) -> u32 {
        self.0 & 0xFF
    }
}

/// Value of an unpatched skip word
pub const SKIP_PLACEHOLDER: u32 = 0xDEAD_BABE;

/// Role of each stream word, kept alongside the words for validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WordRole {
    Info,
    Stride,
    Count,
    Skip,
}

/// Field name attached to a token for diagnostics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenDebugInfo {
    /// Token index
    pub index: u32,
    /// Field path, e.g. `slots[].owner`
    pub name: String,
    /// Byte offset in the enclosing context
    pub offset: u32,
}

/// Per-type reference token stream
#[derive(Clone, Default)]
pub struct ReferenceTokenStream {
    tokens: Vec<u32>,
    roles: Vec<WordRole>,
    callbacks: Vec<CustomTraceFn>,
    debug: Vec<TokenDebugInfo>,
}

impl ReferenceTokenStream {
    /// Create an empty stream
    pub fn new() -> Self {
        Self::default()
    }

    /// Stream words
    #[inline(always)]
    pub fn tokens(&self) -> &[u32] {
        &self.tokens
    }

    /// Number of words
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Check if nothing was emitted yet
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Resolved custom callback by id
    #[inline(always)]
    pub fn callback(&self, id: u32) -> Option<CustomTraceFn> {
        self.callbacks.get(id as usize).copied()
    }

    /// Number of distinct custom callbacks
    pub fn callback_count(&self) -> usize {
        self.callbacks.len()
    }

    /// Append a token, returning its index
    pub fn emit(&mut self, kind: TokenKind, offset: u32) -> u32 {
        self.push(ReferenceInfo::new(kind, offset).word(), WordRole::Info)
    }

    /// Append a token with a field name for diagnostics
    pub fn emit_named(&mut self, kind: TokenKind, offset: u32, name: &str) -> u32 {
        let index = self.emit(kind, offset);
        self.debug.push(TokenDebugInfo {
            index,
            name: name.to_string(),
            offset,
        });
        index
    }

    /// Append an array stride word
    pub fn emit_stride(&mut self, stride: u32) -> u32 {
        self.push(stride, WordRole::Stride)
    }

    /// Append a fixed array count word
    pub fn emit_count(&mut self, count: u32) -> u32 {
        self.push(count, WordRole::Count)
    }

    /// Append a skip placeholder, returning its index for `patch_skip`
    pub fn emit_skip_placeholder(&mut self) -> u32 {
        self.push(SKIP_PLACEHOLDER, WordRole::Skip)
    }

    /// Append a custom callback token
    ///
    /// The callback is resolved to an id now; identical callbacks share one id.
    pub fn emit_custom(&mut self, callback: CustomTraceFn, name: &str) -> u32 {
        let id = match self
            .callbacks
            .iter()
            .position(|&existing| existing as usize == callback as usize)
        {
            Some(id) => id,
            None => {
                self.callbacks.push(callback);
                self.callbacks.len() - 1
            }
        };
        self.emit_named(TokenKind::Custom, id as u32, name)
    }

    /// Close the innermost array context
    ///
    /// Increments the return count of the last token and returns the index
    /// the next token will have, which is the skip target of the array.
    pub fn emit_return(&mut self) -> GcResult<u32> {
        let last = self.tokens.len().checked_sub(1);
        let index = match last {
            Some(index) if self.roles[index] == WordRole::Info => index,
            _ => return Err(self.malformed(self.tokens.len(), "return without a preceding token")),
        };
        let info = ReferenceInfo::from_word(self.tokens[index]);
        if info.return_count() >= MAX_RETURN_COUNT {
            return Err(self.malformed(index, "return count overflow"));
        }
        self.tokens[index] = info.with_return_count(info.return_count() + 1).word();
        Ok(self.tokens.len() as u32)
    }

    /// Patch a skip placeholder to jump to `target`
    ///
    /// `target` must be the value returned by the `emit_return` closing the
    /// array whose placeholder is at `placeholder`.
    pub fn patch_skip(&mut self, placeholder: u32, target: u32) -> GcResult<()> {
        let invalid = |reason| GcError::InvalidSkipPatch {
            placeholder,
            target,
            reason,
        };
        if target == 0 || target as usize > self.tokens.len() {
            return Err(invalid("target outside the stream"));
        }
        if placeholder >= target {
            return Err(invalid("target precedes placeholder"));
        }
        if self.roles.get(placeholder as usize) != Some(&WordRole::Skip)
            || self.tokens[placeholder as usize] != SKIP_PLACEHOLDER
        {
            return Err(invalid("no pending placeholder at index"));
        }
        let last = target as usize - 1;
        if self.roles[last] != WordRole::Info {
            return Err(invalid("target does not follow a token"));
        }
        let return_count = ReferenceInfo::from_word(self.tokens[last]).return_count();
        if return_count < 1 {
            return Err(invalid("array context was not closed"));
        }
        let distance = target - placeholder;
        if distance > MAX_SKIP_DISTANCE {
            return Err(invalid("skip distance overflow"));
        }
        self.tokens[placeholder as usize] = SkipInfo::new(distance, return_count - 1).0;
        Ok(())
    }

    /// Insert `base` in front of this stream
    ///
    /// The base terminator is dropped, callback ids of this stream are
    /// renumbered after the base's callbacks and debug indices are shifted.
    /// Skip records are relative and need no fixup.
    pub fn prepend(&mut self, base: &ReferenceTokenStream) {
        if base.is_empty() {
            return;
        }
        let mut base_len = base.tokens.len();
        if base.roles[base_len - 1] == WordRole::Info
            && ReferenceInfo::from_word(base.tokens[base_len - 1]).kind()
                == Some(TokenKind::EndOfStream)
        {
            base_len -= 1;
        }
        let shift = base.callbacks.len() as u32;

        for (word, role) in self.tokens.iter_mut().zip(&self.roles) {
            let info = ReferenceInfo::from_word(*word);
            if *role == WordRole::Info && info.kind() == Some(TokenKind::Custom) {
                let renumbered = ReferenceInfo::new(TokenKind::Custom, info.offset() + shift)
                    .with_return_count(info.return_count());
                *word = renumbered.word();
            }
        }
        for entry in &mut self.debug {
            entry.index += base_len as u32;
        }

        let mut tokens = base.tokens[..base_len].to_vec();
        tokens.append(&mut self.tokens);
        self.tokens = tokens;

        let mut roles = base.roles[..base_len].to_vec();
        roles.append(&mut self.roles);
        self.roles = roles;

        let mut callbacks = base.callbacks.clone();
        callbacks.append(&mut self.callbacks);
        self.callbacks = callbacks;

        let mut debug: Vec<_> = base
            .debug
            .iter()
            .filter(|entry| (entry.index as usize) < base_len)
            .cloned()
            .collect();
        debug.append(&mut self.debug);
        self.debug = debug;
    }

    /// Append the terminator and release spare capacity
    ///
    /// A stream without references still gets a terminator.
    pub fn finish(&mut self) {
        self.emit(TokenKind::EndOfStream, 0);
        self.shrink();
    }

    /// Release spare capacity
    pub fn shrink(&mut self) {
        self.tokens.shrink_to_fit();
        self.roles.shrink_to_fit();
        self.callbacks.shrink_to_fit();
        self.debug.shrink_to_fit();
    }

    /// Check that a tracer can walk this stream over an instance of
    /// `instance_size` bytes without leaving the instance or the stream
    pub fn validate(&self, type_name: &str, instance_size: usize) -> GcResult<()> {
        let malformed = |index: usize, reason: &str| GcError::MalformedTokenStream {
            type_name: type_name.to_string(),
            index: index as u32,
            reason: reason.to_string(),
        };
        let mut bounds = vec![instance_size];
        let mut index = 0;
        loop {
            if index >= self.tokens.len() {
                return Err(malformed(index, "missing terminator"));
            }
            if self.roles[index] != WordRole::Info {
                return Err(malformed(index, "expected a token"));
            }
            let info = ReferenceInfo::from_word(self.tokens[index]);
            let kind = info
                .kind()
                .ok_or_else(|| malformed(index, "unknown token kind"))?;
            let bound = *bounds.last().unwrap_or(&instance_size);
            let offset = info.offset() as usize;
            let field_end = offset + kind.field_size();
            let mut next = index + 1;

            match kind {
                TokenKind::EndOfStream => {
                    if bounds.len() != 1 {
                        return Err(malformed(index, "terminator inside an array context"));
                    }
                    if next != self.tokens.len() {
                        return Err(malformed(index, "tokens after terminator"));
                    }
                    return Ok(());
                }
                TokenKind::Custom => {
                    if offset >= self.callbacks.len() {
                        return Err(GcError::UnresolvedCallback {
                            type_name: type_name.to_string(),
                            id: info.offset(),
                        });
                    }
                }
                TokenKind::Object
                | TokenKind::PersistentObject
                | TokenKind::WeakObject
                | TokenKind::ArrayObject => {
                    if field_end > bound {
                        return Err(self.out_of_bounds(type_name, index, offset, bound));
                    }
                }
                TokenKind::ArrayStruct => {
                    if field_end > bound {
                        return Err(self.out_of_bounds(type_name, index, offset, bound));
                    }
                    let stride = self.data_word(index + 1, WordRole::Stride).ok_or_else(|| malformed(index, "missing stride"))?;
                    let skip_index = index + 2;
                    let skip = self.data_word(skip_index, WordRole::Skip).ok_or_else(|| malformed(index, "missing skip record"))?;
                    if skip == SKIP_PLACEHOLDER {
                        return Err(malformed(skip_index, "unpatched skip placeholder"));
                    }
                    let target = skip_index + SkipInfo::from_word(skip).distance() as usize;
                    if target > self.tokens.len() || self.roles[target - 1] != WordRole::Info {
                        return Err(malformed(skip_index, "skip target out of range"));
                    }
                    if stride == 0 {
                        return Err(malformed(index, "zero stride"));
                    }
                    bounds.push(stride as usize);
                    next = index + 3;
                }
                TokenKind::FixedArray => {
                    let stride = self.data_word(index + 1, WordRole::Stride).ok_or_else(|| malformed(index, "missing stride"))?;
                    let count = self.data_word(index + 2, WordRole::Count).ok_or_else(|| malformed(index, "missing count"))?;
                    if stride == 0 || count == 0 {
                        return Err(malformed(index, "empty fixed array"));
                    }
                    if offset + stride as usize * count as usize > bound {
                        return Err(self.out_of_bounds(type_name, index, offset, bound));
                    }
                    bounds.push(stride as usize);
                    next = index + 3;
                }
            }

            if bounds.len() > MAX_NESTING_DEPTH + 1 {
                return Err(malformed(index, "array nesting too deep"));
            }
            let returns = info.return_count() as usize;
            if returns >= bounds.len() {
                return Err(malformed(index, "return count pops the instance context"));
            }
            bounds.truncate(bounds.len() - returns);
            index = next;
        }
    }

    /// Check whether any token has the given kind
    pub fn contains_kind(&self, kind: TokenKind) -> bool {
        self.tokens
            .iter()
            .zip(&self.roles)
            .any(|(&word, &role)| role == WordRole::Info && ReferenceInfo::from_word(word).kind() == Some(kind))
    }

    /// Debug info for the token at `index`
    pub fn debug_info(&self, index: u32) -> Option<&TokenDebugInfo> {
        self.debug
            .binary_search_by_key(&index, |entry| entry.index)
            .ok()
            .map(|position| &self.debug[position])
    }

    /// Field path for the token at `index`, or a placeholder
    pub fn field_name(&self, index: u32) -> String {
        match self.debug_info(index) {
            Some(info) => info.name.clone(),
            None => format!("<token {}>", index),
        }
    }

    fn push(&mut self, word: u32, role: WordRole) -> u32 {
        self.tokens.push(word);
        self.roles.push(role);
        (self.tokens.len() - 1) as u32
    }

    fn data_word(&self, index: usize, role: WordRole) -> Option<u32> {
        match self.roles.get(index) {
            Some(&found) if found == role => Some(self.tokens[index]),
            _ => None,
        }
    }

    fn malformed(&self, index: usize, reason: &str) -> GcError {
        GcError::MalformedTokenStream {
            type_name: String::from("<building>"),
            index: index as u32,
            reason: reason.to_string(),
        }
    }

    fn out_of_bounds(&self, type_name: &str, index: usize, offset: usize, size: usize) -> GcError {
        GcError::OffsetOutOfBounds {
            type_name: type_name.to_string(),
            field: self.field_name(index as u32),
            offset,
            size,
        }
    }
}

impl fmt::Debug for ReferenceTokenStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReferenceTokenStream")
            .field("len", &self.tokens.len())
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

impl fmt::Display for ReferenceTokenStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, (&word, role)) in self.tokens.iter().zip(&self.roles).enumerate() {
            match role {
                WordRole::Info => {
                    let info = ReferenceInfo::from_word(word);
                    write!(f, "{:4}: {:?} @{}", index, info.kind(), info.offset())?;
                    if info.return_count() > 0 {
                        write!(f, " ret {}", info.return_count())?;
                    }
                    if let Some(debug) = self.debug_info(index as u32) {
                        write!(f, " ({})", debug.name)?;
                    }
                    writeln!(f)?;
                }
                WordRole::Stride => writeln!(f, "{:4}:   stride {}", index, word)?,
                WordRole::Count => writeln!(f, "{:4}:   count {}", index, word)?,
                WordRole::Skip => {
                    let skip = SkipInfo::from_word(word);
                    writeln!(f, "{:4}:   skip +{} (inner ret {})", index, skip.distance(), skip.inner_return_count())?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::ReferenceVisitor;
    use std::ptr::NonNull;

    unsafe fn noop_callback(_instance: NonNull<u8>, _visitor: &mut ReferenceVisitor<'_>) {}
    unsafe fn other_callback(_instance: NonNull<u8>, _visitor: &mut ReferenceVisitor<'_>) {}

    #[test]
    fn test_reference_info_packing() {
        let info = ReferenceInfo::new(TokenKind::ArrayObject, 1234).with_return_count(3);
        assert_eq!(info.kind(), Some(TokenKind::ArrayObject));
        assert_eq!(info.offset(), 1234);
        assert_eq!(info.return_count(), 3);
    }

    #[test]
    fn test_empty_stream_gets_terminator() {
        let mut stream = ReferenceTokenStream::new();
        stream.finish();
        assert_eq!(stream.len(), 1);
        assert!(stream.validate("Empty", 0).is_ok());
    }

    #[test]
    fn test_emit_returns_indices() {
        let mut stream = ReferenceTokenStream::new();
        assert_eq!(stream.emit(TokenKind::Object, 0), 0);
        assert_eq!(stream.emit(TokenKind::Object, 8), 1);
        assert_eq!(stream.emit_stride(16), 2);
        assert_eq!(stream.emit_skip_placeholder(), 3);
    }

    #[test]
    fn test_struct_array_skip_patch() {
        let mut stream = ReferenceTokenStream::new();
        stream.emit(TokenKind::ArrayStruct, 0);
        stream.emit_stride(16);
        let placeholder = stream.emit_skip_placeholder();
        stream.emit(TokenKind::Object, 0);
        stream.emit(TokenKind::Object, 8);
        let target = stream.emit_return().unwrap();
        stream.patch_skip(placeholder, target).unwrap();
        stream.emit(TokenKind::Object, 24);
        stream.finish();

        let skip = SkipInfo::from_word(stream.tokens()[placeholder as usize]);
        assert_eq!(placeholder + skip.distance(), target);
        assert_eq!(skip.inner_return_count(), 0);
        assert!(stream.validate("Holder", 32).is_ok());
    }

    #[test]
    fn test_patch_skip_rejects_bad_input() {
        let mut stream = ReferenceTokenStream::new();
        stream.emit(TokenKind::ArrayStruct, 0);
        stream.emit_stride(8);
        let placeholder = stream.emit_skip_placeholder();
        stream.emit(TokenKind::Object, 0);

        // Array context not closed yet
        assert!(stream.patch_skip(placeholder, stream.len() as u32).is_err());
        // Target before placeholder
        assert!(stream.patch_skip(placeholder, placeholder).is_err());
        // Not a placeholder
        let target = stream.emit_return().unwrap();
        assert!(stream.patch_skip(0, target).is_err());
        assert!(stream.patch_skip(placeholder, target).is_ok());
        // Already patched
        assert!(stream.patch_skip(placeholder, target).is_err());
    }

    #[test]
    fn test_nested_arrays_share_last_token() {
        let mut stream = ReferenceTokenStream::new();
        stream.emit(TokenKind::ArrayStruct, 0);
        stream.emit_stride(24);
        let outer = stream.emit_skip_placeholder();
        stream.emit(TokenKind::ArrayStruct, 0);
        stream.emit_stride(8);
        let inner = stream.emit_skip_placeholder();
        stream.emit(TokenKind::Object, 0);
        let inner_target = stream.emit_return().unwrap();
        stream.patch_skip(inner, inner_target).unwrap();
        let outer_target = stream.emit_return().unwrap();
        stream.patch_skip(outer, outer_target).unwrap();
        stream.finish();

        assert_eq!(inner_target, outer_target);
        let last = ReferenceInfo::from_word(stream.tokens()[inner_target as usize - 1]);
        assert_eq!(last.return_count(), 2);
        assert_eq!(SkipInfo::from_word(stream.tokens()[inner as usize]).inner_return_count(), 0);
        assert_eq!(SkipInfo::from_word(stream.tokens()[outer as usize]).inner_return_count(), 1);
        assert!(stream.validate("Nested", 24).is_ok());
    }

    #[test]
    fn test_prepend_drops_base_terminator() {
        let mut base = ReferenceTokenStream::new();
        base.emit_named(TokenKind::Object, 0, "owner");
        base.finish();

        let mut derived = ReferenceTokenStream::new();
        derived.emit_named(TokenKind::Object, 8, "target");
        derived.prepend(&base);
        derived.finish();

        assert_eq!(derived.len(), 3);
        assert_eq!(derived.field_name(0), "owner");
        assert_eq!(derived.field_name(1), "target");
        assert!(derived.validate("Derived", 16).is_ok());
    }

    #[test]
    fn test_prepend_renumbers_callbacks() {
        let mut base = ReferenceTokenStream::new();
        base.emit_custom(noop_callback, "base_native");
        base.finish();

        let mut derived = ReferenceTokenStream::new();
        derived.emit_custom(other_callback, "derived_native");
        derived.prepend(&base);
        derived.finish();

        assert_eq!(derived.callback_count(), 2);
        let first = ReferenceInfo::from_word(derived.tokens()[0]);
        let second = ReferenceInfo::from_word(derived.tokens()[1]);
        assert_eq!(first.offset(), 0);
        assert_eq!(second.offset(), 1);
        assert_eq!(derived.callback(1).map(|f| f as usize), Some(other_callback as usize));
        assert!(derived.validate("Derived", 0).is_ok());
    }

    #[test]
    fn test_emit_custom_deduplicates() {
        let mut stream = ReferenceTokenStream::new();
        stream.emit_custom(noop_callback, "a");
        stream.emit_custom(noop_callback, "b");
        assert_eq!(stream.callback_count(), 1);
    }

    #[test]
    fn test_validate_rejects_out_of_bounds() {
        let mut stream = ReferenceTokenStream::new();
        stream.emit_named(TokenKind::Object, 8, "late");
        stream.finish();
        match stream.validate("Small", 8) {
            Err(GcError::OffsetOutOfBounds { field, .. }) => assert_eq!(field, "late"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_unpatched_skip() {
        let mut stream = ReferenceTokenStream::new();
        stream.emit(TokenKind::ArrayStruct, 0);
        stream.emit_stride(8);
        stream.emit_skip_placeholder();
        stream.emit(TokenKind::Object, 0);
        stream.emit_return().unwrap();
        stream.finish();
        assert!(matches!(
            stream.validate("Unpatched", 24),
            Err(GcError::MalformedTokenStream { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_missing_terminator() {
        let mut stream = ReferenceTokenStream::new();
        stream.emit(TokenKind::Object, 0);
        assert!(stream.validate("Open", 8).is_err());
    }

    #[test]
    fn test_display_lists_tokens() {
        let mut stream = ReferenceTokenStream::new();
        stream.emit_named(TokenKind::Object, 0, "owner");
        stream.finish();
        let text = stream.to_string();
        assert!(text.contains("Object"));
        assert!(text.contains("owner"));
        assert!(text.contains("EndOfStream"));
    }
}
