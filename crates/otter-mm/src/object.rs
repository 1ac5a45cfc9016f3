//! Heap object layout
//!
//! Every managed allocation starts with an [`ObjHeader`] followed by the
//! object body. The header carries the type descriptor, the collector-owned
//! object-data slot (mark bits) and the pointer to the optional
//! [`ExtraObjectData`]. The body layout is described by [`TypeInfo`]: a fixed
//! set of fields for objects, or a run of equally sized elements for arrays.
//!
//! ```text
//! ┌──────────────────────────────┐
//! │ ObjHeader (32 bytes)         │  type_info | object_data | extra | count
//! ├──────────────────────────────┤  padded up to the body alignment
//! │ body: fields / elements      │
//! └──────────────────────────────┘
//! ```

use std::alloc::Layout;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use crate::extra::ExtraObjectData;
use crate::gc_state::Epoch;

/// Size of a reference slot in an object body
pub const REF_SIZE: usize = std::mem::size_of::<usize>();

/// Minimum alignment of every allocation
pub const OBJECT_ALIGNMENT: usize = 8;

/// Body layout of a managed type
#[derive(Debug, Clone, Copy)]
pub enum TypeLayout {
    /// Fixed-size object
    Object {
        /// Body size in bytes
        size: usize,
        /// Body alignment
        align: usize,
        /// Body offsets of reference fields
        ref_offsets: &'static [usize],
    },
    /// Variable-length array
    Array {
        /// Size of one element
        element_size: usize,
        /// Element alignment
        align: usize,
        /// Elements are references to other objects
        element_is_ref: bool,
    },
}

/// Type descriptor: everything the allocator and the marker need to know
/// about an object's shape.
#[derive(Debug)]
pub struct TypeInfo {
    name: &'static str,
    layout: TypeLayout,
}

impl TypeInfo {
    /// Describe a fixed-size object type.
    ///
    /// # Panics
    /// Panics (at compile time for `static`s) if the alignment is not a power
    /// of two or a reference offset is misaligned or out of bounds.
    pub const fn object(
        name: &'static str,
        size: usize,
        align: usize,
        ref_offsets: &'static [usize],
    ) -> Self {
        assert!(align.is_power_of_two(), "alignment must be a power of two");
        let mut i = 0;
        while i < ref_offsets.len() {
            let offset = ref_offsets[i];
            assert!(offset % REF_SIZE == 0, "reference field is misaligned");
            assert!(offset + REF_SIZE <= size, "reference field out of bounds");
            i += 1;
        }
        Self {
            name,
            layout: TypeLayout::Object {
                size,
                align,
                ref_offsets,
            },
        }
    }

    /// Describe an array of plain data elements.
    pub const fn array(name: &'static str, element_size: usize, align: usize) -> Self {
        assert!(align.is_power_of_two(), "alignment must be a power of two");
        Self {
            name,
            layout: TypeLayout::Array {
                element_size,
                align,
                element_is_ref: false,
            },
        }
    }

    /// Describe an array of references.
    pub const fn ref_array(name: &'static str) -> Self {
        Self {
            name,
            layout: TypeLayout::Array {
                element_size: REF_SIZE,
                align: REF_SIZE,
                element_is_ref: true,
            },
        }
    }

    /// Type name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Body layout
    pub fn layout(&self) -> &TypeLayout {
        &self.layout
    }

    /// Is this an array type
    pub fn is_array(&self) -> bool {
        matches!(self.layout, TypeLayout::Array { .. })
    }

    fn body_align(&self) -> usize {
        let align = match self.layout {
            TypeLayout::Object { align, .. } | TypeLayout::Array { align, .. } => align,
        };
        align.max(OBJECT_ALIGNMENT)
    }

    /// Offset of the body from the start of the header
    pub fn body_offset(&self) -> usize {
        HEADER_SIZE.next_multiple_of(self.body_align())
    }

    /// Body size for `count` elements (ignored for objects), `None` on overflow
    pub fn body_size(&self, count: usize) -> Option<usize> {
        match self.layout {
            TypeLayout::Object { size, .. } => Some(size),
            TypeLayout::Array { element_size, .. } => element_size.checked_mul(count),
        }
    }

    /// Allocation layout of an instance, `None` if the size overflows
    pub fn instance_layout(&self, count: usize) -> Option<Layout> {
        let total = self.body_offset().checked_add(self.body_size(count)?)?;
        Layout::from_size_align(total, self.body_align()).ok()
    }
}

const HEADER_SIZE: usize = std::mem::size_of::<ObjHeader>();

/// Collector-owned per-object slot.
///
/// Marks are epoch stamps: an object is marked in epoch `e` iff the slot
/// holds `e`. Starting a new epoch therefore "clears" every mark at once.
#[derive(Debug, Default)]
pub struct ObjectData {
    mark_epoch: AtomicU64,
}

impl ObjectData {
    /// Mark for `epoch`. Returns true if the object was not marked yet.
    #[inline]
    pub(crate) fn try_mark(&self, epoch: Epoch) -> bool {
        self.mark_epoch.swap(epoch, Ordering::AcqRel) != epoch
    }

    /// Is the object marked in `epoch`
    #[inline]
    pub fn is_marked(&self, epoch: Epoch) -> bool {
        self.mark_epoch.load(Ordering::Acquire) == epoch
    }

    /// Epoch of the last mark (0 if never marked)
    pub fn mark_epoch(&self) -> Epoch {
        self.mark_epoch.load(Ordering::Acquire)
    }
}

/// Managed object header
#[repr(C)]
pub struct ObjHeader {
    type_info: &'static TypeInfo,
    object_data: ObjectData,
    extra: AtomicPtr<ExtraObjectData>,
    count: u32,
}

/// Reference to a managed object.
///
/// An `ObjRef` is a plain pointer: it stays valid as long as the object is
/// reachable from the root set (or was allocated after the last mark). Using
/// an `ObjRef` to an object that a collection has reclaimed is a bug in the
/// embedder, like a dangling handle.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ObjRef(NonNull<ObjHeader>);

// SAFETY: objects are shared between mutators; all header fields
// the crate mutates concurrently are atomics.
unsafe impl Send for ObjRef {}
unsafe impl Sync for ObjRef {}

impl fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjRef({}@{:p})", self.type_info().name(), self.0)
    }
}

impl ObjRef {
    /// Wrap a raw header pointer
    ///
    /// # Safety
    /// `ptr` must point to a header written by this crate's allocator.
    pub unsafe fn from_raw(ptr: NonNull<ObjHeader>) -> Self {
        Self(ptr)
    }

    /// Raw header pointer
    pub fn as_ptr(self) -> *mut ObjHeader {
        self.0.as_ptr()
    }

    #[inline]
    fn header(&self) -> &ObjHeader {
        // SAFETY: see the type-level invariant
        unsafe { self.0.as_ref() }
    }

    /// Type descriptor
    pub fn type_info(self) -> &'static TypeInfo {
        self.header().type_info
    }

    /// Is this an array
    pub fn is_array(self) -> bool {
        self.type_info().is_array()
    }

    /// Element count (0 for objects)
    pub fn len(self) -> usize {
        self.header().count as usize
    }

    /// True for objects and empty arrays
    pub fn is_empty(self) -> bool {
        self.len() == 0
    }

    /// Collector-owned object data
    pub fn object_data(&self) -> &ObjectData {
        &self.header().object_data
    }

    /// Is this object marked in `epoch`
    pub fn is_marked_in(self, epoch: Epoch) -> bool {
        self.object_data().is_marked(epoch)
    }

    /// Bytes occupied by this object, computed from the type descriptor
    pub fn allocated_size(self) -> usize {
        self.layout().size()
    }

    pub(crate) fn layout(self) -> Layout {
        match self.type_info().instance_layout(self.len()) {
            Some(layout) => layout,
            None => unreachable!("layout was validated at allocation"),
        }
    }

    /// Pointer to the first body byte
    pub fn body_ptr(self) -> *mut u8 {
        // SAFETY: the body follows the header inside the same allocation
        unsafe { (self.as_ptr() as *mut u8).add(self.type_info().body_offset()) }
    }

    fn body_size(self) -> usize {
        self.type_info().body_size(self.len()).unwrap_or(0)
    }

    fn ref_slot(self, offset: usize) -> &'static AtomicPtr<ObjHeader> {
        debug_assert!(offset % REF_SIZE == 0 && offset + REF_SIZE <= self.body_size());
        // SAFETY: offset is an aligned in-bounds reference slot
        unsafe { &*(self.body_ptr().add(offset) as *const AtomicPtr<ObjHeader>) }
    }

    fn field_offset(self, index: usize) -> usize {
        match self.type_info().layout {
            TypeLayout::Object { ref_offsets, .. } => match ref_offsets.get(index) {
                Some(&offset) => offset,
                None => panic!(
                    "{} has no reference field #{index}",
                    self.type_info().name()
                ),
            },
            TypeLayout::Array { .. } => panic!("field access on array {:?}", self),
        }
    }

    fn element_offset(self, index: usize) -> usize {
        match self.type_info().layout {
            TypeLayout::Array {
                element_is_ref: true,
                ..
            } => {
                assert!(
                    index < self.len(),
                    "index {index} out of bounds for {:?}",
                    self
                );
                index * REF_SIZE
            }
            _ => panic!("element access on non-reference array {:?}", self),
        }
    }

    /// Read reference field `index` (index into the type's reference fields)
    pub fn field(self, index: usize) -> Option<ObjRef> {
        let ptr = self.ref_slot(self.field_offset(index)).load(Ordering::Acquire);
        NonNull::new(ptr).map(ObjRef)
    }

    /// Write reference field `index`
    pub fn set_field(self, index: usize, value: Option<ObjRef>) {
        self.ref_slot(self.field_offset(index))
            .store(raw_or_null(value), Ordering::Release);
    }

    /// Read element `index` of a reference array
    pub fn element(self, index: usize) -> Option<ObjRef> {
        let ptr = self
            .ref_slot(self.element_offset(index))
            .load(Ordering::Acquire);
        NonNull::new(ptr).map(ObjRef)
    }

    /// Write element `index` of a reference array
    pub fn set_element(self, index: usize, value: Option<ObjRef>) {
        self.ref_slot(self.element_offset(index))
            .store(raw_or_null(value), Ordering::Release);
    }

    fn word(self, offset: usize) -> &'static AtomicU64 {
        assert!(
            offset % 8 == 0 && offset + 8 <= self.body_size(),
            "word offset {offset} out of bounds for {:?}",
            self
        );
        // SAFETY: checked in-bounds and aligned (body alignment is at least 8)
        unsafe { &*(self.body_ptr().add(offset) as *const AtomicU64) }
    }

    /// Read a 64-bit data word at body `offset`
    pub fn read_u64(self, offset: usize) -> u64 {
        self.word(offset).load(Ordering::Relaxed)
    }

    /// Write a 64-bit data word at body `offset`
    pub fn write_u64(self, offset: usize, value: u64) {
        self.word(offset).store(value, Ordering::Relaxed)
    }

    /// Visit every non-null outgoing reference
    pub fn for_each_ref(self, mut f: impl FnMut(ObjRef)) {
        match self.type_info().layout {
            TypeLayout::Object { ref_offsets, .. } => {
                for &offset in ref_offsets {
                    if let Some(child) = NonNull::new(self.ref_slot(offset).load(Ordering::Acquire))
                    {
                        f(ObjRef(child));
                    }
                }
            }
            TypeLayout::Array {
                element_is_ref: true,
                ..
            } => {
                for index in 0..self.len() {
                    let slot = self.ref_slot(index * REF_SIZE);
                    if let Some(child) = NonNull::new(slot.load(Ordering::Acquire)) {
                        f(ObjRef(child));
                    }
                }
            }
            TypeLayout::Array { .. } => {}
        }
    }

    pub(crate) fn extra_ptr(self) -> *mut ExtraObjectData {
        self.header().extra.load(Ordering::Acquire)
    }

    /// Install `extra` if the object has none. Returns the winner.
    pub(crate) fn install_extra(
        self,
        extra: NonNull<ExtraObjectData>,
    ) -> Result<(), NonNull<ExtraObjectData>> {
        match self.header().extra.compare_exchange(
            std::ptr::null_mut(),
            extra.as_ptr(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(existing) => match NonNull::new(existing) {
                Some(existing) => Err(existing),
                None => unreachable!("compare_exchange failed on null"),
            },
        }
    }

    pub(crate) fn clear_extra(self) {
        self.header()
            .extra
            .store(std::ptr::null_mut(), Ordering::Release);
    }
}

fn raw_or_null(value: Option<ObjRef>) -> *mut ObjHeader {
    value.map_or(std::ptr::null_mut(), ObjRef::as_ptr)
}

/// Allocate and zero an instance of `type_info`.
///
/// Returns `None` if the system allocator fails. Array sizes that do not fit
/// a `Layout` are a fatal error.
pub(crate) fn allocate_instance(type_info: &'static TypeInfo, count: usize) -> Option<ObjRef> {
    let count32 = match u32::try_from(count) {
        Ok(count32) => count32,
        Err(_) => panic!("array of {count} elements is too large"),
    };
    let layout = match type_info.instance_layout(count) {
        Some(layout) => layout,
        None => panic!("{} with {count} elements is too large", type_info.name()),
    };
    // SAFETY: layout has a non-zero size (header is always present)
    let raw = unsafe { std::alloc::alloc_zeroed(layout) } as *mut ObjHeader;
    let ptr = NonNull::new(raw)?;
    // SAFETY: fresh allocation large enough for the header
    unsafe {
        ptr.as_ptr().write(ObjHeader {
            type_info,
            object_data: ObjectData::default(),
            extra: AtomicPtr::new(std::ptr::null_mut()),
            count: count32,
        });
    }
    Some(ObjRef(ptr))
}

/// Release the storage of a dead object.
///
/// # Safety
/// `obj` must be unreachable and owned by the caller (removed from every
/// store), and must not be used afterwards.
pub(crate) unsafe fn deallocate_instance(obj: ObjRef) {
    let layout = obj.layout();
    // SAFETY: allocated by allocate_instance with the same layout
    unsafe { std::alloc::dealloc(obj.as_ptr() as *mut u8, layout) }
}

#[cfg(test)]
mod tests {
    use super::*;

    static PAIR: TypeInfo = TypeInfo::object("Pair", 24, 8, &[0, 8]);
    static WIDE: TypeInfo = TypeInfo::object("Wide", 32, 32, &[]);
    static BYTES: TypeInfo = TypeInfo::array("Bytes", 1, 1);
    static REFS: TypeInfo = TypeInfo::ref_array("Refs");

    fn free(obj: ObjRef) {
        unsafe { deallocate_instance(obj) }
    }

    #[test]
    fn test_header_size() {
        assert_eq!(HEADER_SIZE, 32);
        assert_eq!(PAIR.body_offset(), 32);
        assert_eq!(WIDE.body_offset(), 32);
    }

    #[test]
    fn test_object_is_zeroed_and_aligned() {
        let obj = allocate_instance(&WIDE, 0).unwrap();
        assert_eq!(obj.body_ptr() as usize % 32, 0);
        assert_eq!(obj.read_u64(0), 0);
        assert_eq!(obj.read_u64(24), 0);
        assert_eq!(obj.allocated_size(), 64);
        free(obj);
    }

    #[test]
    fn test_fields() {
        let a = allocate_instance(&PAIR, 0).unwrap();
        let b = allocate_instance(&PAIR, 0).unwrap();
        assert_eq!(a.field(0), None);

        a.set_field(1, Some(b));
        a.write_u64(16, 7);
        assert_eq!(a.field(1), Some(b));
        assert_eq!(a.read_u64(16), 7);

        let mut seen = Vec::new();
        a.for_each_ref(|child| seen.push(child));
        assert_eq!(seen, vec![b]);

        free(a);
        free(b);
    }

    #[test]
    fn test_arrays() {
        let bytes = allocate_instance(&BYTES, 13).unwrap();
        assert!(bytes.is_array());
        assert_eq!(bytes.len(), 13);
        assert_eq!(bytes.allocated_size(), 32 + 13);

        let refs = allocate_instance(&REFS, 3).unwrap();
        refs.set_element(2, Some(bytes));
        let mut seen = Vec::new();
        refs.for_each_ref(|child| seen.push(child));
        assert_eq!(seen, vec![bytes]);

        free(refs);
        free(bytes);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_element_bounds() {
        let refs = allocate_instance(&REFS, 1).unwrap();
        refs.set_element(1, None);
    }

    #[test]
    fn test_epoch_marks() {
        let obj = allocate_instance(&PAIR, 0).unwrap();
        assert!(!obj.is_marked_in(1));
        assert!(obj.object_data().try_mark(1));
        assert!(!obj.object_data().try_mark(1));
        assert!(obj.is_marked_in(1));
        // A new epoch starts with everything unmarked
        assert!(!obj.is_marked_in(2));
        free(obj);
    }
}
