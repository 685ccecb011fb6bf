//! Shared marshalling helpers for the nnbridge C boundary.
//!
//! This crate holds the pieces of the boundary that know nothing about the
//! inference runtime: C string conversion, borrowed string lists coming in,
//! owned slices and named lists going out, and the panic guard wrapped around
//! every exported function.
//!
//! # Memory Ownership
//!
//! - Functions returning `*mut c_char` or a raw slice transfer ownership to the caller
//! - Every exported collection type has exactly one release path in this crate
//! - Releasing a [`NamedListC`] frees the name copies and the container, never the handles
//! - NULL pointers are handled safely (no-op for release functions)

use std::any::Any;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::slice;

use thiserror::Error;

/// Errors raised while reading caller-owned memory.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MarshalError {
    #[error("null pointer for {0}")]
    NullPointer(&'static str),

    #[error("invalid UTF-8 at index {0}")]
    InvalidUtf8(usize),

    #[error("negative length {0}")]
    NegativeLength(i64),
}

/// Convert a Rust string to a C string pointer, with a fallback on failure.
///
/// If the input contains null bytes, returns the fallback string instead.
/// The returned pointer is owned by the caller and must be freed with
/// [`free_cstring`].
#[inline]
pub fn cstring_new_or_fallback(s: &str, fallback: &'static str) -> *mut c_char {
    CString::new(s)
        .or_else(|_| CString::new(fallback))
        .unwrap_or_default()
        .into_raw()
}

/// Convert a Rust string to a C string pointer, using empty string as fallback.
#[inline]
pub fn cstring_new_or_empty(s: &str) -> *mut c_char {
    CString::new(s).unwrap_or_default().into_raw()
}

/// Safely free a C string pointer.
///
/// # Safety
/// The pointer must have been allocated by `CString::into_raw()` or be null.
#[inline]
pub unsafe fn free_cstring(ptr: *mut c_char) {
    if !ptr.is_null() {
        unsafe {
            let _ = CString::from_raw(ptr);
        }
    }
}

/// Free a boxed slice previously produced by [`vec_into_raw`].
///
/// # Safety
/// The pointer must come from [`vec_into_raw`] with the same `len`.
#[inline]
pub unsafe fn free_boxed_slice<T>(ptr: *mut T, len: usize) {
    if !ptr.is_null() && len > 0 {
        unsafe {
            let _ = Box::from_raw(ptr::slice_from_raw_parts_mut(ptr, len));
        }
    }
}

/// Hand a vector over to the caller as a pointer and length.
///
/// Empty vectors become `(NULL, 0)` so callers never receive a dangling
/// non-null pointer.
#[inline]
pub fn vec_into_raw<T>(vec: Vec<T>) -> (*mut T, usize) {
    let len = vec.len();
    if len == 0 {
        (ptr::null_mut(), 0)
    } else {
        (Box::into_raw(vec.into_boxed_slice()) as *mut T, len)
    }
}

/// View a caller-owned array, treating `(NULL, _)` and `(_, 0)` as empty.
///
/// # Safety
/// If non-null, `ptr` must point to `len` initialised values that stay valid
/// and unmodified for `'a`.
#[inline]
pub unsafe fn slice_or_empty<'a, T>(ptr: *const T, len: usize) -> &'a [T] {
    if ptr.is_null() || len == 0 {
        &[]
    } else {
        unsafe { slice::from_raw_parts(ptr, len) }
    }
}

/// Convert a signed C count into a `usize`.
#[inline]
pub fn count_to_len(count: i32) -> Result<usize, MarshalError> {
    usize::try_from(count).map_err(|_| MarshalError::NegativeLength(count as i64))
}

/// Borrow a C string as `&str`.
///
/// # Safety
/// The pointer must be valid and null-terminated, or null.
pub unsafe fn cstr_to_str<'a>(ptr: *const c_char) -> Result<&'a str, MarshalError> {
    if ptr.is_null() {
        return Err(MarshalError::NullPointer("string"));
    }
    unsafe { CStr::from_ptr(ptr) }
        .to_str()
        .map_err(|_| MarshalError::InvalidUtf8(0))
}

/// Borrow an optional C string: NULL maps to `None`.
///
/// # Safety
/// Same as [`cstr_to_str`].
pub unsafe fn opt_cstr_to_str<'a>(ptr: *const c_char) -> Result<Option<&'a str>, MarshalError> {
    if ptr.is_null() {
        Ok(None)
    } else {
        unsafe { cstr_to_str(ptr) }.map(Some)
    }
}

/// A list of C strings as laid out by the caller: `{data, size}`.
///
/// Incoming lists are borrowed for the duration of one call and copied with
/// [`StringArrayC::to_vec`]. Outgoing lists built with
/// [`StringArrayC::from_strings`] are owned by the caller and released with
/// [`StringArrayC::free_owned`].
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct StringArrayC {
    pub data: *const *const c_char,
    pub size: usize,
}

impl Default for StringArrayC {
    fn default() -> Self {
        Self::empty()
    }
}

impl StringArrayC {
    pub const fn empty() -> Self {
        Self {
            data: ptr::null(),
            size: 0,
        }
    }

    /// A NULL or zero-length list places no constraint on the consumer.
    pub fn is_unconstrained(&self) -> bool {
        self.data.is_null() || self.size == 0
    }

    /// Copy the list into owned strings.
    ///
    /// NULL entries are skipped; the remaining entries keep their relative
    /// order. Entries that are not valid UTF-8 are an error.
    ///
    /// # Safety
    /// `data` must point to `size` pointers, each NULL or a valid C string.
    pub unsafe fn to_vec(&self) -> Result<Vec<String>, MarshalError> {
        let entries = unsafe { slice_or_empty(self.data, self.size) };
        let mut out = Vec::with_capacity(entries.len());
        for (i, &entry) in entries.iter().enumerate() {
            if entry.is_null() {
                tracing::trace!(index = i, "skipping null string list entry");
                continue;
            }
            let s = unsafe { CStr::from_ptr(entry) }
                .to_str()
                .map_err(|_| MarshalError::InvalidUtf8(i))?;
            out.push(s.to_owned());
        }
        Ok(out)
    }

    /// Build a caller-owned list from Rust strings.
    pub fn from_strings(strings: Vec<String>) -> Self {
        let raw: Vec<*const c_char> = strings
            .iter()
            .map(|s| cstring_new_or_empty(s) as *const c_char)
            .collect();
        let (data, size) = vec_into_raw(raw);
        Self {
            data: data as *const *const c_char,
            size,
        }
    }

    /// Release a list built by [`StringArrayC::from_strings`].
    ///
    /// # Safety
    /// Must only be called once, and only on lists produced by `from_strings`.
    pub unsafe fn free_owned(self) {
        if self.data.is_null() || self.size == 0 {
            return;
        }
        let data = self.data as *mut *mut c_char;
        for &s in unsafe { slice::from_raw_parts(data, self.size) } {
            unsafe { free_cstring(s) };
        }
        unsafe { free_boxed_slice(data, self.size) };
    }
}

/// One `(name, handle)` pair of an exported [`NamedListC`].
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct NamedEntryC<H> {
    pub name: *const c_char,
    pub handle: H,
}

/// An exported `{count, entries}` collection of named handles.
///
/// The names are copies owned by the list. The handles keep whatever ownership
/// they had before export; releasing the list does not touch them.
#[repr(C)]
#[derive(Debug)]
pub struct NamedListC<H> {
    pub count: i32,
    pub entries: *mut NamedEntryC<H>,
}

impl<H: Copy> NamedListC<H> {
    pub fn empty() -> Self {
        Self {
            count: 0,
            entries: ptr::null_mut(),
        }
    }

    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (String, H)>,
    {
        let entries: Vec<NamedEntryC<H>> = pairs
            .into_iter()
            .map(|(name, handle)| NamedEntryC {
                name: cstring_new_or_empty(&name),
                handle,
            })
            .collect();
        let (entries, len) = vec_into_raw(entries);
        Self {
            count: len as i32,
            entries,
        }
    }

    /// Borrow the exported entries.
    ///
    /// # Safety
    /// The list must not have been released.
    pub unsafe fn entries(&self) -> &[NamedEntryC<H>] {
        let len = usize::try_from(self.count).unwrap_or(0);
        unsafe { slice_or_empty(self.entries, len) }
    }

    /// Release the name copies and the container.
    ///
    /// # Safety
    /// Must only be called once, on a list produced by `from_pairs`.
    pub unsafe fn release(self) {
        let len = usize::try_from(self.count).unwrap_or(0);
        if self.entries.is_null() || len == 0 {
            return;
        }
        for entry in unsafe { slice::from_raw_parts(self.entries, len) } {
            unsafe { free_cstring(entry.name as *mut c_char) };
        }
        unsafe { free_boxed_slice(self.entries, len) };
    }
}

/// Run an exported function body, converting a panic into `fallback`.
///
/// Nothing unwinds across the C boundary: the panic message is logged with the
/// exported function's name and the caller sees the failure value.
pub fn guard<R>(func: &'static str, fallback: R, body: impl FnOnce() -> R) -> R {
    match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(value) => value,
        Err(payload) => {
            tracing::error!(func, panic = %panic_message(payload.as_ref()), "panic caught at C boundary");
            fallback
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Trait for FFI result types with standardized error handling.
///
/// Types implementing this trait get a consistent `.error()` constructor
/// that converts error messages to C strings with fallback handling.
pub trait FfiResult: Sized {
    /// Fallback message used when the error message contains null bytes.
    const ERROR_FALLBACK: &'static str;

    /// Construct the result struct in its error state around `error_msg`.
    fn error_fields(error_msg: *mut c_char) -> Self;

    #[inline]
    fn error(msg: &str) -> Self {
        Self::error_fields(cstring_new_or_fallback(msg, Self::ERROR_FALLBACK))
    }
}

/// Generate a version function that returns a static C string.
#[macro_export]
macro_rules! define_version_fn {
    ($fn_name:ident) => {
        #[no_mangle]
        pub extern "C" fn $fn_name() -> *const std::os::raw::c_char {
            concat!(env!("CARGO_PKG_VERSION"), "\0").as_ptr() as *const std::os::raw::c_char
        }
    };
}

/// Generate a string free function.
#[macro_export]
macro_rules! define_string_free {
    ($fn_name:ident) => {
        #[no_mangle]
        #[allow(clippy::not_unsafe_ptr_arg_deref)]
        pub extern "C" fn $fn_name(s: *mut std::os::raw::c_char) {
            unsafe { $crate::free_cstring(s) };
        }
    };
}
