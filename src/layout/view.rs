//! Typed views over blocks in a materialized region
//!
//! The shared region is one contiguous byte range; these helpers
//! reinterpret a named block as a typed slice after validating that the
//! block exists and that its element size matches the requested type.
//! Writes through a view mutate the shared region directly.

use std::mem::{align_of, size_of};

use crate::error::{Result, StoreError};

use super::DataLayout;

/// Reinterpret a block as a mutable typed slice.
///
/// # Safety
///
/// `data_ptr` must point at the start of a data section materialized from
/// `layout`, valid for the layout's full data size, and the caller must
/// guarantee exclusive access for the lifetime of the slice.
pub unsafe fn view_slice_mut<'a, T>(
    layout: &DataLayout,
    data_ptr: *mut u8,
    name: &str,
) -> Result<&'a mut [T]> {
    let block = layout.block(name)?;

    if block.element_size as usize != size_of::<T>() {
        return Err(StoreError::serialization(format!(
            "block {} has element size {}, expected {}",
            name,
            block.element_size,
            size_of::<T>()
        )));
    }

    let ptr = layout.block_ptr(data_ptr, name)?;
    if ptr as usize % align_of::<T>() != 0 {
        return Err(StoreError::serialization(format!(
            "block {} is not aligned for its element type",
            name
        )));
    }

    Ok(std::slice::from_raw_parts_mut(
        ptr as *mut T,
        block.element_count as usize,
    ))
}

/// Reinterpret a block as an immutable typed slice.
///
/// # Safety
///
/// Same as [`view_slice_mut`], except shared access suffices.
pub unsafe fn view_slice<'a, T>(
    layout: &DataLayout,
    data_ptr: *mut u8,
    name: &str,
) -> Result<&'a [T]> {
    view_slice_mut::<T>(layout, data_ptr, name).map(|s| &*s)
}

/// Mutable view over a block's raw bytes, unpadded.
///
/// # Safety
///
/// Same contract as [`view_slice_mut`].
pub unsafe fn view_bytes_mut<'a>(
    layout: &DataLayout,
    data_ptr: *mut u8,
    name: &str,
) -> Result<&'a mut [u8]> {
    let block = layout.block(name)?;
    let ptr = layout.block_ptr(data_ptr, name)?;
    Ok(std::slice::from_raw_parts_mut(
        ptr,
        block.payload_size() as usize,
    ))
}

/// View a single-element block as a value reference.
///
/// # Safety
///
/// Same contract as [`view_slice_mut`]; the block must hold exactly one
/// element of `T`.
pub unsafe fn view_value_mut<'a, T>(
    layout: &DataLayout,
    data_ptr: *mut u8,
    name: &str,
) -> Result<&'a mut T> {
    let slice = view_slice_mut::<T>(layout, data_ptr, name)?;
    slice
        .first_mut()
        .map(|v| &mut *(v as *mut T))
        .ok_or_else(|| StoreError::serialization(format!("block {} is empty", name)))
}
