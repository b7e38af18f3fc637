//! Minimal column-major matrix views over `f64` slices.
//!
//! Every front is stored column-major with a leading dimension and unit row
//! stride, so the views carry only the column stride.

use core::marker::PhantomData;
use core::ptr::NonNull;
use equator::assert;
use reborrow::{Reborrow, ReborrowMut};

struct MatBase {
    ptr: NonNull<f64>,
    nrows: usize,
    ncols: usize,
    col_stride: usize,
}

impl Copy for MatBase {}
impl Clone for MatBase {
    fn clone(&self) -> Self {
        *self
    }
}

unsafe impl Sync for MatBase {}
unsafe impl Send for MatBase {}

/// Immutable matrix view.
pub struct MatRef<'a> {
    base: MatBase,
    _marker: PhantomData<&'a f64>,
}

/// Mutable matrix view.
pub struct MatMut<'a> {
    base: MatBase,
    _marker: PhantomData<&'a mut f64>,
}

impl Copy for MatRef<'_> {}
impl Clone for MatRef<'_> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'b> Reborrow<'b> for MatRef<'_> {
    type Target = MatRef<'b>;

    #[inline]
    fn rb(&'b self) -> MatRef<'b> {
        *self
    }
}

impl<'b> ReborrowMut<'b> for MatRef<'_> {
    type Target = MatRef<'b>;

    #[inline]
    fn rb_mut(&'b mut self) -> MatRef<'b> {
        *self
    }
}

impl<'b> Reborrow<'b> for MatMut<'_> {
    type Target = MatRef<'b>;

    #[inline]
    fn rb(&'b self) -> MatRef<'b> {
        MatRef {
            base: self.base,
            _marker: PhantomData,
        }
    }
}

impl<'b> ReborrowMut<'b> for MatMut<'_> {
    type Target = MatMut<'b>;

    #[inline]
    fn rb_mut(&'b mut self) -> MatMut<'b> {
        MatMut {
            base: self.base,
            _marker: PhantomData,
        }
    }
}

#[inline]
#[track_caller]
fn check_dims(len: usize, nrows: usize, ncols: usize, col_stride: usize) {
    assert!(all(
        col_stride >= nrows,
        ncols == 0 || nrows == 0 || (ncols - 1) * col_stride + nrows <= len
    ));
}

impl<'a> MatRef<'a> {
    /// View over a contiguous column-major slice, `col_stride == nrows`.
    #[track_caller]
    pub fn from_column_major_slice(slice: &'a [f64], nrows: usize, ncols: usize) -> Self {
        Self::from_column_major_slice_with_stride(slice, nrows, ncols, nrows)
    }

    /// View over a column-major slice with leading dimension `col_stride`.
    #[track_caller]
    pub fn from_column_major_slice_with_stride(
        slice: &'a [f64],
        nrows: usize,
        ncols: usize,
        col_stride: usize,
    ) -> Self {
        check_dims(slice.len(), nrows, ncols, col_stride);
        Self {
            base: MatBase {
                // never null: it comes from a live slice
                ptr: unsafe { NonNull::new_unchecked(slice.as_ptr() as *mut f64) },
                nrows,
                ncols,
                col_stride,
            },
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn nrows(&self) -> usize {
        self.base.nrows
    }

    #[inline]
    pub fn ncols(&self) -> usize {
        self.base.ncols
    }

    #[inline]
    #[track_caller]
    pub fn read(&self, i: usize, j: usize) -> f64 {
        assert!(all(i < self.base.nrows, j < self.base.ncols));
        unsafe { *self.base.ptr.as_ptr().add(j * self.base.col_stride + i) }
    }
}

impl<'a> MatMut<'a> {
    /// Mutable view over a contiguous column-major slice, `col_stride ==
    /// nrows`.
    #[track_caller]
    pub fn from_column_major_slice_mut(slice: &'a mut [f64], nrows: usize, ncols: usize) -> Self {
        check_dims(slice.len(), nrows, ncols, nrows);
        Self {
            base: MatBase {
                // never null: it comes from a live slice
                ptr: unsafe { NonNull::new_unchecked(slice.as_mut_ptr()) },
                nrows,
                ncols,
                col_stride: nrows,
            },
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn nrows(&self) -> usize {
        self.base.nrows
    }

    #[inline]
    pub fn ncols(&self) -> usize {
        self.base.ncols
    }

    #[inline]
    #[track_caller]
    pub fn read(&self, i: usize, j: usize) -> f64 {
        assert!(all(i < self.base.nrows, j < self.base.ncols));
        unsafe { *self.base.ptr.as_ptr().add(j * self.base.col_stride + i) }
    }

    #[inline]
    #[track_caller]
    pub fn write(&mut self, i: usize, j: usize, value: f64) {
        assert!(all(i < self.base.nrows, j < self.base.ncols));
        unsafe { *self.base.ptr.as_ptr().add(j * self.base.col_stride + i) = value }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_views() {
        // 3 x 2 stored in a 4 x 2 buffer
        let mut data = vec![0.0; 8];
        {
            let mut a = MatMut::from_column_major_slice_mut(&mut data[..6], 3, 2);
            for j in 0..2 {
                for i in 0..3 {
                    a.write(i, j, (10 * i + j) as f64);
                }
            }
            assert_eq!(a.read(2, 1), 21.0);
        }
        assert_eq!(data[..6], [0.0, 10.0, 20.0, 1.0, 11.0, 21.0]);

        // same data reinterpreted with a padded leading dimension
        let data = [0.0, 10.0, 20.0, -1.0, 1.0, 11.0, 21.0, -1.0];
        let a = MatRef::from_column_major_slice_with_stride(&data, 3, 2, 4);
        assert_eq!(a.read(0, 0), 0.0);
        assert_eq!(a.read(0, 1), 1.0);
        assert_eq!(a.read(2, 1), 21.0);
    }

    #[test]
    #[should_panic]
    fn test_out_of_bounds() {
        let data = vec![0.0; 6];
        let a = MatRef::from_column_major_slice(&data, 3, 2);
        let _ = a.read(3, 0);
    }
}
