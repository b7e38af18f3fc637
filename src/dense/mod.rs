//! Dense kernels operating on a single frontal matrix.

pub mod ldlt;
pub mod llt;

use crate::mat::MatMut;

/// Block size of the partitioned kernels.
pub(crate) const BLOCK_SIZE: usize = 16;

/// Swaps rows/columns `p` and `q` (`p <= q`) of a front whose fully-summed
/// block is stored in the lower triangle, carrying the rows below the block
/// along.
pub(crate) fn swap_symmetric(mut a: MatMut<'_>, p: usize, q: usize) {
    debug_assert!(p <= q);
    if p == q {
        return;
    }
    let m = a.nrows();
    for i in 0..p {
        let tmp = a.read(p, i);
        a.write(p, i, a.read(q, i));
        a.write(q, i, tmp);
    }
    let tmp = a.read(p, p);
    a.write(p, p, a.read(q, q));
    a.write(q, q, tmp);
    // the (q, p) entry pairs with itself
    for i in p + 1..q {
        let tmp = a.read(i, p);
        a.write(i, p, a.read(q, i));
        a.write(q, i, tmp);
    }
    for i in q + 1..m {
        let tmp = a.read(i, p);
        a.write(i, p, a.read(i, q));
        a.write(i, q, tmp);
    }
}
