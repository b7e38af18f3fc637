//! Threshold-pivoted dense LDL^T of one front, delaying unpivotable columns.
//!
//! Candidates are swept left to right over the fully-summed columns, trying a
//! 1x1 pivot first and a 2x2 pivot with the next column second; sweeps repeat
//! until a full pass makes no progress. Accepted pivots are symmetrically
//! swapped to the front of the block (rows, columns and `perm`); whatever
//! remains becomes the delayed columns, left holding their updated values.
//!
//! The diagonal is stored *inverted* in the two-slot-per-column tail:
//! `(1/d11, 0)` for a 1x1 pivot, and `(di11, di21, +inf, di22)` for a 2x2
//! pair, the infinity marking the pairing until the driver's final rewrite.
//! `L` keeps an explicit unit diagonal.

use crate::dense::swap_symmetric;
use crate::mat::{MatMut, MatRef};
use reborrow::*;

enum Pivot {
    Single,
    Pair,
    Fail,
}

/// Factorizes the `n` fully-summed columns of an `m x n` front in place.
///
/// `d` is the `2 * n` diagonal tail and `perm` the fully-summed permutation
/// carried along with the column interchanges. Returns the number of
/// eliminated pivots; the trailing `n - nelim` columns are the delays.
pub fn factor(mut a: MatMut<'_>, d: &mut [f64], perm: &mut [usize], u: f64, small: f64) -> usize {
    let m = a.nrows();
    let n = a.ncols();
    debug_assert!(m >= n);
    debug_assert!(d.len() == 2 * n);
    debug_assert!(perm.len() == n);

    let mut nelim = 0;
    loop {
        let mut progress = false;
        let mut j = nelim;
        while j < n {
            match try_pivot(a.rb(), nelim, j, u, small) {
                Pivot::Single => {
                    eliminate_1x1(a.rb_mut(), d, perm, nelim, j);
                    nelim += 1;
                    progress = true;
                    // the column swapped out to position j is retried on the
                    // next pass
                    j += 1;
                }
                Pivot::Pair => {
                    eliminate_2x2(a.rb_mut(), d, perm, nelim, j);
                    nelim += 2;
                    progress = true;
                    j += 2;
                }
                Pivot::Fail => j += 1,
            }
        }
        if !progress {
            break;
        }
    }
    nelim
}

/// Entry `(i, j)` of the active block, reading through the lower-triangle
/// storage when `i` is above the diagonal.
#[inline]
fn entry(a: MatRef<'_>, i: usize, j: usize) -> f64 {
    if i >= j {
        a.read(i, j)
    } else {
        a.read(j, i)
    }
}

fn try_pivot(a: MatRef<'_>, nelim: usize, j: usize, u: f64, small: f64) -> Pivot {
    let m = a.nrows();
    let n = a.ncols();

    let ajj = a.read(j, j);
    let mut amax = 0.0;
    for i in nelim..m {
        if i != j {
            let v = entry(a, i, j).abs();
            if v > amax {
                amax = v;
            }
        }
    }
    if ajj.abs() >= small && u * amax <= ajj.abs() {
        return Pivot::Single;
    }

    if j + 1 < n {
        let a11 = ajj;
        let a21 = a.read(j + 1, j);
        let a22 = a.read(j + 1, j + 1);
        // a diagonal that is nonzero yet below the zero threshold poisons the
        // pair; an exact structural zero does not. a pair with no coupling is
        // just two failed 1x1 candidates.
        let dirty = |x: f64| x != 0.0 && x.abs() < small;
        if dirty(a11) || dirty(a22) || a21 == 0.0 {
            return Pivot::Fail;
        }
        let det = a11 * a22 - a21 * a21;
        if det.abs() < small {
            return Pivot::Fail;
        }
        let di11 = a22 / det;
        let di21 = -a21 / det;
        let di22 = a11 / det;

        let mut amax1 = 0.0;
        let mut amax2 = 0.0;
        for i in nelim..m {
            if i != j && i != j + 1 {
                let v1 = entry(a, i, j).abs();
                let v2 = entry(a, i, j + 1).abs();
                if v1 > amax1 {
                    amax1 = v1;
                }
                if v2 > amax2 {
                    amax2 = v2;
                }
            }
        }
        // bounded growth of the trailing subcolumns through the inverse
        let growth1 = di11.abs() * amax1 + di21.abs() * amax2;
        let growth2 = di21.abs() * amax1 + di22.abs() * amax2;
        if u * growth1 <= 1.0 && u * growth2 <= 1.0 {
            return Pivot::Pair;
        }
    }

    Pivot::Fail
}

/// Eliminates the column at `j` as a 1x1 pivot at position `p`.
fn eliminate_1x1(mut a: MatMut<'_>, d: &mut [f64], perm: &mut [usize], p: usize, j: usize) {
    let m = a.nrows();
    let n = a.ncols();

    swap_symmetric(a.rb_mut(), p, j);
    perm.swap(p, j);

    let app = a.read(p, p);
    let dinv = 1.0 / app;
    d[2 * p] = dinv;
    d[2 * p + 1] = 0.0;

    for q in p + 1..n {
        let wq = a.read(q, p);
        if wq != 0.0 {
            let scale = wq * dinv;
            for i in q..m {
                a.write(i, q, a.read(i, q) - a.read(i, p) * scale);
            }
        }
    }
    for i in p + 1..m {
        a.write(i, p, a.read(i, p) * dinv);
    }
    a.write(p, p, 1.0);
}

/// Eliminates the columns at `(j, j + 1)` as a 2x2 pivot at `(p, p + 1)`.
fn eliminate_2x2(mut a: MatMut<'_>, d: &mut [f64], perm: &mut [usize], p: usize, j: usize) {
    let m = a.nrows();
    let n = a.ncols();

    swap_symmetric(a.rb_mut(), p, j);
    perm.swap(p, j);
    swap_symmetric(a.rb_mut(), p + 1, j + 1);
    perm.swap(p + 1, j + 1);

    let a11 = a.read(p, p);
    let a21 = a.read(p + 1, p);
    let a22 = a.read(p + 1, p + 1);
    let det = a11 * a22 - a21 * a21;
    let di11 = a22 / det;
    let di21 = -a21 / det;
    let di22 = a11 / det;
    d[2 * p] = di11;
    d[2 * p + 1] = di21;
    d[2 * p + 2] = f64::INFINITY;
    d[2 * p + 3] = di22;

    for q in p + 2..n {
        let w1 = a.read(q, p);
        let w2 = a.read(q, p + 1);
        if w1 != 0.0 || w2 != 0.0 {
            let t1 = di11 * w1 + di21 * w2;
            let t2 = di21 * w1 + di22 * w2;
            for i in q..m {
                a.write(i, q, a.read(i, q) - a.read(i, p) * t1 - a.read(i, p + 1) * t2);
            }
        }
    }
    for i in p + 2..m {
        let l1 = a.read(i, p) * di11 + a.read(i, p + 1) * di21;
        let l2 = a.read(i, p) * di21 + a.read(i, p + 1) * di22;
        a.write(i, p, l1);
        a.write(i, p + 1, l2);
    }
    a.write(p, p, 1.0);
    a.write(p + 1, p, 0.0);
    a.write(p + 1, p + 1, 1.0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use rand::prelude::*;

    fn factor_dense(a: &mut [f64], m: usize, n: usize, u: f64, small: f64) -> (usize, Vec<f64>, Vec<usize>) {
        let mut d = vec![0.0; 2 * n];
        let mut perm: Vec<usize> = (0..n).collect();
        let nelim = factor(
            MatMut::from_column_major_slice_mut(a, m, n),
            &mut d,
            &mut perm,
            u,
            small,
        );
        (nelim, d, perm)
    }

    /// Checks the factorization identity against the original matrix `b`
    /// (full storage): with `bp = P b P^T` per `perm`,
    /// `bp(i, j) == (L D L^T)(i, j)` for eliminated columns, and the delayed
    /// block must hold the partially updated Schur values.
    fn check(b: &[f64], m: usize, n: usize, a: &[f64], d: &[f64], perm: &[usize], nelim: usize) {
        // inverted D back to D, raw sentinel layout
        let mut dmat = vec![0.0; nelim * nelim];
        let mut k = 0;
        while k < nelim {
            if d[2 * k + 1] == 0.0 {
                dmat[k * nelim + k] = 1.0 / d[2 * k];
                k += 1;
            } else {
                let (di11, di21, di22) = (d[2 * k], d[2 * k + 1], d[2 * k + 3]);
                let det = di11 * di22 - di21 * di21;
                dmat[k * nelim + k] = di22 / det;
                dmat[(k + 1) * nelim + k] = -di21 / det;
                dmat[k * nelim + k + 1] = -di21 / det;
                dmat[(k + 1) * nelim + k + 1] = di11 / det;
                k += 2;
            }
        }

        // row i of the permuted original: rows >= n are not permuted
        let orig = |i: usize, j: usize| {
            let gi = if i < n { perm[i] } else { i };
            let gj = if j < n { perm[j] } else { j };
            b[gj * m + gi]
        };
        let l = |i: usize, j: usize| {
            if i == j {
                1.0
            } else if i > j {
                a[j * m + i]
            } else {
                0.0
            }
        };

        for j in 0..n {
            for i in j..m {
                let mut acc = 0.0;
                for k in 0..nelim {
                    for q in 0..nelim {
                        acc += l(i, k) * dmat[q * nelim + k] * l(j, q);
                    }
                }
                if j < nelim {
                    assert_approx_eq!(orig(i, j), acc, 1e-10);
                } else if i >= nelim {
                    // delayed block: updated Schur values
                    assert_approx_eq!(a[j * m + i], orig(i, j) - acc, 1e-10);
                }
            }
        }
    }

    #[test]
    fn test_oxo_pivot() {
        // [[0, 1], [1, 0]] with u = 0.5: one 2x2 pivot
        let mut a = vec![0.0, 1.0, 0.0, 0.0];
        let (nelim, d, perm) = factor_dense(&mut a, 2, 2, 0.5, 1e-20);
        assert_eq!(nelim, 2);
        assert_eq!(perm, vec![0, 1]);
        // E^-1 = [[0, 1], [1, 0]] with the pair sentinel
        assert_eq!(d, vec![0.0, 1.0, f64::INFINITY, 0.0]);
    }

    #[test]
    fn test_tiny_diagonals_delay() {
        // nonzero diagonals below `small` poison both 1x1 and 2x2 candidates
        let mut a = vec![1e-30, 1.0, 0.0, 1e-30];
        let (nelim, _, _) = factor_dense(&mut a, 2, 2, 0.5, 1e-20);
        assert_eq!(nelim, 0);
    }

    #[test]
    fn test_threshold() {
        // [[eps, 1], [1, eps]]: the 1x1 pivot on eps fails the threshold
        // test, the 2x2 pivot is accepted
        let eps = 1e-3;
        let mut a = vec![eps, 1.0, 0.0, eps];
        let (nelim, d, _) = factor_dense(&mut a, 2, 2, 0.5, 1e-20);
        assert_eq!(nelim, 2);
        assert!(d[2] == f64::INFINITY);
    }

    #[test]
    fn test_diagonally_dominant() {
        let b = vec![4.0, 1.0, 1.0, -5.0];
        let mut a = vec![4.0, 1.0, 0.0, -5.0];
        let (nelim, d, perm) = factor_dense(&mut a, 2, 2, 0.01, 1e-20);
        assert_eq!(nelim, 2);
        check(&b, 2, 2, &a, &d, &perm, nelim);
    }

    #[test]
    fn test_zero_column_delays() {
        // a structurally empty fully-summed column cannot be eliminated
        let m = 3;
        let b = vec![0.0, 0.0, 0.0, 0.0, 2.0, 1.0, 0.0, 1.0, 2.0];
        let mut a = vec![0.0; 9];
        for j in 0..3 {
            for i in j..3 {
                a[j * m + i] = b[j * m + i];
            }
        }
        let (nelim, d, perm) = factor_dense(&mut a, 3, 3, 0.01, 1e-20);
        assert_eq!(nelim, 2);
        check(&b, 3, 3, &a, &d, &perm, nelim);
    }

    #[test]
    fn test_random_roundtrip() {
        let mut rng = StdRng::seed_from_u64(1);
        for &(m, n) in &[(6usize, 6usize), (9, 9), (12, 7)] {
            // random symmetric, mildly indefinite
            let mut b = vec![0.0; m * m];
            for j in 0..m {
                for i in j..m {
                    let v = rng.gen::<f64>() - 0.5;
                    b[j * m + i] = v;
                    b[i * m + j] = v;
                }
                b[j * m + j] += if j % 3 == 0 { -2.0 } else { 2.0 };
            }
            let mut a = vec![0.0; m * n];
            for j in 0..n {
                for i in j..m {
                    a[j * m + i] = b[j * m + i];
                }
            }
            let (nelim, d, perm) = factor_dense(&mut a, m, n, 0.01, 1e-20);
            check(&b, m, n, &a, &d, &perm, nelim);
        }
    }
}
