//! Forms the Schur-complement contribution block consumed by the parent:
//! `contrib -= L21 * D * L21^T` over the eliminated pivots, lower triangle
//! only (the assembler's fold never reads above the diagonal).

use crate::mat::{MatMut, MatRef};
use crate::mem::{ContribAlloc, ContribBlock};

/// Rank-`nelim` posdef update, `contrib -= L21 * L21^T`.
pub fn calculate_update_posdef(l21: MatRef<'_>, mut contrib: MatMut<'_>) {
    let m = l21.nrows();
    let nelim = l21.ncols();
    for c in 0..m {
        for r in c..m {
            let mut acc = 0.0;
            for k in 0..nelim {
                acc += l21.read(r, k) * l21.read(c, k);
            }
            contrib.write(r, c, contrib.read(r, c) - acc);
        }
    }
}

/// Indefinite update: materializes `LD = L21 * D` from the inverted diagonal
/// storage into a transient block, then `contrib -= L21 * LD^T`.
pub fn calculate_update_indef(
    l21: MatRef<'_>,
    d: &[f64],
    even: bool,
    contrib: &ContribBlock,
    contribs: &mut ContribAlloc,
) {
    let m = l21.nrows();
    let nelim = l21.ncols();

    let scratch = contribs.alloc(even, m * nelim);
    form_ld(
        l21,
        d,
        MatMut::from_column_major_slice_mut(contribs.get_mut(&scratch), m, nelim),
    );
    {
        let (contrib, ld) = contribs.fold_mut(contrib, &scratch);
        gemm_update(
            l21,
            MatRef::from_column_major_slice(ld, m, nelim),
            MatMut::from_column_major_slice_mut(contrib, m, m),
        );
    }
    contribs.release(scratch);
}

/// Builds `LD = L21 * D`, one column per eliminated pivot. A 2x2 pair is
/// recognized by its nonzero subdiagonal slot; an exactly zero inverted 1x1
/// diagonal yields a zero column without any division.
fn form_ld(l21: MatRef<'_>, d: &[f64], mut ld: MatMut<'_>) {
    let m = l21.nrows();
    let nelim = l21.ncols();
    let mut j = 0;
    while j < nelim {
        if d[2 * j + 1] == 0.0 {
            if d[2 * j] == 0.0 {
                for i in 0..m {
                    ld.write(i, j, 0.0);
                }
            } else {
                let d11 = 1.0 / d[2 * j];
                for i in 0..m {
                    ld.write(i, j, d11 * l21.read(i, j));
                }
            }
            j += 1;
        } else {
            let di11 = d[2 * j];
            let di21 = d[2 * j + 1];
            let di22 = d[2 * j + 3];
            let det = di11 * di22 - di21 * di21;
            let d11 = di22 / det;
            let d21 = -di21 / det;
            let d22 = di11 / det;
            for i in 0..m {
                let l1 = l21.read(i, j);
                let l2 = l21.read(i, j + 1);
                ld.write(i, j, d11 * l1 + d21 * l2);
                ld.write(i, j + 1, d21 * l1 + d22 * l2);
            }
            j += 2;
        }
    }
}

/// `contrib -= L21 * LD^T`, lower triangle.
fn gemm_update(l21: MatRef<'_>, ld: MatRef<'_>, mut contrib: MatMut<'_>) {
    let m = l21.nrows();
    let nelim = l21.ncols();
    for c in 0..m {
        for r in c..m {
            let mut acc = 0.0;
            for k in 0..nelim {
                acc += l21.read(r, k) * ld.read(c, k);
            }
            contrib.write(r, c, contrib.read(r, c) - acc);
        }
    }
}
