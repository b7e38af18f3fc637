//! Blocked dense LL^T of one front.

use crate::dense::BLOCK_SIZE;
use crate::mat::MatMut;
use crate::NotPosDefError;

/// Factorizes the `n` fully-summed columns of an `m x n` front in place,
/// leaving `L` over the lower triangle and the rows below it.
///
/// Fails on the first non-positive diagonal, reporting its 1-based column;
/// the front contents are unspecified on failure.
pub fn factor(mut a: MatMut<'_>) -> Result<(), NotPosDefError> {
    let m = a.nrows();
    let n = a.ncols();
    debug_assert!(m >= n);

    let mut kb = 0;
    while kb < n {
        let nb = Ord::min(BLOCK_SIZE, n - kb);

        // diagonal block and the panel below it
        for k in kb..kb + nb {
            let akk = a.read(k, k);
            if akk <= 0.0 {
                return Err(NotPosDefError { column: k + 1 });
            }
            let lkk = akk.sqrt();
            a.write(k, k, lkk);
            let linv = 1.0 / lkk;
            for i in k + 1..m {
                a.write(i, k, a.read(i, k) * linv);
            }
            for q in k + 1..kb + nb {
                let lqk = a.read(q, k);
                if lqk != 0.0 {
                    for i in q..m {
                        a.write(i, q, a.read(i, q) - a.read(i, k) * lqk);
                    }
                }
            }
        }

        // trailing update with the factored panel
        for q in kb + nb..n {
            for k in kb..kb + nb {
                let lqk = a.read(q, k);
                if lqk != 0.0 {
                    for i in q..m {
                        a.write(i, q, a.read(i, q) - a.read(i, k) * lqk);
                    }
                }
            }
        }

        kb += nb;
    }
    Ok(())
}
