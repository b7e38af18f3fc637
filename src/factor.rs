//! Post-order sweep over the assembly tree: assemble, factorize, form the
//! update, then finalize the indefinite diagonal layout.

use core::ops::Range;
use dyn_stack::{PodStack, SizeOverflow, StackReq};
use equator::assert;

use crate::assemble::assemble_node;
use crate::dense::{ldlt, llt};
use crate::mat::{MatMut, MatRef};
use crate::mem::{ContribAlloc, ContribBlock, FactorArena};
use crate::tree::AssemblyTree;
use crate::update;
use crate::{FactorOptions, NotPosDefError};

/// Success flag.
pub const SUCCESS: i32 = 0;
/// Flag reported when the matrix is not positive definite.
pub const ERROR_NOT_POS_DEF: i32 = -6;

/// Numeric state of one front.
#[derive(Debug)]
pub struct FrontState {
    /// Rows of the front, delays included.
    pub nrow: usize,
    /// Fully-summed columns, delays included.
    pub ncol: usize,
    pub ndelay_in: usize,
    pub ndelay_out: usize,
    pub nelim: usize,
    pub(crate) lcol: Range<usize>,
    pub(crate) perm: Range<usize>,
    pub(crate) contrib: Option<ContribBlock>,
}

impl FrontState {
    pub(crate) fn empty() -> Self {
        Self {
            nrow: 0,
            ncol: 0,
            ndelay_in: 0,
            ndelay_out: 0,
            nelim: 0,
            lcol: 0..0,
            perm: 0..0,
            contrib: None,
        }
    }
}

/// Statistics of a completed factorization.
#[derive(Copy, Clone, Debug)]
pub struct FactorStats {
    /// [`SUCCESS`], or a negative code.
    pub flag: i32,
    /// Total number of delayed pivots over all fronts.
    pub num_delay: usize,
}

/// Per-front factors produced by the sweep.
#[derive(Debug)]
pub struct Factors {
    posdef: bool,
    arena: FactorArena,
    fronts: Vec<FrontState>,
    stats: FactorStats,
}

impl Factors {
    pub fn stats(&self) -> FactorStats {
        self.stats
    }

    pub fn n_fronts(&self) -> usize {
        self.fronts.len()
    }

    pub fn nrow(&self, ni: usize) -> usize {
        self.fronts[ni].nrow
    }

    pub fn ncol(&self, ni: usize) -> usize {
        self.fronts[ni].ncol
    }

    pub fn nelim(&self, ni: usize) -> usize {
        self.fronts[ni].nelim
    }

    pub fn ndelay_in(&self, ni: usize) -> usize {
        self.fronts[ni].ndelay_in
    }

    pub fn ndelay_out(&self, ni: usize) -> usize {
        self.fronts[ni].ndelay_out
    }

    /// Column-major `nrow x ncol` factor block of front `ni`.
    pub fn lcol(&self, ni: usize) -> &[f64] {
        let f = &self.fronts[ni];
        &self.arena.real[f.lcol.clone()][..f.nrow * f.ncol]
    }

    /// The `2 * ncol` diagonal tail of front `ni`, holding `D^-1` in the
    /// `[d11 d21 d22 *]` layout (indefinite factorizations only).
    #[track_caller]
    pub fn d(&self, ni: usize) -> &[f64] {
        assert!(!self.posdef);
        let f = &self.fronts[ni];
        &self.arena.real[f.lcol.clone()][f.nrow * f.ncol..]
    }

    /// Fully-summed permutation of front `ni`, as global indices.
    pub fn perm(&self, ni: usize) -> &[usize] {
        &self.arena.int[self.fronts[ni].perm.clone()]
    }
}

/// Workspace requirement for [`factorize_posdef`] and [`factorize_indef`].
pub fn factorize_req(tree: &AssemblyTree) -> Result<StackReq, SizeOverflow> {
    StackReq::try_new::<usize>(tree.n())
}

/// Multifrontal LL^T over a positive definite assembly.
///
/// On failure the sweep is cancelled, every live contribution block is
/// released, and the 1-based failing column (within its front) is reported.
pub fn factorize_posdef(
    tree: &AssemblyTree,
    aval: &[f64],
    scaling: Option<&[f64]>,
    options: &FactorOptions,
    contribs: &mut ContribAlloc,
    stack: PodStack<'_>,
) -> Result<Factors, NotPosDefError> {
    factorize(true, tree, aval, scaling, options, contribs, stack)
}

/// Multifrontal threshold-pivoted LDL^T.
///
/// Numerically infallible: unpivotable columns are delayed up the tree, and
/// stay in place unfactored at the roots.
pub fn factorize_indef(
    tree: &AssemblyTree,
    aval: &[f64],
    scaling: Option<&[f64]>,
    options: &FactorOptions,
    contribs: &mut ContribAlloc,
    stack: PodStack<'_>,
) -> Factors {
    match factorize(false, tree, aval, scaling, options, contribs, stack) {
        Ok(factors) => factors,
        Err(_) => unreachable!("the indefinite path has no failure mode"),
    }
}

fn factorize(
    posdef: bool,
    tree: &AssemblyTree,
    aval: &[f64],
    scaling: Option<&[f64]>,
    options: &FactorOptions,
    contribs: &mut ContribAlloc,
    stack: PodStack<'_>,
) -> Result<Factors, NotPosDefError> {
    let n = tree.n();
    let nnodes = tree.n_nodes();
    assert!(all(options.small > 0.0, options.u > 0.0, options.u <= 0.5));
    if let Some(scaling) = scaling {
        assert!(scaling.len() == n);
    }

    let (map, _) = stack.make_raw::<usize>(n);

    if options.print_level > 0 {
        log::debug!(
            target: "frontal",
            "factorize: {nnodes} fronts over dimension {n}, posdef = {posdef}"
        );
    }

    let mut arena = FactorArena::new();
    let mut fronts: Vec<FrontState> = (0..nnodes).map(|_| FrontState::empty()).collect();

    for ni in 0..nnodes {
        assemble_node(
            posdef, tree, ni, &mut fronts, &mut arena, contribs, map, aval, scaling,
        );
        if let Err(err) = factor_front(posdef, &mut fronts[ni], &mut arena, options) {
            drain_contribs(&mut fronts, contribs);
            return Err(err);
        }
        calculate_update(posdef, tree, ni, &mut fronts, &arena, contribs);
        if options.print_level > 1 {
            let f = &fronts[ni];
            log::trace!(
                target: "frontal",
                "front {ni}: nelim = {}, delays in/out = {}/{}",
                f.nelim, f.ndelay_in, f.ndelay_out
            );
        }
    }

    // forest roots may keep a contribution block nobody consumes
    drain_contribs(&mut fronts, contribs);

    if !posdef {
        finalize_diag(&mut fronts, &mut arena);
    }

    let num_delay = fronts.iter().map(|f| f.ndelay_out).sum();
    Ok(Factors {
        posdef,
        arena,
        fronts,
        stats: FactorStats {
            flag: SUCCESS,
            num_delay,
        },
    })
}

fn factor_front(
    posdef: bool,
    front: &mut FrontState,
    arena: &mut FactorArena,
    options: &FactorOptions,
) -> Result<(), NotPosDefError> {
    let m = front.nrow;
    let n = front.ncol;
    if posdef {
        let data = &mut arena.real[front.lcol.clone()];
        match llt::factor(MatMut::from_column_major_slice_mut(data, m, n)) {
            Ok(()) => {
                front.nelim = n;
                front.ndelay_out = 0;
                Ok(())
            }
            Err(err) => {
                front.nelim = err.column - 1;
                Err(err)
            }
        }
    } else {
        let (l, d) = arena.real[front.lcol.clone()].split_at_mut(m * n);
        let perm = &mut arena.int[front.perm.clone()];
        front.nelim = ldlt::factor(
            MatMut::from_column_major_slice_mut(l, m, n),
            d,
            perm,
            options.u,
            options.small,
        );
        front.ndelay_out = n - front.nelim;
        Ok(())
    }
}

fn calculate_update(
    posdef: bool,
    tree: &AssemblyTree,
    ni: usize,
    fronts: &mut [FrontState],
    arena: &FactorArena,
    contribs: &mut ContribAlloc,
) {
    let node = tree.node(ni);
    let m = node.nrow_expected - node.ncol_expected;
    let nelim = fronts[ni].nelim;
    if m == 0 || nelim == 0 {
        return;
    }

    let front = &mut fronts[ni];
    let data = &arena.real[front.lcol.clone()];
    let ldl = front.nrow;
    let ncol = front.ncol;
    let l21 = MatRef::from_column_major_slice_with_stride(&data[ncol..ldl * ncol], m, nelim, ldl);
    let block = match front.contrib.as_ref() {
        Some(block) => block,
        None => return,
    };

    if posdef {
        update::calculate_update_posdef(
            l21,
            MatMut::from_column_major_slice_mut(contribs.get_mut(block), m, m),
        );
    } else {
        let d = &data[ldl * ncol..];
        update::calculate_update_indef(l21, d, tree.is_even(ni), block, contribs);
    }
}

/// Releases every still-live contribution block, newest first (stack blocks
/// must unwind in reverse allocation order).
fn drain_contribs(fronts: &mut [FrontState], contribs: &mut ContribAlloc) {
    for front in fronts.iter_mut().rev() {
        if let Some(block) = front.contrib.take() {
            contribs.release(block);
        }
    }
}

/// Rewrites the 2x2 sentinels to the clean `[d11 d21 d22 *]` layout.
fn finalize_diag(fronts: &mut [FrontState], arena: &mut FactorArena) {
    for front in fronts {
        let offset = front.nrow * front.ncol;
        let d = &mut arena.real[front.lcol.clone()][offset..];
        for i in 0..2 * front.nelim {
            if d[i] == f64::INFINITY {
                d[i] = d[i + 1];
            }
        }
    }
}
