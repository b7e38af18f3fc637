//! Frontal assembly: builds a parent front from the original-matrix entries
//! and its children's contribution blocks, folding in delayed columns.

use equator::assert;

use crate::factor::FrontState;
use crate::mem::{ContribAlloc, FactorArena};
use crate::tree::{AssemblyTree, NONE};

/// Assembles front `ni`, allocating its factor storage and contribution
/// block, scattering the original entries, rewiring the children's delayed
/// columns and folding their contribution blocks (which are released as soon
/// as they have been consumed).
///
/// `map` is scratch of length `tree.n()`; its contents are live only within
/// one assembly and it need not be cleared between nodes.
#[allow(clippy::too_many_arguments)]
pub fn assemble_node(
    posdef: bool,
    tree: &AssemblyTree,
    ni: usize,
    fronts: &mut [FrontState],
    arena: &mut FactorArena,
    contribs: &mut ContribAlloc,
    map: &mut [usize],
    aval: &[f64],
    scaling: Option<&[f64]>,
) {
    assert!(all(ni < fronts.len(), map.len() == tree.n()));
    let node = tree.node(ni);

    // incoming delays determine the true front size
    let mut ndelay_in = 0;
    for child in tree.children(ni) {
        ndelay_in += fronts[child].ndelay_out;
    }
    debug_assert!(!posdef || ndelay_in == 0);
    let nrow = node.nrow_expected + ndelay_in;
    let ncol = node.ncol_expected + ndelay_in;

    // factor storage (the indef layout appends two rows of D) and the
    // fully-summed permutation
    let len = if posdef {
        nrow * ncol
    } else {
        (nrow + 2) * ncol
    };
    let lcol_range = arena.alloc_real(len);
    let perm_range = arena.alloc_int(ncol);

    // contribution block, on the side selected by this node's parity
    let contrib_dim = node.nrow_expected - node.ncol_expected;
    let contrib =
        (contrib_dim > 0).then(|| contribs.alloc(tree.is_even(ni), contrib_dim * contrib_dim));

    {
        let (head_real, tail_real) = arena.real.split_at_mut(lcol_range.start);
        let (head_int, tail_int) = arena.int.split_at_mut(perm_range.start);
        let lcol = &mut tail_real[..len];
        let perm = &mut tail_int[..ncol];

        // expected eliminations; delays are appended as they are imported
        perm[..node.ncol_expected].copy_from_slice(&node.rlist[..node.ncol_expected]);

        // scatter A
        if let Some(scaling) = scaling {
            for &(src, dest) in &node.amap {
                let c = dest / node.nrow_expected;
                let r = dest % node.nrow_expected;
                let mut k = c * nrow + r;
                if r >= node.ncol_expected {
                    k += ndelay_in;
                }
                let rscale = scaling[node.rlist[r]];
                let cscale = scaling[node.rlist[c]];
                lcol[k] = rscale * aval[src] * cscale;
            }
        } else {
            for &(src, dest) in &node.amap {
                let c = dest / node.nrow_expected;
                let r = dest % node.nrow_expected;
                let mut k = c * nrow + r;
                if r >= node.ncol_expected {
                    k += ndelay_in;
                }
                lcol[k] = aval[src];
            }
        }

        if node.first_child != NONE {
            // lookup from global index to front row, leaving room for the
            // delayed columns
            for i in 0..node.ncol_expected {
                map[node.rlist[i]] = i;
            }
            for i in node.ncol_expected..node.nrow_expected {
                map[node.rlist[i]] = i + ndelay_in;
            }

            let mut delay_col = node.ncol_expected;
            for ci in tree.children(ni) {
                let child = tree.node(ci);
                let child_ndelay_in = fronts[ci].ndelay_in;
                let child_ndelay_out = fronts[ci].ndelay_out;
                let child_nelim = fronts[ci].nelim;
                let child_lcol = &head_real[fronts[ci].lcol.clone()];
                let child_perm = &head_int[fronts[ci].perm.clone()];
                let lds = child.nrow_expected + child_ndelay_in;

                // delays go to the back of the fully-summed block
                for i in 0..child_ndelay_out {
                    perm[delay_col] = child_perm[child_nelim + i];

                    // triangular tail of the unfinished column
                    let dst = delay_col * (nrow + 1);
                    let src = (child_nelim + i) * (lds + 1);
                    for j in 0..child_ndelay_out - i {
                        lcol[dst + j] = child_lcol[src + j];
                    }

                    // the child's non-fully-summed rows of that column
                    let src_col = (child_nelim + i) * lds + child_ndelay_in;
                    for j in child.ncol_expected..child.nrow_expected {
                        let r = map[child.rlist[j]];
                        let v = child_lcol[src_col + j];
                        if r < ncol {
                            lcol[r * nrow + delay_col] = v;
                        } else {
                            lcol[delay_col * nrow + r] = v;
                        }
                    }
                    delay_col += 1;
                }

                // expected contributions
                if let Some(cblock) = fronts[ci].contrib.take() {
                    let cm = child.nrow_expected - child.ncol_expected;
                    {
                        let (own, src) = match contrib.as_ref() {
                            Some(own) => contribs.fold_mut(own, &cblock),
                            None => (<&mut [f64]>::default(), contribs.get(&cblock)),
                        };
                        for i in 0..cm {
                            let c = map[child.rlist[child.ncol_expected + i]];
                            let src_off = i * cm;
                            if c < ncol {
                                let dst_off = c * nrow;
                                for j in i..cm {
                                    let r = map[child.rlist[child.ncol_expected + j]];
                                    lcol[dst_off + r] += src[src_off + j];
                                }
                            } else {
                                let dst_off = (c - ncol) * contrib_dim;
                                for j in i..cm {
                                    let r = map[child.rlist[child.ncol_expected + j]] - ncol;
                                    own[dst_off + r] += src[src_off + j];
                                }
                            }
                        }
                    }
                    // dead as soon as it has been folded in
                    contribs.release(cblock);
                }
            }
            debug_assert!(delay_col == ncol);
        }
    }

    fronts[ni] = FrontState {
        nrow,
        ncol,
        ndelay_in,
        ndelay_out: 0,
        nelim: 0,
        lcol: lcol_range,
        perm: perm_range,
        contrib,
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use equator::assert;
    use crate::dense::{ldlt, llt};
    use crate::mat::{MatMut, MatRef};
    use crate::update;
    use assert_approx_eq::assert_approx_eq;

    fn empty_fronts(count: usize) -> Vec<FrontState> {
        (0..count).map(|_| FrontState::empty()).collect()
    }

    /// `amap`/`aval` covering every lower-triangle pair of the node's frame,
    /// pulling values from a dense column-major `a` of dimension `n`.
    fn dense_amap(a: &[f64], n: usize, node: &mut crate::tree::NodeDesc, aval: &mut Vec<f64>) {
        for cl in 0..node.ncol_expected {
            for rl in cl..node.nrow_expected {
                let (gr, gc) = (node.rlist[rl], node.rlist[cl]);
                aval.push(a[gc * n + gr]);
                node.amap.push((aval.len() - 1, cl * node.nrow_expected + rl));
            }
        }
    }

    fn node(nrow: usize, ncol: usize, rlist: Vec<usize>) -> crate::tree::NodeDesc {
        crate::tree::NodeDesc {
            nrow_expected: nrow,
            ncol_expected: ncol,
            rlist,
            amap: Vec::new(),
            first_child: NONE,
            next_sibling: NONE,
        }
    }

    #[test]
    fn test_single_node_scatter() {
        // the assembled front is the dense lower triangle of A
        let n = 3;
        #[rustfmt::skip]
        let a = vec![
            4.0, 1.0, 2.0,
            1.0, 5.0, 3.0,
            2.0, 3.0, 6.0,
        ];
        let mut nd = node(3, 3, vec![0, 1, 2]);
        let mut aval = Vec::new();
        dense_amap(&a, n, &mut nd, &mut aval);
        let tree = AssemblyTree::new(n, vec![nd]);

        let mut arena = FactorArena::new();
        let mut contribs = ContribAlloc::paired_stacks();
        let mut fronts = empty_fronts(1);
        let mut map = vec![0usize; n];

        assemble_node(
            true, &tree, 0, &mut fronts, &mut arena, &mut contribs, &mut map, &aval, None,
        );

        let lcol = &arena.real[fronts[0].lcol.clone()];
        for j in 0..n {
            for i in j..n {
                assert_eq!(lcol[j * 3 + i], a[j * 3 + i]);
            }
            for i in 0..j {
                assert_eq!(lcol[j * 3 + i], 0.0);
            }
        }
        assert_eq!(&arena.int[fronts[0].perm.clone()], &[0, 1, 2]);
    }

    #[test]
    fn test_single_node_scaled() {
        let n = 2;
        let a = vec![4.0, 2.0, 2.0, 9.0];
        let scaling = vec![0.5, 1.0 / 3.0];
        let mut nd = node(2, 2, vec![0, 1]);
        let mut aval = Vec::new();
        dense_amap(&a, n, &mut nd, &mut aval);
        let tree = AssemblyTree::new(n, vec![nd]);

        let mut arena = FactorArena::new();
        let mut contribs = ContribAlloc::paired_stacks();
        let mut fronts = empty_fronts(1);
        let mut map = vec![0usize; n];

        assemble_node(
            true,
            &tree,
            0,
            &mut fronts,
            &mut arena,
            &mut contribs,
            &mut map,
            &aval,
            Some(&scaling),
        );

        let lcol = &arena.real[fronts[0].lcol.clone()];
        assert_approx_eq!(lcol[0], 1.0, 1e-15);
        assert_approx_eq!(lcol[1], 2.0 * 0.5 / 3.0, 1e-15);
        assert_approx_eq!(lcol[3], 1.0, 1e-15);
    }

    #[test]
    fn test_two_node_contribution_sum() {
        // child {0} with rows {0, 1, 2}, parent {1, 2}: the parent's
        // fully-summed block must equal A + the child's Schur contribution
        let n = 3;
        #[rustfmt::skip]
        let a = vec![
            4.0, 1.0, 2.0,
            1.0, 5.0, 3.0,
            2.0, 3.0, 6.0,
        ];
        let mut child = node(3, 1, vec![0, 1, 2]);
        let mut parent = node(2, 2, vec![1, 2]);
        parent.first_child = 0;
        let mut aval = Vec::new();
        dense_amap(&a, n, &mut child, &mut aval);
        dense_amap(&a, n, &mut parent, &mut aval);
        let tree = AssemblyTree::new(n, vec![child, parent]);

        let mut arena = FactorArena::new();
        let mut contribs = ContribAlloc::paired_stacks();
        let mut fronts = empty_fronts(2);
        let mut map = vec![0usize; n];

        // process the child fully
        assemble_node(
            true, &tree, 0, &mut fronts, &mut arena, &mut contribs, &mut map, &aval, None,
        );
        {
            let data = &mut arena.real[fronts[0].lcol.clone()];
            llt::factor(MatMut::from_column_major_slice_mut(data, 3, 1)).unwrap();
            fronts[0].nelim = 1;
        }
        {
            let data = &arena.real[fronts[0].lcol.clone()];
            let l21 = MatRef::from_column_major_slice_with_stride(&data[1..], 2, 1, 3);
            let block = fronts[0].contrib.as_ref().unwrap();
            let contrib = contribs.get_mut(block);
            update::calculate_update_posdef(l21, MatMut::from_column_major_slice_mut(contrib, 2, 2));
        }

        assemble_node(
            true, &tree, 1, &mut fronts, &mut arena, &mut contribs, &mut map, &aval, None,
        );

        // child L21 = [1, 2] / 2, contribution = -L21 L21^T
        let lcol = &arena.real[fronts[1].lcol.clone()];
        assert_approx_eq!(lcol[0], 5.0 - 0.25, 1e-14);
        assert_approx_eq!(lcol[1], 3.0 - 0.5, 1e-14);
        assert_approx_eq!(lcol[3], 6.0 - 1.0, 1e-14);
        // consumed and released
        assert!(fronts[0].contrib.is_none());
        assert_eq!(contribs.live_len(), 0);
    }

    #[test]
    fn test_delay_rewiring() {
        // the child's unpivotable column is appended to the parent's
        // fully-summed block
        let n = 2;
        // A = [[0, 1], [1, 4]]; column 0 cannot be pivoted at the child
        let a = vec![0.0, 1.0, 1.0, 4.0];
        let mut child = node(2, 1, vec![0, 1]);
        let mut parent = node(1, 1, vec![1]);
        parent.first_child = 0;
        let mut aval = Vec::new();
        dense_amap(&a, n, &mut child, &mut aval);
        dense_amap(&a, n, &mut parent, &mut aval);
        let tree = AssemblyTree::new(n, vec![child, parent]);

        let mut arena = FactorArena::new();
        let mut contribs = ContribAlloc::paired_stacks();
        let mut fronts = empty_fronts(2);
        let mut map = vec![0usize; n];

        assemble_node(
            false, &tree, 0, &mut fronts, &mut arena, &mut contribs, &mut map, &aval, None,
        );
        {
            let (l, d) = arena.real[fronts[0].lcol.clone()].split_at_mut(2);
            let perm = &mut arena.int[fronts[0].perm.clone()];
            let nelim = ldlt::factor(
                MatMut::from_column_major_slice_mut(l, 2, 1),
                d,
                perm,
                0.01,
                1e-20,
            );
            assert_eq!(nelim, 0);
            fronts[0].ndelay_out = 1;
        }
        // nelim == 0: no update to form, the contribution block stays zero

        assemble_node(
            false, &tree, 1, &mut fronts, &mut arena, &mut contribs, &mut map, &aval, None,
        );

        let f = &fronts[1];
        assert_eq!((f.nrow, f.ncol, f.ndelay_in), (2, 2, 1));
        assert_eq!(&arena.int[f.perm.clone()], &[1, 0]);
        let lcol = &arena.real[f.lcol.clone()];
        // lower triangle: [[4, .], [1, 0]] in the permuted order
        assert_eq!(lcol[0], 4.0);
        assert_eq!(lcol[1], 1.0);
        assert_eq!(lcol[3], 0.0);
        assert_eq!(contribs.live_len(), 0);
    }
}
