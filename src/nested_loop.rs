//! Dense indexer: row-major offset generation for up to three co-iterated
//! dense blocks sharing one loop nest. The last extent varies fastest.

fn run_one<F: FnMut(usize)>(level: usize, idx: usize, loop_cnt: &[usize], stride: &[usize], f: &mut F) {
    if level == loop_cnt.len() {
        f(idx);
        return;
    }
    let mut idx = idx;
    for _ in 0..loop_cnt[level] {
        run_one(level + 1, idx, loop_cnt, stride, f);
        idx += stride[level];
    }
}

/// Calls `f` with every flat offset of the loop nest starting at `base`.
pub fn run_nested_loop<F: FnMut(usize)>(base: usize, loop_cnt: &[usize], stride: &[usize], mut f: F) {
    debug_assert_eq!(loop_cnt.len(), stride.len());
    run_one(0, base, loop_cnt, stride, &mut f);
}

fn run_two<F: FnMut(usize, usize)>(
    level: usize,
    idx1: usize,
    idx2: usize,
    loop_cnt: &[usize],
    stride1: &[usize],
    stride2: &[usize],
    f: &mut F,
) {
    if level == loop_cnt.len() {
        f(idx1, idx2);
        return;
    }
    let (mut idx1, mut idx2) = (idx1, idx2);
    for _ in 0..loop_cnt[level] {
        run_two(level + 1, idx1, idx2, loop_cnt, stride1, stride2, f);
        idx1 += stride1[level];
        idx2 += stride2[level];
    }
}

pub fn run_nested_loop2<F: FnMut(usize, usize)>(
    base: (usize, usize),
    loop_cnt: &[usize],
    stride1: &[usize],
    stride2: &[usize],
    mut f: F,
) {
    debug_assert_eq!(loop_cnt.len(), stride1.len());
    debug_assert_eq!(loop_cnt.len(), stride2.len());
    run_two(0, base.0, base.1, loop_cnt, stride1, stride2, &mut f);
}

#[allow(clippy::too_many_arguments)]
fn run_three<F: FnMut(usize, usize, usize)>(
    level: usize,
    idx: [usize; 3],
    loop_cnt: &[usize],
    stride1: &[usize],
    stride2: &[usize],
    stride3: &[usize],
    f: &mut F,
) {
    if level == loop_cnt.len() {
        f(idx[0], idx[1], idx[2]);
        return;
    }
    let mut idx = idx;
    for _ in 0..loop_cnt[level] {
        run_three(level + 1, idx, loop_cnt, stride1, stride2, stride3, f);
        idx[0] += stride1[level];
        idx[1] += stride2[level];
        idx[2] += stride3[level];
    }
}

pub fn run_nested_loop3<F: FnMut(usize, usize, usize)>(
    base: (usize, usize, usize),
    loop_cnt: &[usize],
    strides: [&[usize]; 3],
    mut f: F,
) {
    for s in strides {
        debug_assert_eq!(loop_cnt.len(), s.len());
    }
    run_three(0, [base.0, base.1, base.2], loop_cnt, strides[0], strides[1], strides[2], &mut f);
}

/// Row-major strides for the given extents.
pub fn row_major_strides(sizes: &[usize]) -> Vec<usize> {
    let mut strides = vec![0; sizes.len()];
    let mut acc = 1;
    for i in (0..sizes.len()).rev() {
        strides[i] = acc;
        acc *= sizes[i];
    }
    strides
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn collect1(base: usize, loop_cnt: &[usize], stride: &[usize]) -> Vec<usize> {
        let mut out = Vec::new();
        run_nested_loop(base, loop_cnt, stride, |i| out.push(i));
        out
    }

    #[test]
    fn single_tensor_order() {
        assert_eq!(collect1(100, &[2, 2], &[1, 10]), vec![100, 110, 101, 111]);
    }

    #[test]
    fn empty_nest_visits_base_once() {
        assert_eq!(collect1(7, &[], &[]), vec![7]);
    }

    #[test]
    fn zero_extent_visits_nothing() {
        assert!(collect1(0, &[3, 0], &[1, 1]).is_empty());
    }

    #[test]
    fn restartable() {
        let a = collect1(5, &[3, 2, 2], &[4, 2, 1]);
        let b = collect1(5, &[3, 2, 2], &[4, 2, 1]);
        assert_eq!(a, b);
        assert_eq!(a, (5..17).collect::<Vec<_>>());
    }

    #[test]
    fn strides_are_row_major() {
        assert_eq!(row_major_strides(&[2, 3, 4]), vec![12, 4, 1]);
        assert!(row_major_strides(&[]).is_empty());
    }

    type Nest = (Vec<usize>, (Vec<usize>, Vec<usize>, Vec<usize>), (usize, usize, usize));

    fn nest() -> impl Strategy<Value = Nest> {
        (1usize..4).prop_flat_map(|n| {
            (
                prop::collection::vec(1usize..4, n),
                (
                    prop::collection::vec(0usize..20, n),
                    prop::collection::vec(0usize..20, n),
                    prop::collection::vec(0usize..20, n),
                ),
                (0usize..50, 0usize..50, 0usize..50),
            )
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn joint_iteration_matches_zipped_single((loop_cnt, (s1, s2, s3), base) in nest()) {
            let a = collect1(base.0, &loop_cnt, &s1);
            let b = collect1(base.1, &loop_cnt, &s2);
            let c = collect1(base.2, &loop_cnt, &s3);

            let mut pairs = Vec::new();
            run_nested_loop2((base.0, base.1), &loop_cnt, &s1, &s2, |x, y| pairs.push((x, y)));
            let zipped: Vec<_> = a.iter().copied().zip(b.iter().copied()).collect();
            prop_assert_eq!(pairs, zipped);

            let mut triples = Vec::new();
            run_nested_loop3(
                base,
                &loop_cnt,
                [&s1, &s2, &s3],
                |x, y, z| triples.push((x, y, z)),
            );
            prop_assert_eq!(triples.len(), a.len());
            for (i, t) in triples.iter().enumerate() {
                prop_assert_eq!(*t, (a[i], b[i], c[i]));
            }
        }
    }
}
