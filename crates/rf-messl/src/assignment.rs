//! Minimum-cost source assignment
//!
//! Small source counts are searched exhaustively in lexicographic order so
//! ties always resolve the same way; larger ones use Kuhn-Munkres.

use ndarray::Array2;

/// Largest source count searched by brute force
pub const MAX_BRUTE_FORCE_SOURCES: usize = 4;

/// Permutation minimising `sum_i cost[i, perm[i]]` for a square cost matrix
pub fn best_assignment(cost: &Array2<f64>) -> Vec<usize> {
    let n = cost.nrows();
    debug_assert_eq!(n, cost.ncols());
    let cost = cost.mapv(|c| if c.is_nan() { f64::MAX / (4 * n.max(1)) as f64 } else { c });
    if n <= MAX_BRUTE_FORCE_SOURCES {
        brute_force(&cost)
    } else {
        hungarian(&cost)
    }
}

/// Total cost of `perm`
pub fn assignment_cost(cost: &Array2<f64>, perm: &[usize]) -> f64 {
    perm.iter().enumerate().map(|(i, &j)| cost[[i, j]]).sum()
}

fn brute_force(cost: &Array2<f64>) -> Vec<usize> {
    let n = cost.nrows();
    let mut perm: Vec<usize> = (0..n).collect();
    let mut best = perm.clone();
    let mut best_cost = assignment_cost(cost, &perm);
    while next_permutation(&mut perm) {
        let c = assignment_cost(cost, &perm);
        if c < best_cost {
            best_cost = c;
            best.copy_from_slice(&perm);
        }
    }
    best
}

/// Advance to the next lexicographic permutation; false after the last one
fn next_permutation(perm: &mut [usize]) -> bool {
    let n = perm.len();
    if n < 2 {
        return false;
    }
    let mut i = n - 1;
    while i > 0 && perm[i - 1] >= perm[i] {
        i -= 1;
    }
    if i == 0 {
        return false;
    }
    let mut j = n - 1;
    while perm[j] <= perm[i - 1] {
        j -= 1;
    }
    perm.swap(i - 1, j);
    perm[i..].reverse();
    true
}

/// Kuhn-Munkres with row/column potentials, O(n^3)
fn hungarian(cost: &Array2<f64>) -> Vec<usize> {
    let n = cost.nrows();
    let mut u = vec![0.0; n + 1];
    let mut v = vec![0.0; n + 1];
    // p[j]: row matched to column j (1-based, 0 = free)
    let mut p = vec![0usize; n + 1];
    let mut way = vec![0usize; n + 1];

    for i in 1..=n {
        p[0] = i;
        let mut j0 = 0;
        let mut minv = vec![f64::INFINITY; n + 1];
        let mut used = vec![false; n + 1];
        loop {
            used[j0] = true;
            let i0 = p[j0];
            let mut delta = f64::INFINITY;
            let mut j1 = 0;
            for j in 1..=n {
                if used[j] {
                    continue;
                }
                let cur = cost[[i0 - 1, j - 1]] - u[i0] - v[j];
                if cur < minv[j] {
                    minv[j] = cur;
                    way[j] = j0;
                }
                if minv[j] < delta {
                    delta = minv[j];
                    j1 = j;
                }
            }
            for j in 0..=n {
                if used[j] {
                    u[p[j]] += delta;
                    v[j] -= delta;
                } else {
                    minv[j] -= delta;
                }
            }
            j0 = j1;
            if p[j0] == 0 {
                break;
            }
        }
        loop {
            let j1 = way[j0];
            p[j0] = p[j1];
            j0 = j1;
            if j0 == 0 {
                break;
            }
        }
    }

    let mut perm = vec![0; n];
    for j in 1..=n {
        if p[j] > 0 {
            perm[p[j] - 1] = j - 1;
        }
    }
    perm
}
