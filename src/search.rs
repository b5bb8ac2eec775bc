//! Bracketing hill-climb for the parameter that maximizes a count.
//!
//! Used to pick the DBSCAN radius giving the most groups. This is a
//! heuristic: it assumes the count rises to a single peak and then falls,
//! which holds often enough in practice but is not guaranteed.
//!
//! ## Schedule
//! 1. Evaluate at `lo`.
//! 2. Expand: evaluate at `lo + step * 2^k` for `k = 0, 1, ...` where
//!    `step = (hi - lo) / 2^iterations`, stopping at `hi` or as soon as the
//!    count drops below the best seen.
//! 3. Refine: for `iterations` rounds, evaluate the midpoints between the
//!    best point and its bracketing neighbours, moving towards any
//!    improvement and shrinking the bracket otherwise.
//!
//! A strictly larger count always wins; an equal count wins only at a
//! smaller parameter. At most `2 + 3 * iterations` evaluations are made.

use log::debug;

/// Search `[lo, hi]` for the smallest `x` with the largest `f(x)`.
///
/// Returns `(x, f(x))`.
pub fn expand_max<F>(lo: f64, hi: f64, iterations: u32, mut f: F) -> (f64, usize)
where
    F: FnMut(f64) -> usize,
{
    let mut evaluate = |x: f64| {
        let value = f(x);
        debug!("[Search] f({:.6}) = {}", x, value);
        value
    };

    let mut best = (lo, evaluate(lo));
    if hi <= lo {
        return best;
    }

    // Expansion
    let step = (hi - lo) / 2f64.powi(iterations as i32);
    let mut samples = vec![best];
    let mut best_index = 0;
    let mut offset = step;
    while offset.is_finite() && offset > 0.0 {
        let x = (lo + offset).min(hi);
        let value = evaluate(x);
        samples.push((x, value));
        if value > samples[best_index].1 {
            best_index = samples.len() - 1;
        } else if value < samples[best_index].1 {
            break;
        }
        if x >= hi {
            break;
        }
        offset *= 2.0;
    }
    best = samples[best_index];
    let mut left = samples[best_index.saturating_sub(1)].0;
    let mut right = samples.get(best_index + 1).map_or(best.0, |s| s.0);

    // Refinement
    for _ in 0..iterations {
        let mid = (left + best.0) / 2.0;
        if mid > left && mid < best.0 {
            let value = evaluate(mid);
            if value >= best.1 {
                right = best.0;
                best = (mid, value);
            } else {
                left = mid;
            }
        }
        let mid = (best.0 + right) / 2.0;
        if mid > best.0 && mid < right {
            let value = evaluate(mid);
            if value > best.1 {
                left = best.0;
                best = (mid, value);
            } else {
                right = mid;
            }
        }
    }

    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_peak() {
        // Integer-valued tent peaking at 0.3.
        let f = |x: f64| (10.0 - (x - 0.3).abs() * 20.0).max(0.0).round() as usize;
        let (x, value) = expand_max(0.0, 1.0, 5, f);
        assert_eq!(value, 10);
        assert!((x - 0.3).abs() < 0.05, "x = {}", x);
    }

    #[test]
    fn test_step_prefers_smallest_parameter() {
        // 0 below 0.11, then 2 everywhere above.
        let f = |x: f64| if x > 0.11 { 2 } else { 0 };
        let (x, value) = expand_max(0.0, 1.0, 5, f);
        assert_eq!(value, 2);
        assert!(x > 0.11 && x < 0.125, "x = {}", x);
    }

    #[test]
    fn test_constant_returns_lower_bound() {
        let (x, value) = expand_max(0.0, 1.0, 5, |_| 4);
        assert_eq!((x, value), (0.0, 4));
    }

    #[test]
    fn test_bounded_evaluations() {
        let mut calls = 0;
        let (_, value) = expand_max(0.0, 1.0, 5, |x| {
            calls += 1;
            (x * 100.0) as usize
        });
        assert_eq!(value, 100);
        assert!(calls <= 2 + 3 * 5, "calls = {}", calls);
    }

    #[test]
    fn test_underflowing_step_terminates() {
        // 2^1100 overflows, so the first step is zero.
        let mut calls = 0;
        let (x, value) = expand_max(0.0, 1.0, 1100, |_| {
            calls += 1;
            1
        });
        assert_eq!((x, value), (0.0, 1));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_empty_range() {
        let (x, value) = expand_max(0.5, 0.5, 5, |_| 1);
        assert_eq!((x, value), (0.5, 1));
    }
}
