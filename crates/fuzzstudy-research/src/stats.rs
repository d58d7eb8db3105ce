//! Descriptive statistics, rank correlation and two-sample tests
//!
//! Conventions follow the usual scientific Python stack: linear-interpolated
//! percentiles, average ranks for ties, two-sided p-values, and for
//! Mann-Whitney U an exact p-value on small tie-free samples with the normal
//! approximation (tie- and continuity-corrected) otherwise.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

pub fn median(values: &[f64]) -> Option<f64> {
    percentile(values, 50.0)
}

/// `q`-th percentile (0..=100) with linear interpolation between order statistics.
pub fn percentile(values: &[f64], q: f64) -> Option<f64> {
    if values.is_empty() || !(0.0..=100.0).contains(&q) {
        return None;
    }
    let sorted = sorted(values);
    let h = (sorted.len() - 1) as f64 * q / 100.0;
    let lo = h.floor() as usize;
    let hi = (lo + 1).min(sorted.len() - 1);
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * (h - lo as f64))
}

fn sorted(values: &[f64]) -> Vec<f64> {
    let mut v = values.to_vec();
    v.sort_by(f64::total_cmp);
    v
}

/// 1-based ranks; tied values share their average rank.
pub fn ranks(values: &[f64]) -> Vec<f64> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));

    let mut out = vec![0.0; values.len()];
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && values[order[j + 1]] == values[order[i]] {
            j += 1;
        }
        let avg = (i + j) as f64 / 2.0 + 1.0;
        for &k in &order[i..=j] {
            out[k] = avg;
        }
        i = j + 1;
    }
    out
}

/// Correlation coefficient with its two-sided p-value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Correlation {
    pub coefficient: f64,
    pub p_value: f64,
}

/// Pearson's r. `None` for fewer than two pairs, mismatched lengths, or a
/// constant input.
pub fn pearson(x: &[f64], y: &[f64]) -> Option<Correlation> {
    let n = x.len();
    if n < 2 || n != y.len() {
        return None;
    }
    let mx = mean(x)?;
    let my = mean(y)?;
    let (mut sxy, mut sxx, mut syy) = (0.0, 0.0, 0.0);
    for (a, b) in x.iter().zip(y) {
        sxy += (a - mx) * (b - my);
        sxx += (a - mx).powi(2);
        syy += (b - my).powi(2);
    }
    if sxx == 0.0 || syy == 0.0 {
        return None;
    }
    let r = (sxy / (sxx * syy).sqrt()).clamp(-1.0, 1.0);
    Some(Correlation {
        coefficient: r,
        p_value: correlation_p_value(r, n),
    })
}

/// Spearman's rho: Pearson's r over average ranks.
pub fn spearman(x: &[f64], y: &[f64]) -> Option<Correlation> {
    if x.len() != y.len() {
        return None;
    }
    pearson(&ranks(x), &ranks(y))
}

/// Two-sided p-value of r under the t distribution with n - 2 degrees of freedom.
fn correlation_p_value(r: f64, n: usize) -> f64 {
    if n <= 2 {
        return 1.0;
    }
    if r.abs() >= 1.0 {
        return 0.0;
    }
    let df = (n - 2) as f64;
    let t2 = r * r * df / (1.0 - r * r);
    incomplete_beta(df / 2.0, 0.5, df / (df + t2))
}

/// Mann-Whitney U test result
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MannWhitney {
    /// U statistic of the first sample
    pub u: f64,
    pub p_value: f64,
}

/// Largest group size for which tie-free samples get an exact p-value.
pub const MWU_EXACT_MAX: usize = 8;

/// Two-sided Mann-Whitney U test. `None` when either sample is empty.
///
/// Without ties and with one sample of at most [`MWU_EXACT_MAX`] values the
/// p-value comes from the exact null distribution of U. Otherwise it is the
/// normal approximation with tie and continuity correction.
pub fn mann_whitney_u(a: &[f64], b: &[f64]) -> Option<MannWhitney> {
    let (n1, n2) = (a.len() as f64, b.len() as f64);
    if a.is_empty() || b.is_empty() {
        return None;
    }
    let combined: Vec<f64> = a.iter().chain(b).copied().collect();
    let r = ranks(&combined);
    let r1: f64 = r[..a.len()].iter().sum();
    let u1 = r1 - n1 * (n1 + 1.0) / 2.0;
    let u2 = n1 * n2 - u1;

    let ties = tie_groups(&combined);
    if ties.iter().all(|t| *t == 1) && a.len().min(b.len()) <= MWU_EXACT_MAX {
        let p_value = exact_u_p_value(u1.max(u2), a.len(), b.len());
        return Some(MannWhitney { u: u1, p_value });
    }

    let n = n1 + n2;
    let tie_term: f64 = ties
        .into_iter()
        .map(|t| {
            let t = t as f64;
            t * t * t - t
        })
        .sum();
    let mu = n1 * n2 / 2.0;
    let sigma = (n1 * n2 / 12.0 * ((n + 1.0) - tie_term / (n * (n - 1.0)))).sqrt();

    let p_value = if sigma == 0.0 || !sigma.is_finite() {
        1.0
    } else {
        let z = (u1.max(u2) - mu - 0.5) / sigma;
        (2.0 * normal_sf(z)).min(1.0)
    };
    Some(MannWhitney { u: u1, p_value })
}

/// Number of rank arrangements giving each U in `0..=m*n`.
///
/// These are the coefficients of the Gaussian binomial `[m + n choose m]`,
/// built one factor `(1 - q^(n+i)) / (1 - q^i)` at a time: the division runs
/// first as a running sum, so no coefficient ever goes negative.
fn u_distribution(m: usize, n: usize) -> Vec<u128> {
    let (m, n) = (m.min(n), m.max(n));
    let mut coef = vec![0u128; m * n + 1];
    coef[0] = 1;
    for i in 1..=m {
        let len = i * n + 1;
        for k in i..len {
            coef[k] += coef[k - i];
        }
        for k in (n + i..len).rev() {
            coef[k] -= coef[k - n - i];
        }
    }
    coef
}

/// `2 * P(U >= u)` under the null, capped at 1.
fn exact_u_p_value(u: f64, m: usize, n: usize) -> f64 {
    let counts = u_distribution(m, n);
    let total: u128 = counts.iter().sum();
    let from = u.ceil() as usize;
    let upper: u128 = counts.iter().skip(from).sum();
    (2.0 * upper as f64 / total as f64).min(1.0)
}

fn tie_groups(values: &[f64]) -> Vec<usize> {
    let sorted = sorted(values);
    let mut groups = Vec::new();
    let mut i = 0;
    while i < sorted.len() {
        let mut j = i;
        while j + 1 < sorted.len() && sorted[j + 1] == sorted[i] {
            j += 1;
        }
        groups.push(j - i + 1);
        i = j + 1;
    }
    groups
}

/// Effect-size magnitude of Cliff's delta
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Magnitude {
    Negligible,
    Small,
    Medium,
    Large,
}

impl Magnitude {
    pub fn of(delta: f64) -> Self {
        let d = delta.abs();
        if d < 0.147 {
            Magnitude::Negligible
        } else if d < 0.33 {
            Magnitude::Small
        } else if d < 0.474 {
            Magnitude::Medium
        } else {
            Magnitude::Large
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Magnitude::Negligible => "negligible",
            Magnitude::Small => "small",
            Magnitude::Medium => "medium",
            Magnitude::Large => "large",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CliffsDelta {
    pub delta: f64,
    pub magnitude: Magnitude,
}

/// Cliff's delta of `a` over `b`: P(a > b) - P(a < b).
pub fn cliffs_delta(a: &[f64], b: &[f64]) -> Option<CliffsDelta> {
    if a.is_empty() || b.is_empty() {
        return None;
    }
    let b = sorted(b);
    let (mut greater, mut lesser) = (0u64, 0u64);
    for x in a {
        let below = b.partition_point(|y| y.total_cmp(x) == Ordering::Less);
        let at_or_below = b.partition_point(|y| y.total_cmp(x) != Ordering::Greater);
        greater += below as u64;
        lesser += (b.len() - at_or_below) as u64;
    }
    let delta = (greater as f64 - lesser as f64) / (a.len() as f64 * b.len() as f64);
    Some(CliffsDelta {
        delta,
        magnitude: Magnitude::of(delta),
    })
}

/// Five-number summary plus mean, for box plots
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoxSummary {
    pub n: usize,
    pub mean: f64,
    pub min: f64,
    pub q1: f64,
    pub median: f64,
    pub q3: f64,
    pub max: f64,
}

impl BoxSummary {
    pub fn of(values: &[f64]) -> Option<Self> {
        Some(Self {
            n: values.len(),
            mean: mean(values)?,
            min: percentile(values, 0.0)?,
            q1: percentile(values, 25.0)?,
            median: percentile(values, 50.0)?,
            q3: percentile(values, 75.0)?,
            max: percentile(values, 100.0)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Special functions
// ---------------------------------------------------------------------------

/// Upper tail of the standard normal distribution.
fn normal_sf(z: f64) -> f64 {
    0.5 * erfc(z / std::f64::consts::SQRT_2)
}

/// Complementary error function, Chebyshev fit (fractional error < 1.2e-7).
fn erfc(x: f64) -> f64 {
    let z = x.abs();
    let t = 1.0 / (1.0 + 0.5 * z);
    let poly = -z * z - 1.265_512_23
        + t * (1.000_023_68
            + t * (0.374_091_96
                + t * (0.096_784_18
                    + t * (-0.186_288_06
                        + t * (0.278_868_07
                            + t * (-1.135_203_98
                                + t * (1.488_515_87 + t * (-0.822_152_23 + t * 0.170_872_77))))))));
    let ans = t * poly.exp();
    if x >= 0.0 {
        ans
    } else {
        2.0 - ans
    }
}

/// ln Γ(x) for x > 0 (Lanczos).
fn ln_gamma(x: f64) -> f64 {
    const COF: [f64; 6] = [
        76.180_091_729_471_46,
        -86.505_320_329_416_77,
        24.014_098_240_830_91,
        -1.231_739_572_450_155,
        0.120_865_097_386_617_9e-2,
        -0.539_523_938_495_3e-5,
    ];
    let mut y = x;
    let tmp = x + 5.5;
    let tmp = tmp - (x + 0.5) * tmp.ln();
    let mut ser = 1.000_000_000_190_015;
    for c in COF {
        y += 1.0;
        ser += c / y;
    }
    -tmp + (2.506_628_274_631_000_5 * ser / x).ln()
}

/// Regularised incomplete beta function I_x(a, b).
fn incomplete_beta(a: f64, b: f64, x: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    if x >= 1.0 {
        return 1.0;
    }
    let front = (ln_gamma(a + b) - ln_gamma(a) - ln_gamma(b) + a * x.ln() + b * (1.0 - x).ln())
        .exp();
    if x < (a + 1.0) / (a + b + 2.0) {
        front * beta_continued_fraction(a, b, x) / a
    } else {
        1.0 - front * beta_continued_fraction(b, a, 1.0 - x) / b
    }
}

fn beta_continued_fraction(a: f64, b: f64, x: f64) -> f64 {
    const MAX_ITER: usize = 300;
    const EPS: f64 = 3.0e-14;
    const TINY: f64 = 1.0e-300;
    let guard = |v: f64| if v.abs() < TINY { TINY } else { v };

    let (qab, qap, qam) = (a + b, a + 1.0, a - 1.0);
    let mut c = 1.0;
    let mut d = 1.0 / guard(1.0 - qab * x / qap);
    let mut h = d;
    for m in 1..=MAX_ITER {
        let m = m as f64;
        let m2 = 2.0 * m;
        let aa = m * (b - m) * x / ((qam + m2) * (a + m2));
        d = 1.0 / guard(1.0 + aa * d);
        c = guard(1.0 + aa / c);
        h *= d * c;
        let aa = -(a + m) * (qab + m) * x / ((a + m2) * (qap + m2));
        d = 1.0 / guard(1.0 + aa * d);
        c = guard(1.0 + aa / c);
        let del = d * c;
        h *= del;
        if (del - 1.0).abs() < EPS {
            break;
        }
    }
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() <= tol
    }

    #[test]
    fn descriptive_statistics() {
        let v = [3.0, 1.0, 4.0, 1.0, 5.0, 9.0, 2.0, 6.0];
        assert_eq!(mean(&v), Some(3.875));
        assert_eq!(median(&v), Some(3.5));
        assert_eq!(percentile(&v, 25.0), Some(1.75));
        assert_eq!(percentile(&v, 75.0), Some(5.25));
        assert_eq!(median(&[7.0]), Some(7.0));
        assert_eq!(mean(&[]), None);
        assert_eq!(percentile(&v, 101.0), None);
    }

    #[test]
    fn tied_values_share_average_rank() {
        assert_eq!(ranks(&[2.0, 4.0, 5.0, 4.0, 5.0]), vec![1.0, 2.5, 4.5, 2.5, 4.5]);
    }

    #[test]
    fn pearson_reference_values() {
        let c = pearson(&[1.0, 2.0, 3.0, 4.0], &[1.0, 3.0, 2.0, 4.0]).unwrap();
        assert!(close(c.coefficient, 0.8, 1e-12));
        assert!(close(c.p_value, 0.2, 1e-8), "{}", c.p_value);

        let c = pearson(&[1.0, 2.0, 3.0], &[1.0, 3.0, 2.0]).unwrap();
        assert!(close(c.coefficient, 0.5, 1e-12));
        assert!(close(c.p_value, 2.0 / 3.0, 1e-8), "{}", c.p_value);

        let c = pearson(&[1.0, 2.0, 3.0, 4.0, 5.0], &[2.0, 4.0, 5.0, 4.0, 5.0]).unwrap();
        assert!(close(c.coefficient, 0.774_596_669_241_483_4, 1e-12));
    }

    #[test]
    fn spearman_reference_values() {
        let c = spearman(&[1.0, 2.0, 3.0, 4.0, 5.0], &[2.0, 4.0, 5.0, 4.0, 5.0]).unwrap();
        assert!(close(c.coefficient, 0.737_864_787_372_621_8, 1e-12));

        let mono = spearman(&[0.0, 1.0, 2.0, 3.0], &[1.0, 10.0, 100.0, 1000.0]).unwrap();
        assert!(close(mono.coefficient, 1.0, 1e-12));
        assert_eq!(mono.p_value, 0.0);
    }

    #[test]
    fn correlation_undefined_for_short_or_constant_input() {
        assert!(spearman(&[1.0], &[2.0]).is_none());
        assert!(spearman(&[1.0, 2.0, 3.0], &[5.0, 5.0, 5.0]).is_none());
        assert!(pearson(&[1.0, 2.0], &[1.0]).is_none());
        assert_eq!(pearson(&[1.0, 2.0], &[3.0, 1.0]).unwrap().p_value, 1.0);
    }

    #[test]
    fn u_distribution_counts_arrangements() {
        assert_eq!(u_distribution(2, 2), vec![1, 1, 2, 1, 1]);
        assert_eq!(u_distribution(3, 2), vec![1, 1, 2, 2, 2, 1, 1]);
        let d = u_distribution(5, 5);
        assert_eq!(d.iter().sum::<u128>(), 252);
        assert_eq!(d.len(), 26);
    }

    #[test]
    fn mann_whitney_exact_for_small_tie_free_samples() {
        let t = mann_whitney_u(&[1.0, 2.0, 3.0, 4.0, 5.0], &[6.0, 7.0, 8.0, 9.0, 10.0]).unwrap();
        assert_eq!(t.u, 0.0);
        assert!(close(t.p_value, 2.0 / 252.0, 1e-12), "{}", t.p_value);

        let t = mann_whitney_u(&[1.0, 2.0, 3.0], &[4.0, 5.0]).unwrap();
        assert!(close(t.p_value, 0.2, 1e-12), "{}", t.p_value);

        // U = 2 of 6 sits near the centre of [1, 1, 2, 2, 2, 1, 1].
        let t = mann_whitney_u(&[1.0, 4.0, 5.0], &[2.0, 3.0]).unwrap();
        assert_eq!(t.u, 4.0);
        assert!(close(t.p_value, 0.8, 1e-12), "{}", t.p_value);

        // Nine values each: back to the normal approximation.
        let a: Vec<f64> = (1..=9).map(f64::from).collect();
        let b: Vec<f64> = (10..=18).map(f64::from).collect();
        let t = mann_whitney_u(&a, &b).unwrap();
        assert!(t.p_value > 1e-4, "{}", t.p_value);
    }

    #[test]
    fn mann_whitney_normal_approximation_with_ties() {
        let t = mann_whitney_u(
            &[1.0, 2.0, 2.0, 3.0, 5.0, 8.0],
            &[2.0, 3.0, 3.0, 4.0, 6.0, 7.0, 9.0],
        )
        .unwrap();
        assert_eq!(t.u, 13.0);
        assert!(close(t.p_value, 0.278_630_821_642_091_5, 1e-6), "{}", t.p_value);

        let same = mann_whitney_u(&[1.0, 1.0], &[1.0, 1.0]).unwrap();
        assert_eq!(same.p_value, 1.0);
        assert!(mann_whitney_u(&[], &[1.0]).is_none());
    }

    #[test]
    fn cliffs_delta_reference_values() {
        let d = cliffs_delta(
            &[1.0, 2.0, 2.0, 3.0, 5.0, 8.0],
            &[2.0, 3.0, 3.0, 4.0, 6.0, 7.0, 9.0],
        )
        .unwrap();
        assert!(close(d.delta, -0.380_952_380_952_380_93, 1e-12));
        assert_eq!(d.magnitude, Magnitude::Medium);

        let d = cliffs_delta(&[10.0, 11.0, 12.0], &[1.0, 2.0, 3.0]).unwrap();
        assert_eq!(d.delta, 1.0);
        assert_eq!(d.magnitude, Magnitude::Large);
    }

    #[test]
    fn magnitude_thresholds() {
        assert_eq!(Magnitude::of(0.146), Magnitude::Negligible);
        assert_eq!(Magnitude::of(-0.147), Magnitude::Small);
        assert_eq!(Magnitude::of(0.33), Magnitude::Medium);
        assert_eq!(Magnitude::of(0.474), Magnitude::Large);
    }

    #[test]
    fn box_summary_of_values() {
        let b = BoxSummary::of(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!((b.n, b.min, b.max), (4, 1.0, 4.0));
        assert_eq!((b.q1, b.median, b.q3), (1.75, 2.5, 3.25));
        assert!(BoxSummary::of(&[]).is_none());
    }
}
