/**
 * MOTEUR D'ANALYSE STATISTIQUE - Comparaison baseline vs candidate
 *
 * RÔLE : Calcul pur (aucune I/O) : moyenne, variance, t de Welch, p-value bilatérale,
 * d de Cohen, variation relative, significativité avec correction de Bonferroni.
 *
 * FONCTIONNEMENT :
 * - Entrées dégénérées (< 2 points, variance nulle des deux côtés) => Inconclusive
 * - p ajustée = min(p * nombre_de_métriques, 1.0)
 * - Recommandation globale : Rollback si une régression significative, Promote si au moins
 *   une amélioration significative, sinon NoChange
 */

pub mod special;

use serde::{Deserialize, Serialize};

use crate::models::{MetricDirection, MetricGoal, MetricResult, Recommendation};

pub const DEFAULT_ALPHA: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SampleStats {
    pub n: usize,
    pub mean: f64,
    pub variance: f64,
    pub stdev: f64,
}

impl SampleStats {
    /// Statistiques descriptives (variance non biaisée), None si moins de 2 points
    pub fn from_samples(samples: &[f64]) -> Option<Self> {
        let n = samples.len();
        if n < 2 {
            return None;
        }
        let mean = samples.iter().sum::<f64>() / n as f64;
        let variance = samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
        Some(Self {
            n,
            mean,
            variance,
            stdev: variance.sqrt(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    pub baseline: SampleStats,
    pub candidate: SampleStats,
    pub t_statistic: f64,
    pub degrees_of_freedom: f64,
    pub p_value: f64,
    /// p-value après correction de Bonferroni
    pub adjusted_p_value: f64,
    pub cohens_d: f64,
    /// (candidate - baseline) / |baseline| en %, absent si la moyenne baseline est nulle
    pub relative_change_pct: Option<f64>,
    pub significant: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnalysisOutcome {
    Conclusive(Comparison),
    Inconclusive { reason: String },
}

impl AnalysisOutcome {
    pub fn comparison(&self) -> Option<&Comparison> {
        match self {
            AnalysisOutcome::Conclusive(c) => Some(c),
            AnalysisOutcome::Inconclusive { .. } => None,
        }
    }

    pub fn is_conclusive(&self) -> bool {
        matches!(self, AnalysisOutcome::Conclusive(_))
    }
}

fn inconclusive(reason: impl Into<String>) -> AnalysisOutcome {
    AnalysisOutcome::Inconclusive { reason: reason.into() }
}

/// Test t de Welch entre deux séquences. `comparisons` = nombre de métriques évaluées.
pub fn compare(baseline: &[f64], candidate: &[f64], alpha: f64, comparisons: usize) -> AnalysisOutcome {
    let baseline: Vec<f64> = baseline.iter().copied().filter(|v| v.is_finite()).collect();
    let candidate: Vec<f64> = candidate.iter().copied().filter(|v| v.is_finite()).collect();

    let (Some(b), Some(c)) = (
        SampleStats::from_samples(&baseline),
        SampleStats::from_samples(&candidate),
    ) else {
        return inconclusive(format!(
            "not enough samples (baseline={}, candidate={}, need >= 2 each)",
            baseline.len(),
            candidate.len()
        ));
    };

    if b.variance == 0.0 && c.variance == 0.0 {
        return inconclusive("zero variance in both sample sets");
    }

    let se_b = b.variance / b.n as f64;
    let se_c = c.variance / c.n as f64;
    let standard_error = (se_b + se_c).sqrt();
    let t_statistic = (c.mean - b.mean) / standard_error;

    // Welch–Satterthwaite
    let degrees_of_freedom = (se_b + se_c).powi(2)
        / (se_b.powi(2) / (b.n - 1) as f64 + se_c.powi(2) / (c.n - 1) as f64);

    let p_value = special::student_t_two_sided_p(t_statistic, degrees_of_freedom);
    let adjusted_p_value = (p_value * comparisons.max(1) as f64).min(1.0);

    let pooled_sd = (((b.n - 1) as f64 * b.variance + (c.n - 1) as f64 * c.variance)
        / (b.n + c.n - 2) as f64)
        .sqrt();
    let cohens_d = if pooled_sd > 0.0 { (c.mean - b.mean) / pooled_sd } else { 0.0 };

    let relative_change_pct = if b.mean != 0.0 {
        Some((c.mean - b.mean) / b.mean.abs() * 100.0)
    } else {
        None
    };

    if !t_statistic.is_finite() || !p_value.is_finite() {
        return inconclusive("numerical failure while computing the t statistic");
    }

    AnalysisOutcome::Conclusive(Comparison {
        baseline: b,
        candidate: c,
        t_statistic,
        degrees_of_freedom,
        p_value,
        adjusted_p_value,
        cohens_d,
        relative_change_pct,
        significant: adjusted_p_value < alpha,
    })
}

/// Séquences matérialisées pour une métrique
#[derive(Debug, Clone)]
pub struct MetricInput {
    pub goal: MetricGoal,
    pub baseline: Vec<f64>,
    pub candidate: Vec<f64>,
}

/// Analyse de toutes les métriques d'une expérience, Bonferroni sur leur nombre
pub fn analyze_metrics(inputs: &[MetricInput], alpha: f64) -> Vec<MetricResult> {
    let comparisons = inputs.len();
    inputs
        .iter()
        .map(|input| MetricResult {
            metric: input.goal.name.clone(),
            direction: input.goal.direction,
            outcome: compare(&input.baseline, &input.candidate, alpha, comparisons),
        })
        .collect()
}

fn is_improvement(direction: MetricDirection, comparison: &Comparison) -> bool {
    match direction {
        MetricDirection::LowerIsBetter => comparison.candidate.mean < comparison.baseline.mean,
        MetricDirection::HigherIsBetter => comparison.candidate.mean > comparison.baseline.mean,
    }
}

pub fn recommend(results: &[MetricResult]) -> Recommendation {
    let mut improved = false;
    for result in results {
        let Some(comparison) = result.outcome.comparison() else { continue };
        if !comparison.significant {
            continue;
        }
        if is_improvement(result.direction, comparison) {
            improved = true;
        } else {
            return Recommendation::Rollback;
        }
    }
    if improved {
        Recommendation::Promote
    } else {
        Recommendation::NoChange
    }
}

/// Un résultat est exploitable dès qu'une métrique est concluante
pub fn is_usable(results: &[MetricResult]) -> bool {
    results.iter().any(|r| r.outcome.is_conclusive())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Séquence alternée de moyenne et d'écart-type (non biaisé) exacts
    fn alternating(mean: f64, stdev: f64, n: usize) -> Vec<f64> {
        let d = stdev * ((n as f64 - 1.0) / n as f64).sqrt();
        (0..n).map(|i| if i % 2 == 0 { mean + d } else { mean - d }).collect()
    }

    fn goal(name: &str) -> MetricGoal {
        MetricGoal { name: name.into(), direction: MetricDirection::LowerIsBetter }
    }

    #[test]
    fn welch_detects_ten_percent_drop() {
        let baseline = alternating(100.0, 5.0, 40);
        let candidate = alternating(90.0, 5.0, 40);

        let outcome = compare(&baseline, &candidate, DEFAULT_ALPHA, 1);
        let c = outcome.comparison().expect("conclusive");

        assert!((c.baseline.mean - 100.0).abs() < 1e-9);
        assert!((c.baseline.stdev - 5.0).abs() < 1e-9);
        // t = -10 / sqrt(25/40 + 25/40)
        assert!((c.t_statistic - (-8.944_272)).abs() < 1e-5);
        assert!((c.degrees_of_freedom - 78.0).abs() < 1e-9);
        assert!(c.p_value < 0.05);
        assert!(c.p_value < 1e-10);
        assert!(c.significant);
        assert!((c.relative_change_pct.unwrap() - (-10.0)).abs() < 1e-9);
        assert!((c.cohens_d - (-2.0)).abs() < 1e-9);
    }

    #[test]
    fn identical_sets_are_not_significant() {
        let samples = vec![3.0, 5.0, 4.0, 6.0, 5.5, 4.5];
        let outcome = compare(&samples, &samples, DEFAULT_ALPHA, 1);
        let c = outcome.comparison().expect("conclusive");
        assert!((c.p_value - 1.0).abs() < 1e-9);
        assert_eq!(c.t_statistic, 0.0);
        assert!(!c.significant);
    }

    #[test]
    fn too_few_samples_is_inconclusive() {
        let outcome = compare(&[1.0], &[1.0, 2.0, 3.0], DEFAULT_ALPHA, 1);
        assert!(matches!(outcome, AnalysisOutcome::Inconclusive { .. }));

        let outcome = compare(&[], &[], DEFAULT_ALPHA, 1);
        assert!(!outcome.is_conclusive());
    }

    #[test]
    fn zero_variance_both_sides_is_inconclusive() {
        let outcome = compare(&[2.0, 2.0, 2.0], &[3.0, 3.0], DEFAULT_ALPHA, 1);
        assert!(matches!(outcome, AnalysisOutcome::Inconclusive { .. }));
    }

    #[test]
    fn non_finite_samples_are_dropped() {
        let outcome = compare(&[f64::NAN, 1.0], &[1.0, 2.0, 3.0], DEFAULT_ALPHA, 1);
        assert!(!outcome.is_conclusive());
    }

    #[test]
    fn bonferroni_caps_and_can_flip_significance() {
        // t ~ 2.1 with df ~ 38: p ~ 0.04, significant alone, not across 3 metrics
        let baseline = alternating(100.0, 5.0, 20);
        let candidate = alternating(96.7, 5.0, 20);

        let single = compare(&baseline, &candidate, DEFAULT_ALPHA, 1);
        let triple = compare(&baseline, &candidate, DEFAULT_ALPHA, 3);
        let single = single.comparison().unwrap();
        let triple = triple.comparison().unwrap();

        assert!(single.significant);
        assert!(!triple.significant);
        assert!((triple.adjusted_p_value - (single.p_value * 3.0).min(1.0)).abs() < 1e-12);

        let many = compare(&baseline, &candidate, DEFAULT_ALPHA, 1000);
        assert_eq!(many.comparison().unwrap().adjusted_p_value, 1.0);
    }

    #[test]
    fn recommendation_follows_metric_direction() {
        let inputs = vec![MetricInput {
            goal: goal("datapoints_per_sec"),
            baseline: alternating(100.0, 5.0, 40),
            candidate: alternating(90.0, 5.0, 40),
        }];
        let results = analyze_metrics(&inputs, DEFAULT_ALPHA);
        assert_eq!(recommend(&results), Recommendation::Promote);
        assert!(is_usable(&results));

        let inputs = vec![MetricInput {
            goal: MetricGoal { name: "series_coverage".into(), direction: MetricDirection::HigherIsBetter },
            baseline: alternating(100.0, 5.0, 40),
            candidate: alternating(90.0, 5.0, 40),
        }];
        let results = analyze_metrics(&inputs, DEFAULT_ALPHA);
        assert_eq!(recommend(&results), Recommendation::Rollback);
    }

    #[test]
    fn inconclusive_metrics_are_not_usable() {
        let inputs = vec![MetricInput { goal: goal("cpu"), baseline: vec![1.0], candidate: vec![] }];
        let results = analyze_metrics(&inputs, DEFAULT_ALPHA);
        assert!(!is_usable(&results));
        assert_eq!(recommend(&results), Recommendation::NoChange);
    }
}
