//! Speech-activity scoring.
//!
//! Each participant's recent levels are reduced to three nested time scales
//! (immediate, medium, long). At every scale the first aggregate value `v` is
//! turned into a binomial log-likelihood score:
//!
//! ```text
//! score = ln C(n, v) + v·ln p + (n − v)·ln(1 − p) − ln λ + λ·v
//! ```
//!
//! floored at [`MIN_SCORE`] so the log-ratios taken by the switch rule stay
//! finite. `p` and the per-scale `λ` are empirically tuned and must not change.

/// Highest quantized audio level.
pub const MAX_LEVEL: u8 = 127;

/// Immediates per raw level range (`N1`).
pub const N1: usize = 13;
/// Immediates per medium (`N2`).
pub const N2: usize = 5;
/// Mediums per long (`N3`).
pub const N3: usize = 10;
/// Number of long aggregates kept.
pub const LONG_COUNT: usize = 1;

/// Levels kept per speaker: one per immediate.
pub const HISTORY_LEN: usize = LONG_COUNT * N3 * N2;
/// Mediums kept per speaker.
pub const MEDIUM_COUNT: usize = LONG_COUNT * N3;

/// Width of one immediate bucket, `ceil(128 / N1)`.
pub const N1_SUBUNIT_WIDTH: u8 = ((MAX_LEVEL as usize + N1) / N1) as u8;

/// An immediate above this counts towards its medium.
pub const MEDIUM_THRESHOLD: u8 = 7;
/// A medium above this counts towards its long.
pub const LONG_THRESHOLD: u8 = 4;

/// Floor for every score.
pub const MIN_SCORE: f64 = 1e-10;

/// Relative immediate activity a challenger must exceed.
pub const C1: f64 = 3.0;
/// Relative medium activity a challenger must exceed.
pub const C2: f64 = 2.0;
/// Relative long activity a challenger must exceed.
pub const C3: f64 = 0.0;

const ACTIVATION_PROBABILITY: f64 = 0.5;

/// The three time scales of the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scale {
    Immediate,
    Medium,
    Long,
}

impl Scale {
    pub const ALL: [Scale; 3] = [Scale::Immediate, Scale::Medium, Scale::Long];

    /// Sub-units (`nR`) summarised by one aggregate at this scale.
    pub fn subunits(self) -> u32 {
        match self {
            Scale::Immediate => N1 as u32,
            Scale::Medium => N2 as u32,
            Scale::Long => N3 as u32,
        }
    }

    /// Normalising rate `λ`.
    pub fn lambda(self) -> f64 {
        match self {
            Scale::Immediate => 0.78,
            Scale::Medium => 24.0,
            Scale::Long => 47.0,
        }
    }
}

/// `C(n, r)` via the multiplicative formula, iterating over the shorter side.
///
/// Every intermediate `t * i / j` is itself a binomial coefficient, so the
/// integer division is exact. Returns 0 when `r > n`.
pub fn binomial_coefficient(n: u32, r: u32) -> u64 {
    if r > n {
        return 0;
    }
    let r = r.max(n - r);
    let mut t: u64 = 1;
    let mut j: u64 = 1;
    let mut i = n;
    while i > r {
        t = t * u64::from(i) / j;
        i -= 1;
        j += 1;
    }
    t
}

/// Binomial log-likelihood score for `v` active sub-units out of `n_r`.
pub fn speech_activity_score(v: u32, n_r: u32, p: f64, lambda: f64) -> f64 {
    let v_f = f64::from(v);
    let score = (binomial_coefficient(n_r, v) as f64).ln()
        + v_f * p.ln()
        + (f64::from(n_r) - v_f) * (1.0 - p).ln()
        - lambda.ln()
        + lambda * v_f;
    // NaN fails the comparison and floors too.
    if score >= MIN_SCORE {
        score
    } else {
        MIN_SCORE
    }
}

/// Score of aggregate value `v` at `scale`.
pub fn scale_score(scale: Scale, v: u8) -> f64 {
    speech_activity_score(
        u32::from(v),
        scale.subunits(),
        ACTIVATION_PROBABILITY,
        scale.lambda(),
    )
}

/// Cached scores of one speaker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeechActivityScores {
    pub immediate: f64,
    pub medium: f64,
    pub long: f64,
}

impl Default for SpeechActivityScores {
    fn default() -> Self {
        Self {
            immediate: MIN_SCORE,
            medium: MIN_SCORE,
            long: MIN_SCORE,
        }
    }
}

impl SpeechActivityScores {
    pub fn get(&self, scale: Scale) -> f64 {
        match scale {
            Scale::Immediate => self.immediate,
            Scale::Medium => self.medium,
            Scale::Long => self.long,
        }
    }

    pub fn set(&mut self, scale: Scale, score: f64) {
        match scale {
            Scale::Immediate => self.immediate = score,
            Scale::Medium => self.medium = score,
            Scale::Long => self.long = score,
        }
    }
}

/// `ln(challenger / dominant)` at each scale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RelativeActivity {
    pub immediate: f64,
    pub medium: f64,
    pub long: f64,
}

impl RelativeActivity {
    pub fn between(challenger: &SpeechActivityScores, dominant: &SpeechActivityScores) -> Self {
        let ratio = |scale| (challenger.get(scale) / dominant.get(scale)).ln();
        Self {
            immediate: ratio(Scale::Immediate),
            medium: ratio(Scale::Medium),
            long: ratio(Scale::Long),
        }
    }

    /// Whether the challenger beats the dominant speaker at all three scales.
    pub fn exceeds_thresholds(&self) -> bool {
        self.immediate > C1 && self.medium > C2 && self.long > C3
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn subunit_width_matches_bucket_count() {
        assert_eq!(N1_SUBUNIT_WIDTH, 10);
        assert_eq!(HISTORY_LEN, 50);
        assert_eq!(MEDIUM_COUNT, 10);
        // Loudest level lands in the last bucket.
        assert!((MAX_LEVEL / N1_SUBUNIT_WIDTH) < N1 as u8);
    }

    #[test]
    fn binomial_coefficient_known_values() {
        assert_eq!(binomial_coefficient(13, 0), 1);
        assert_eq!(binomial_coefficient(13, 13), 1);
        assert_eq!(binomial_coefficient(13, 10), 286);
        assert_eq!(binomial_coefficient(13, 3), 286);
        assert_eq!(binomial_coefficient(10, 5), 252);
        assert_eq!(binomial_coefficient(5, 1), 5);
        assert_eq!(binomial_coefficient(5, 6), 0);
    }

    #[test]
    fn zero_activity_floors_at_every_scale() {
        for scale in Scale::ALL {
            assert_eq!(scale_score(scale, 0), MIN_SCORE, "{scale:?}");
        }
    }

    #[test]
    fn active_scores_match_model() {
        assert_relative_eq!(scale_score(Scale::Immediate, 10), 4.693_54, epsilon = 1e-4);
        assert_relative_eq!(scale_score(Scale::Medium, 5), 113.356_21, epsilon = 1e-4);
        assert_relative_eq!(scale_score(Scale::Long, 10), 459.218_38, epsilon = 1e-4);
    }

    #[test]
    fn out_of_range_activity_floors() {
        assert_eq!(speech_activity_score(6, 5, 0.5, 24.0), MIN_SCORE);
    }

    #[test]
    fn medium_score_grows_with_activity() {
        let scores: Vec<f64> = (1..=5).map(|v| scale_score(Scale::Medium, v)).collect();
        assert!(scores.windows(2).all(|w| w[1] > w[0]), "{scores:?}");
    }

    #[test]
    fn relative_activity_of_equal_scores_is_zero() {
        let a = SpeechActivityScores::default();
        let rel = RelativeActivity::between(&a, &a);
        assert_eq!(rel.immediate, 0.0);
        assert!(!rel.exceeds_thresholds());
    }

    #[test]
    fn relative_activity_requires_all_three_scales() {
        let dominant = SpeechActivityScores::default();
        let mut challenger = SpeechActivityScores {
            immediate: scale_score(Scale::Immediate, 12),
            medium: scale_score(Scale::Medium, 1),
            long: MIN_SCORE,
        };
        assert!(!RelativeActivity::between(&challenger, &dominant).exceeds_thresholds());

        challenger.set(Scale::Long, scale_score(Scale::Long, 5));
        let rel = RelativeActivity::between(&challenger, &dominant);
        assert!(rel.exceeds_thresholds(), "{rel:?}");
    }
}
