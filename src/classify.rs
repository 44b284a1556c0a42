use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};

use crate::error::{CareError, CareResult};
use crate::models::{ClassificationResult, OverallClassification, PrimaryClassification, RiskLevel};
use crate::stats::SignalStats;

const IRREGULAR_VARIABILITY: f64 = 25.0;
const IRREGULAR_DELTA: u32 = 40;
const ABNORMAL_VARIABILITY: f64 = 20.0;
const STABLE_VARIABILITY: f64 = 15.0;
const REDUCED_VARIABILITY: f64 = 5.0;
const SEVERE_BAND_DEVIATION: f64 = 20.0;
const SHORT_TRACE_MINUTES: i32 = 20;
const ADVANCED_MATERNAL_AGE: i32 = 35;
const CONFIDENCE_SATURATION_SAMPLES: usize = 240;

/// Expected-normal BPM band for a gestational age.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalBand {
    pub low: i32,
    pub high: i32,
}

impl NormalBand {
    pub fn for_gestational_age(weeks: i32) -> Self {
        match weeks {
            w if w < 20 => Self { low: 120, high: 180 },
            20..=31 => Self { low: 115, high: 170 },
            _ => Self { low: 110, high: 160 },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FhrPoint {
    pub bpm: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_quality: Option<f64>,
}

/// Either a bare BPM array or annotated sample points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FhrData {
    Bpm(Vec<i32>),
    Points(Vec<FhrPoint>),
}

impl FhrData {
    pub fn bpm(&self) -> Vec<i32> {
        match self {
            Self::Bpm(values) => values.clone(),
            Self::Points(points) => points.iter().map(|p| p.bpm).collect(),
        }
    }

    pub fn mean_signal_quality(&self) -> Option<f64> {
        let Self::Points(points) = self else {
            return None;
        };
        let qualities: Vec<f64> = points.iter().filter_map(|p| p.signal_quality).collect();
        if qualities.is_empty() {
            return None;
        }
        Some(qualities.iter().sum::<f64>() / qualities.len() as f64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationRequest {
    pub fhr_data: FhrData,
    pub gestational_age: i32,
    #[serde(default)]
    pub maternal_age: Option<i32>,
    #[serde(default)]
    pub duration_minutes: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResponse {
    pub classification: PrimaryClassification,
    pub overall_classification: OverallClassification,
    pub risk_level: RiskLevel,
    pub average_bpm: f64,
    pub baseline_variability: f64,
    pub findings: Vec<String>,
    pub recommendations: Vec<String>,
    pub confidence: f64,
}

impl From<&ClassificationResult> for ClassificationResponse {
    fn from(result: &ClassificationResult) -> Self {
        Self {
            classification: result.primary_classification,
            overall_classification: result.overall_classification,
            risk_level: result.risk_level,
            average_bpm: round1(result.average_bpm),
            baseline_variability: round1(result.baseline_variability),
            findings: result.findings.clone(),
            recommendations: result.recommendations.clone(),
            confidence: result.confidence,
        }
    }
}

/// The single place FHR thresholds live. Stateless apart from the sample bounds,
/// so one instance can be shared across sessions and threads.
#[derive(Debug, Clone)]
pub struct Classifier {
    bounds: RangeInclusive<i32>,
}

impl Default for Classifier {
    fn default() -> Self {
        Self { bounds: 50..=300 }
    }
}

impl Classifier {
    pub fn new(bounds: RangeInclusive<i32>) -> Self {
        Self { bounds }
    }

    pub fn bounds(&self) -> &RangeInclusive<i32> {
        &self.bounds
    }

    pub fn classify_request(
        &self,
        request: &ClassificationRequest,
    ) -> CareResult<ClassificationResult> {
        let mut result = self.classify(
            &request.fhr_data.bpm(),
            request.gestational_age,
            request.maternal_age,
            request.duration_minutes,
        )?;
        if let Some(quality) = request.fhr_data.mean_signal_quality() {
            result.confidence = scale_confidence(result.confidence, quality);
        }
        Ok(result)
    }

    pub fn classify(
        &self,
        samples: &[i32],
        gestational_age: i32,
        maternal_age: Option<i32>,
        duration_minutes: Option<i32>,
    ) -> CareResult<ClassificationResult> {
        if !(1..=42).contains(&gestational_age) {
            return Err(CareError::invalid(format!(
                "gestational_age must be between 1 and 42 weeks (got {gestational_age})"
            )));
        }
        // Optional context is advisory; nonsensical values are dropped, not rejected.
        let maternal_age = maternal_age.filter(|age| *age > 0);
        let duration_minutes = duration_minutes.filter(|m| *m >= 0);

        let stats = SignalStats::compute(samples, &self.bounds)?;
        let band = NormalBand::for_gestational_age(gestational_age);
        let primary = primary_classification(&stats, band);
        let overall = overall_classification(primary, stats.std_dev);
        let risk = risk_level(primary, stats.mean, stats.std_dev, band);

        tracing::debug!(
            samples = stats.count,
            mean = stats.mean,
            std_dev = stats.std_dev,
            max_delta = stats.max_delta(),
            classification = %primary,
            risk = %risk,
            "classified fhr samples"
        );

        Ok(ClassificationResult {
            average_bpm: stats.mean,
            baseline_variability: stats.std_dev,
            primary_classification: primary,
            overall_classification: overall,
            risk_level: risk,
            findings: self.findings(&stats, band, gestational_age, primary, duration_minutes),
            recommendations: recommendations(primary, risk, maternal_age, duration_minutes),
            confidence: base_confidence(stats.count),
        })
    }

    fn findings(
        &self,
        stats: &SignalStats,
        band: NormalBand,
        gestational_age: i32,
        primary: PrimaryClassification,
        duration_minutes: Option<i32>,
    ) -> Vec<String> {
        let mut findings = vec![
            format!("Average FHR: {:.1} BPM", round1(stats.mean)),
            format!(
                "Expected range for {gestational_age} weeks gestation: {}-{} BPM",
                band.low, band.high
            ),
            format!("Baseline variability: {:.1} BPM", round1(stats.std_dev)),
        ];

        findings.push(match primary {
            PrimaryClassification::Normal => {
                "Heart rate within normal range for gestational age".to_string()
            }
            PrimaryClassification::Bradycardia => format!(
                "Average heart rate below normal range (bradycardia), {:.1} BPM under {}",
                round1(band.low as f64 - stats.mean),
                band.low
            ),
            PrimaryClassification::Tachycardia => format!(
                "Average heart rate above normal range (tachycardia), {:.1} BPM over {}",
                round1(stats.mean - band.high as f64),
                band.high
            ),
            PrimaryClassification::Irregular => format!(
                "Irregular heart rate pattern detected (largest beat-to-beat change {} BPM)",
                stats.max_delta()
            ),
        });

        if stats.std_dev > IRREGULAR_VARIABILITY {
            findings.push("Unusually high baseline variability".to_string());
        } else if stats.std_dev < REDUCED_VARIABILITY {
            findings.push("Reduced baseline variability (below 5 BPM)".to_string());
        }

        if stats.out_of_range > 0 {
            findings.push(format!(
                "{} sample(s) outside the physiological range {}-{} BPM",
                stats.out_of_range,
                self.bounds.start(),
                self.bounds.end()
            ));
        }

        if let Some(minutes) = duration_minutes.filter(|m| *m < SHORT_TRACE_MINUTES) {
            findings.push(format!("Monitoring trace shorter than 20 minutes ({minutes} min)"));
        }

        findings
    }
}

pub fn primary_classification(stats: &SignalStats, band: NormalBand) -> PrimaryClassification {
    let abrupt_change = stats.deltas.iter().any(|d| *d > IRREGULAR_DELTA);
    if stats.std_dev > IRREGULAR_VARIABILITY || abrupt_change {
        return PrimaryClassification::Irregular;
    }
    if stats.mean < band.low as f64 {
        PrimaryClassification::Bradycardia
    } else if stats.mean > band.high as f64 {
        PrimaryClassification::Tachycardia
    } else {
        PrimaryClassification::Normal
    }
}

pub fn overall_classification(
    primary: PrimaryClassification,
    variability: f64,
) -> OverallClassification {
    if primary == PrimaryClassification::Normal && variability < STABLE_VARIABILITY {
        OverallClassification::Normal
    } else if primary == PrimaryClassification::Irregular || variability > ABNORMAL_VARIABILITY {
        OverallClassification::Abnormal
    } else {
        OverallClassification::Concerning
    }
}

pub fn risk_level(
    primary: PrimaryClassification,
    average: f64,
    variability: f64,
    band: NormalBand,
) -> RiskLevel {
    let severe_deviation = match primary {
        PrimaryClassification::Bradycardia => band.low as f64 - average > SEVERE_BAND_DEVIATION,
        PrimaryClassification::Tachycardia => average - band.high as f64 > SEVERE_BAND_DEVIATION,
        PrimaryClassification::Normal | PrimaryClassification::Irregular => false,
    };

    match primary {
        PrimaryClassification::Normal if variability < STABLE_VARIABILITY => RiskLevel::Low,
        PrimaryClassification::Irregular => RiskLevel::High,
        _ if severe_deviation => RiskLevel::High,
        _ => RiskLevel::Medium,
    }
}

fn recommendations(
    primary: PrimaryClassification,
    risk: RiskLevel,
    maternal_age: Option<i32>,
    duration_minutes: Option<i32>,
) -> Vec<String> {
    let mut out: Vec<String> = match risk {
        RiskLevel::Low => vec!["Continue routine prenatal care and monitoring schedule".into()],
        RiskLevel::Medium => vec![
            "Increase monitoring frequency".into(),
            "Schedule follow-up with healthcare provider within 24-48 hours".into(),
        ],
        RiskLevel::High => vec![
            "Seek urgent evaluation by the obstetric care team".into(),
            "Continuous fetal monitoring recommended until reviewed".into(),
        ],
    };

    match primary {
        PrimaryClassification::Normal => {}
        PrimaryClassification::Bradycardia => {
            out.push(
                "Check maternal position; left lateral positioning may improve fetal oxygenation"
                    .into(),
            );
            out.push("Assess for signs of fetal distress".into());
        }
        PrimaryClassification::Tachycardia => {
            out.push("Check for maternal fever or infection".into());
            out.push("Ensure adequate maternal hydration".into());
        }
        PrimaryClassification::Irregular => {
            out.push("Extended monitoring session recommended to characterise the rhythm".into());
            out.push(
                "Consider further diagnostic evaluation such as fetal echocardiography".into(),
            );
        }
    }

    if duration_minutes.is_some_and(|m| m < SHORT_TRACE_MINUTES) {
        out.push("Repeat monitoring with a trace of at least 20 minutes".into());
    }
    if maternal_age.is_some_and(|age| age >= ADVANCED_MATERNAL_AGE) {
        out.push(
            "Advanced maternal age: follow the enhanced antenatal surveillance schedule".into(),
        );
    }

    out
}

fn base_confidence(sample_count: usize) -> f64 {
    let coverage = sample_count.min(CONFIDENCE_SATURATION_SAMPLES) as f64
        / CONFIDENCE_SATURATION_SAMPLES as f64;
    round2(0.5 + 0.45 * coverage)
}

fn scale_confidence(confidence: f64, mean_quality: f64) -> f64 {
    round2((confidence * mean_quality.clamp(0.0, 1.0)).max(0.5))
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
