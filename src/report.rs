use std::fmt::Write;
use std::ops::RangeInclusive;

use crate::models::MonitoringRecord;
use crate::stats::SignalStats;

pub fn build_report(
    record: &MonitoringRecord,
    patient_name: &str,
    shared_with_name: Option<&str>,
    bounds: &RangeInclusive<i32>,
) -> String {
    let bpm: Vec<i32> = record.samples.iter().map(|s| s.bpm).collect();
    let mut output = String::new();

    let _ = writeln!(output, "# Fetal Heart Rate Session Report");
    let _ = writeln!(
        output,
        "Patient {} ({} session started {})",
        patient_name,
        record.source,
        record.start_time.format("%Y-%m-%d %H:%M UTC")
    );
    if let Some(end) = record.end_time {
        let minutes = (end - record.start_time).num_minutes();
        let _ = writeln!(output, "Duration: {minutes} min");
    }
    let _ = writeln!(output);
    let _ = writeln!(output, "## Signal Summary");

    match SignalStats::compute(&bpm, bounds) {
        Ok(stats) => {
            let _ = writeln!(output, "- Samples: {}", stats.count);
            let _ = writeln!(output, "- Range: {}-{} BPM", stats.min, stats.max);
            let _ = writeln!(output, "- Mean: {:.1} BPM", stats.mean);
            let _ = writeln!(output, "- Variability (stdev): {:.1} BPM", stats.std_dev);
            let _ = writeln!(output, "- Largest beat-to-beat change: {} BPM", stats.max_delta());
            if stats.out_of_range > 0 {
                let _ = writeln!(
                    output,
                    "- Outside physiological range: {} sample(s)",
                    stats.out_of_range
                );
            }
        }
        Err(_) => {
            let _ = writeln!(output, "No samples recorded for this session.");
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Classification");

    match &record.result {
        Some(result) => {
            let _ = writeln!(
                output,
                "- {} (overall {}, risk {}, confidence {:.2})",
                result.primary_classification,
                result.overall_classification,
                result.risk_level,
                result.confidence
            );
            let _ = writeln!(output);
            let _ = writeln!(output, "## Findings");
            for finding in &result.findings {
                let _ = writeln!(output, "- {finding}");
            }
            let _ = writeln!(output);
            let _ = writeln!(output, "## Recommendations");
            for recommendation in &result.recommendations {
                let _ = writeln!(output, "- {recommendation}");
            }
        }
        None if record.classification.is_empty() => {
            let _ = writeln!(output, "Not classified.");
        }
        None => {
            let _ = writeln!(output, "- {} (recorded label)", record.classification);
        }
    }

    if !record.notes.is_empty() {
        let _ = writeln!(output);
        let _ = writeln!(output, "## Notes");
        let _ = writeln!(output, "{}", record.notes);
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Sharing");
    match shared_with_name {
        Some(name) => {
            let _ = writeln!(output, "Shared with {name}.");
        }
        None => {
            let _ = writeln!(output, "Not shared.");
        }
    }

    output
}
