use super::types::{AnalysisResult, Diagnosis};

/// Confidence (percent) below which a diagnosis is withheld.
pub const CONFIDENCE_THRESHOLD: f64 = 70.0;

/// Parse a percentage such as "85%", " 65.5 % " or "70".
///
/// Reads the leading numeric prefix only; text with no leading number yields `None`.
pub fn parse_confidence(text: &str) -> Option<f64> {
    let trimmed = text.trim_start();
    let end = trimmed
        .char_indices()
        .find(|&(i, c)| !(c.is_ascii_digit() || c == '.' || (i == 0 && (c == '-' || c == '+'))))
        .map(|(i, _)| i)
        .unwrap_or(trimmed.len());

    trimmed[..end].parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Withhold low-confidence diagnoses.
///
/// When the parsed confidence is strictly below [`CONFIDENCE_THRESHOLD`], the
/// diagnosis becomes [`Diagnosis::RequiresFurtherReview`] and a disclosure
/// naming the original diagnosis is prepended to the uncertainty statement.
/// The original diagnosis survives only inside that text.
pub fn apply_confidence_gate(mut result: AnalysisResult) -> AnalysisResult {
    let Some(value) = parse_confidence(&result.confidence) else {
        return result;
    };
    if value >= CONFIDENCE_THRESHOLD || result.diagnosis == Diagnosis::RequiresFurtherReview {
        return result;
    }

    let original = result.diagnosis;
    tracing::info!(
        confidence = %result.confidence,
        original = original.as_str(),
        "Confidence below threshold, withholding diagnosis"
    );

    result.uncertainty_statement = format!(
        "LOW CONFIDENCE ALERT: model confidence ({}) is below the {}% threshold. \
         The preliminary finding was \"{}\" and has been withheld pending specialist review. {}",
        result.confidence.trim(),
        CONFIDENCE_THRESHOLD,
        original.as_str(),
        result.uncertainty_statement
    );
    result.diagnosis = Diagnosis::RequiresFurtherReview;
    result
}
