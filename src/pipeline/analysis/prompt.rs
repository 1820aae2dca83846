//! Prompts and response schema for the four remote calls.

use serde_json::{json, Value};

use super::types::Diagnosis;

pub const SEGMENTATION_PROMPT: &str = "\
Generate a segmentation map of this retinal image. Overlay distinct, saturated colors on: \
intraretinal and subretinal fluid (blue), drusen deposits (yellow), regions of geographic \
atrophy (red) and the retinal pigment epithelium boundary (green). Keep the original image \
visible underneath. Do not add labels, legends or text.";

pub const SEGMENTATION_UNCERTAINTY_PROMPT: &str = "\
Generate a segmentation uncertainty map of this retinal image. Shade each region by how \
ambiguous its tissue boundary is: confident boundaries dark, ambiguous or low-contrast \
boundaries bright. Keep anatomy recognizable. Do not add labels, legends or text.";

const HEATMAP_GENERIC_PROMPT: &str = "\
Generate an attention heatmap over this retinal image highlighting the regions most relevant \
to detecting pathology (fluid, drusen, atrophy, neovascular membranes). Use a warm-to-cool \
color scale with the hottest colors on the most diagnostically relevant areas. Keep the \
original image visible underneath. Do not add labels, legends or text.";

const CLASSIFICATION_PREAMBLE: &str = "\
You are an expert retinal specialist reviewing a single retinal image.";

const DIFFERENTIAL_PROCEDURE: &str = "\
Follow this differential-diagnosis procedure strictly:
1. First decide whether intraretinal or subretinal fluid, or a neovascular membrane, is present.
2. If fluid is present, the diagnosis is \"Wet AMD (CNV)\".
3. If no fluid is present, decide between the dry-category findings: \"Drusen (Dry AMD)\" when \
drusen deposits are the dominant finding, \"Geographic Atrophy (Dry AMD)\" when there is sharply \
demarcated loss of the retinal pigment epithelium.
4. If neither fluid nor dry-category findings are present, the diagnosis is \"Normal\".";

const ANTI_FABRICATION: &str = "\
Describe only what is visible in this image. Never invent findings, measurements, patient \
history or prior examinations. If the image is not a retinal image or is too degraded to \
assess, say so in the explanation and report a low confidence.";

const OUTPUT_INSTRUCTIONS: &str = "\
Report confidence as a percentage string such as \"85%\". Explain the decision in \
\"explanation\", describe which image regions drove it in \"explainability\", state overall \
diagnostic uncertainty in \"uncertaintyStatement\" and boundary ambiguity in \
\"segmentationUncertaintyStatement\". Use \"anomalyReport\" only for incidental findings \
outside the differential.";

/// Classification prompt with the correlation id embedded for verbatim echo.
pub fn classification_prompt(correlation_id: Option<&str>) -> String {
    let choices = Diagnosis::model_choices()
        .iter()
        .map(|d| format!("\"{}\"", d.as_str()))
        .collect::<Vec<_>>()
        .join(", ");

    let echo = match correlation_id {
        Some(id) => format!(
            "REQUEST ID: {id}\nCopy this request id verbatim into the \"processedId\" field. \
             Do not alter, abbreviate or regenerate it."
        ),
        None => "Set \"processedId\" to an empty string.".to_string(),
    };

    format!(
        "{CLASSIFICATION_PREAMBLE}\n\n{echo}\n\n{DIFFERENTIAL_PROCEDURE}\n\nChoose exactly one \
         diagnosis from: {choices}.\n\n{ANTI_FABRICATION}\n\n{OUTPUT_INSTRUCTIONS}"
    )
}

/// Heatmap prompt, focused on the refinement text when one is given.
pub fn heatmap_prompt(refinement: Option<&str>) -> String {
    match refinement {
        Some(focus) => format!(
            "Generate an attention heatmap over this retinal image focused specifically on: \
             {focus}. Use a warm-to-cool color scale with the hottest colors on the regions \
             matching that focus. Keep the original image visible underneath. Do not add \
             labels, legends or text."
        ),
        None => HEATMAP_GENERIC_PROMPT.to_string(),
    }
}

/// Response schema constraining the classification output.
pub fn classification_schema() -> Value {
    let choices: Vec<&str> = Diagnosis::model_choices().iter().map(|d| d.as_str()).collect();
    json!({
        "type": "OBJECT",
        "properties": {
            "diagnosis": { "type": "STRING", "enum": choices },
            "confidence": { "type": "STRING" },
            "explanation": { "type": "STRING" },
            "explainability": { "type": "STRING" },
            "uncertaintyStatement": { "type": "STRING" },
            "segmentationUncertaintyStatement": { "type": "STRING" },
            "anomalyReport": { "type": "STRING" },
            "processedId": { "type": "STRING" }
        },
        "required": [
            "diagnosis",
            "confidence",
            "explanation",
            "explainability",
            "uncertaintyStatement",
            "segmentationUncertaintyStatement",
            "processedId"
        ]
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_prompt_embeds_correlation_id() {
        let prompt = classification_prompt(Some("item-42"));
        assert!(prompt.contains("REQUEST ID: item-42"));
        assert!(prompt.contains("processedId"));
    }

    #[test]
    fn classification_prompt_encodes_differential() {
        let prompt = classification_prompt(None);
        assert!(prompt.contains("If fluid is present"));
        assert!(prompt.contains("Never invent findings"));
        assert!(!prompt.contains("Requires Further Review"));
    }

    #[test]
    fn heatmap_prompt_focuses_refinement() {
        assert!(heatmap_prompt(Some("temporal drusen")).contains("temporal drusen"));
        assert_eq!(heatmap_prompt(None), HEATMAP_GENERIC_PROMPT);
    }

    #[test]
    fn schema_requires_processed_id() {
        let schema = classification_schema();
        let required: Vec<&str> = schema["required"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|v| v.as_str())
            .collect();
        assert!(required.contains(&"processedId"));
        assert!(!required.contains(&"anomalyReport"));
        assert_eq!(schema["properties"]["diagnosis"]["enum"].as_array().unwrap().len(), 4);
    }
}
