// All LLM prompt constants for the insight engine.
// Templates are addressed by the `prompt_template_id` carried in each category policy.

/// System prompt for insight generation. Enforces JSON-only output.
pub const INSIGHT_SYSTEM: &str = "You are a warm, careful behavioral analyst. \
    You write short, specific observations about a person's recent behavior \
    grounded only in the signals you are given. \
    You MUST respond with valid JSON only. \
    Do NOT include any text outside the JSON object. \
    Do NOT use markdown code fences. \
    Do NOT include explanations or apologies.";

/// Output contract shared by every template. Appended after the category framing.
const OUTPUT_CONTRACT: &str = r#"Return a JSON object with this EXACT schema (no extra fields):
{
  "text": "one or two sentences addressed to the user, at most {max_length} characters",
  "confidence": 0.0,
  "evidence": ["short phrase naming a signal from the data that supports the text"]
}

Rules:
- "confidence" is a number between 0 and 1 reflecting how strongly the data supports the text.
- Every evidence item must refer to a field present in the data below.
- If the data is thin, say so gently and lower the confidence. Do NOT invent details.

Data:
{bundle_json}"#;

const EMOTIONAL_V1: &str = "Describe the user's recent emotional tone and any shift in it. \
    Focus on detected mood patterns and how confident the signals are.";

const BEHAVIORAL_V1: &str = "Describe one recurring behavioral routine visible in the user's \
    recent activity, such as timing habits or repeated sequences.";

const SOCIAL_V1: &str = "Describe the user's recent social rhythm: who they engage with, how \
    often, and whether that has changed.";

const PRODUCTIVITY_V1: &str = "Describe when and how the user does their most focused work, \
    based on activity and message volume over the recent period.";

const GROWTH_V1: &str = "Describe one area where the user shows longer-term growth or change \
    across the recent weeks. Prefer durable trends over single events.";

const TEMPLATES: &[(&str, &str)] = &[
    ("insight.emotional.v1", EMOTIONAL_V1),
    ("insight.behavioral.v1", BEHAVIORAL_V1),
    ("insight.social.v1", SOCIAL_V1),
    ("insight.productivity.v1", PRODUCTIVITY_V1),
    ("insight.growth.v1", GROWTH_V1),
];

pub fn template_exists(template_id: &str) -> bool {
    TEMPLATES.iter().any(|(id, _)| *id == template_id)
}

/// Fills the template with the serialized bundle. Returns `None` for unknown ids.
pub fn render_prompt(template_id: &str, bundle_json: &str, max_length: usize) -> Option<String> {
    let framing = TEMPLATES
        .iter()
        .find(|(id, _)| *id == template_id)
        .map(|(_, framing)| *framing)?;

    Some(format!(
        "{framing}\n\n{}",
        OUTPUT_CONTRACT
            .replace("{max_length}", &max_length.to_string())
            .replace("{bundle_json}", bundle_json)
    ))
}
