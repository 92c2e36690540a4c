/// Default upstream model when the inbound name has no mapping.
pub const DEFAULT_UPSTREAM_MODEL: &str = "gemini-2.0-flash";

/// Fixed inbound-alias → upstream-model table.
const MODEL_TABLE: &[(&str, &str)] = &[
    ("gpt-4o", "gemini-2.0-flash"),
    ("gpt-4o-mini", "gemini-2.0-flash-lite"),
    ("gpt-4", "gemini-1.5-pro"),
    ("gpt-4-turbo", "gemini-1.5-pro"),
    ("gpt-3.5-turbo", "gemini-1.5-flash"),
];

/// Resolve the upstream model for an inbound request. Names already in the
/// Gemini family pass through unchanged; unknown names fall to the default.
pub fn to_upstream_model(inbound: &str) -> &str {
    if let Some((_, upstream)) = MODEL_TABLE.iter().find(|(alias, _)| *alias == inbound) {
        return upstream;
    }
    if inbound.starts_with("gemini-") {
        return inbound;
    }
    DEFAULT_UPSTREAM_MODEL
}

/// Reverse lookup used when shaping responses: maps an upstream model name
/// back to its first inbound alias, leaving the name unchanged when no
/// mapping exists.
pub fn to_inbound_model(model: &str) -> &str {
    MODEL_TABLE
        .iter()
        .find(|(_, upstream)| *upstream == model)
        .map(|(alias, _)| *alias)
        .unwrap_or(model)
}
