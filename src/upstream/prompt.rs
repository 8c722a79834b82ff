//! Prompt rendering for single-turn chat requests.

/// Renders a user message, with an optional system preamble, into the
/// plain-text prompt sent to `/completion`.
pub fn build_prompt(system: Option<&str>, message: &str) -> String {
    let mut prompt = String::new();
    if let Some(system) = system.map(str::trim).filter(|s| !s.is_empty()) {
        prompt.push_str(system);
        prompt.push_str("\n\n");
    }
    prompt.push_str("User: ");
    prompt.push_str(message.trim());
    prompt.push_str("\nAssistant:");
    prompt
}
