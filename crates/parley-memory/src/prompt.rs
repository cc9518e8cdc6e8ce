use parley_core::Message;

const RECALL_HEADER: &str = "\n\nRelevant past context:\n";

/// Append recalled passages to the system prompt, one bullet per passage.
pub fn enhance_system_prompt(base_prompt: &str, recalled: &[Message]) -> String {
    let passages: Vec<&str> = recalled
        .iter()
        .map(|m| m.content.trim())
        .filter(|c| !c.is_empty())
        .collect();

    if passages.is_empty() {
        return base_prompt.to_string();
    }

    let mut prompt = base_prompt.to_string();
    prompt.push_str(RECALL_HEADER);
    for (i, passage) in passages.iter().enumerate() {
        if i > 0 {
            prompt.push('\n');
        }
        prompt.push_str("- ");
        prompt.push_str(passage);
    }
    prompt
}
