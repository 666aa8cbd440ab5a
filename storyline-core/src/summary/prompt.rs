//! Prompt construction for summary generation.

use crate::config::GenerationSettings;
use storyline_llm::{GenerationRequest, Message};

/// Build the request that asks the generator to summarize a slice.
///
/// `existing` is the rendered summary so far, `slice` the rendered
/// transcript entries to fold in.
pub fn build_summary_request(
    existing: &str,
    slice: &str,
    next_event_id: &str,
    settings: &GenerationSettings,
) -> GenerationRequest {
    let mut user = String::new();

    user.push_str("## Summary So Far\n");
    if existing.trim().is_empty() {
        user.push_str("(nothing summarized yet)\n");
    } else {
        user.push_str(existing.trim());
        user.push('\n');
    }

    user.push_str("\n## New Transcript Slice\n");
    user.push_str(slice.trim_end());
    user.push('\n');

    user.push_str(&format!("\nThe next event id is {next_event_id}.\n"));
    user.push_str("Respond with the JSON object only.");

    let mut request = GenerationRequest::new(vec![Message::user(user)])
        .with_system(include_str!("prompts/summarize.txt"))
        .with_max_tokens(settings.max_tokens);

    if let Some(model) = &settings.model {
        request = request.with_model(model.clone());
    }
    if let Some(temperature) = settings.temperature {
        request = request.with_temperature(temperature);
    }

    request
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_carries_summary_slice_and_next_id() {
        let settings = GenerationSettings {
            model: Some("small".to_string()),
            max_tokens: 512,
            temperature: Some(0.1),
        };
        let request =
            build_summary_request("## Keywords\nharbor", "[#5] Mira: Hello\n", "evt-3", &settings);

        let text = request.last_user_text().unwrap();
        assert!(text.contains("## Keywords\nharbor"));
        assert!(text.contains("[#5] Mira: Hello"));
        assert!(text.contains("evt-3"));
        assert_eq!(request.model.as_deref(), Some("small"));
        assert_eq!(request.max_tokens, 512);
        assert_eq!(request.temperature, Some(0.1));
        assert!(request.system.unwrap().contains("newRelationships"));
    }

    #[test]
    fn test_request_marks_empty_summary() {
        let request =
            build_summary_request("", "[#0] User: hi\n", "evt-1", &GenerationSettings::default());
        assert!(request
            .last_user_text()
            .unwrap()
            .contains("(nothing summarized yet)"));
        assert_eq!(request.model, None);
    }
}
