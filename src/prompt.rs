//! Prompt assembly for grounded generation.
//!
//! These are pure functions over already-retrieved results so the exact
//! text sent to the model can be tested without an index or a network.

use crate::{chat::ChatMessage, retriever::RetrievalResult};

/// Stands in for an empty conversation history.
pub const NO_HISTORY: &str = "none";

/// Stands in for an empty retrieval so the model is told, not left guessing.
pub const NO_CONTEXT: &str = "No supporting records were retrieved for this question.";

/// System prompt used by [`crate::retriever::RagRetriever::ask`].
pub const ASK_SYSTEM_PROMPT: &str = "You are a security analyst assistant. \
Answer questions about CVE and CWE records using the supplied context.";

const GROUNDING_INSTRUCTION: &str = "Answer using only the retrieved context \
above. Cite sources by their number. If the context does not contain the \
answer, say so.";

/// Flatten history into `role: content` lines, or [`NO_HISTORY`].
pub fn serialize_history(history: &[ChatMessage]) -> String {
    if history.is_empty() {
        return NO_HISTORY.to_string();
    }
    history
        .iter()
        .map(|turn| format!("{}: {}", turn.role, turn.content))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Most readable label for a result: record id, then year, then position.
///
/// `position` is 1-based.
pub fn source_label(result: &RetrievalResult, position: usize) -> String {
    if let Some(id) = result.metadata.record_id.as_deref().filter(|id| !id.is_empty()) {
        return id.to_string();
    }
    if let Some(year) = result.metadata.year {
        return year.to_string();
    }
    format!("doc-{position}")
}

/// Render results as numbered, labeled context blocks.
pub fn format_context(results: &[RetrievalResult]) -> String {
    if results.is_empty() {
        return NO_CONTEXT.to_string();
    }
    results
        .iter()
        .enumerate()
        .map(|(i, result)| {
            let position = i + 1;
            format!(
                "[Source {position}: {} | score={:.3}]\n{}",
                source_label(result, position),
                result.score,
                result.text
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// The two messages sent to the chat model for one question.
pub fn build_messages(
    system_prompt: &str,
    user_prompt: &str,
    history: &str,
    context: &str,
) -> Vec<ChatMessage> {
    let user = format!(
        "Conversation history:\n{history}\n\n\
         Retrieved context:\n{context}\n\n\
         Question:\n{user_prompt}\n\n\
         {GROUNDING_INSTRUCTION}"
    );
    vec![ChatMessage::system(system_prompt), ChatMessage::user(user)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{chat::Role, metadata::RecordMetadata};

    fn result(record_id: Option<&str>, year: Option<i32>, score: f32) -> RetrievalResult {
        RetrievalResult {
            id: record_id.unwrap_or("#abc").to_string(),
            text: "{\"cveId\":\"x\"}".to_string(),
            score,
            metadata: RecordMetadata {
                record_id: record_id.map(str::to_string),
                year,
                ..Default::default()
            },
        }
    }

    #[test]
    fn empty_history_is_none_marker() {
        assert_eq!(serialize_history(&[]), "none");
    }

    #[test]
    fn history_is_one_line_per_turn() {
        let history = [
            ChatMessage::assistant("initial report"),
            ChatMessage::user("what about 2023?"),
        ];
        assert_eq!(
            serialize_history(&history),
            "assistant: initial report\nuser: what about 2023?"
        );
    }

    #[test]
    fn labels_prefer_record_id_then_year_then_position() {
        assert_eq!(source_label(&result(Some("CVE-2023-1"), Some(2023), 0.0), 1), "CVE-2023-1");
        assert_eq!(source_label(&result(None, Some(2021), 0.0), 2), "2021");
        assert_eq!(source_label(&result(None, None, 0.0), 3), "doc-3");
    }

    #[test]
    fn context_blocks_carry_label_and_score() {
        let context = format_context(&[
            result(Some("CVE-2023-1"), None, 0.12345),
            result(None, None, 1.0),
        ]);
        let blocks: Vec<_> = context.split("\n\n").collect();
        assert_eq!(blocks.len(), 2);
        assert!(blocks[0].starts_with("[Source 1: CVE-2023-1 | score=0.123]\n"));
        assert!(blocks[1].starts_with("[Source 2: doc-2 | score=1.000]\n"));
    }

    #[test]
    fn empty_context_is_explicit() {
        assert_eq!(format_context(&[]), NO_CONTEXT);
    }

    #[test]
    fn messages_combine_all_sections() {
        let messages = build_messages("sys", "Which vendors?", "none", "[Source 1: a]");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[0].content, "sys");

        let user = &messages[1].content;
        let history_at = user.find("Conversation history:\nnone").unwrap();
        let context_at = user.find("Retrieved context:\n[Source 1: a]").unwrap();
        let question_at = user.find("Question:\nWhich vendors?").unwrap();
        assert!(history_at < context_at && context_at < question_at);
        assert!(user.ends_with(GROUNDING_INSTRUCTION));
    }
}
