//! Prompt templates with `[name]` placeholders.
//!
//! Templates are plain strings; [`fill`] substitutes the provided pairs and
//! leaves unknown tokens alone, so a missing value shows up verbatim in the
//! prompt instead of vanishing silently. System prompts embed the JSON reply
//! schema the pipelines parse with [`super::parse_reply`].

/// Reply schema for the summarize pipeline, quoted inside prompts.
pub const SUMMARY_SCHEMA: &str = r#"{"summary": "your summary", "score": "score you give your summary (max 100)", "thinking": "your own thoughts", "if_no_need_summary": "is a summary pointless? fill boolean"}"#;

/// Reply schema for the answer pipeline.
pub const ANSWER_SCHEMA: &str = r#"{"answer": "your answer", "score": "your self-assessed quality rating of the answer (0-100)"}"#;

pub const SUMMARY_SYSTEM: &str = concat!(
    "You are a content summarizer. Summarize a piece of content from its ",
    "title, description, tags, transcript and comments. Guidelines:\n",
    "1. The reply strictly follows this JSON format: [schema]\n",
    "2. Be complete and dense with information.\n",
    "3. Be accurate, do not invent details.\n",
    "4. Keep the tone light and conversational, skip the formalities.\n",
    "5. Ignore tags and comments unrelated to the content itself.\n",
    "6. Break long summaries into paragraphs.\n",
    "7. The value of 'score' must be written as a string.\n",
    "8. In 'thinking', set the guidelines above aside and give your own ",
    "independent take rather than restating the content.\n",
    "9. If the content is meaningless, set 'if_no_need_summary' true and ",
    "leave the other fields empty; otherwise set it false.\n",
    "10. Only pure JSON content with double quotes is allowed!"
);

pub const SUMMARY_USER: &str = concat!(
    "Title: [title]\n\n",
    "Description: [description]\n\n",
    "Transcript: [transcript]\n\n",
    "Tags: [tags]\n\n",
    "Comments: [comments]"
);

/// One-shot re-prompt after an unparseable summarize reply.
pub const SUMMARY_REFORMAT: &str = concat!(
    "Convert the text below into this JSON format and return it without ",
    "adding anything else. If the 'summary' field does not exist, set ",
    "'if_no_need_summary' to true. Any other missing field is left blank ",
    "and 'if_no_need_summary' stays false.\n\n",
    "Standard JSON format: [schema]\n\n",
    "My content: [input]"
);

pub const ANSWER_SYSTEM: &str = concat!(
    "You answer questions about a piece of content. I will provide the ",
    "title, description and transcript. Based on that material and your ",
    "own expertise, respond to the user's question in a lively manner, ",
    "using metaphors and examples when they help.\n\n",
    "Please reply in the following JSON format: [schema]\n\n",
    "Only pure JSON content with double quotes is allowed! Do not add ",
    "anything else!"
);

pub const ANSWER_USER: &str = concat!(
    "Title: [title]\n\n",
    "Description: [description]\n\n",
    "Transcript: [transcript]\n\n",
    "Question: [question]"
);

/// One-shot re-prompt after an unparseable answer reply.
pub const ANSWER_REFORMAT: &str = concat!(
    "Convert the text below into this JSON format and return it without ",
    "adding anything else. Any missing field is left blank.\n\n",
    "Standard JSON format: [schema]\n\n",
    "My content: [input]"
);

/// Cleanup pass over machine transcription before it is fed to a prompt.
pub const TRANSCRIPT_TOUCH_UP: &str = concat!(
    "Below is a transcript obtained through speech-to-text. Correct any ",
    "grammatical errors and mis-transcribed nouns, and keep the wording ",
    "otherwise unchanged:\n\n[transcript]"
);

/// Substitute `[key]` tokens. Unknown tokens stay in place.
pub fn fill(template: &str, values: &[(&str, &str)]) -> String {
    let mut rendered = template.to_string();
    for (key, value) in values {
        rendered = rendered.replace(&format!("[{key}]"), value);
    }
    rendered
}

pub fn summary_system() -> String {
    fill(SUMMARY_SYSTEM, &[("schema", SUMMARY_SCHEMA)])
}

pub fn summary_reformat(input: &str) -> String {
    fill(
        SUMMARY_REFORMAT,
        &[("schema", SUMMARY_SCHEMA), ("input", input)],
    )
}

pub fn answer_system() -> String {
    fill(ANSWER_SYSTEM, &[("schema", ANSWER_SCHEMA)])
}

pub fn answer_reformat(input: &str) -> String {
    fill(
        ANSWER_REFORMAT,
        &[("schema", ANSWER_SCHEMA), ("input", input)],
    )
}

pub fn transcript_touch_up(transcript: &str) -> String {
    fill(TRANSCRIPT_TOUCH_UP, &[("transcript", transcript)])
}
