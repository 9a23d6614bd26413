const TITLE_CHARS: usize = 32;
const SUMMARY_CHARS: usize = 80;

pub const ROOT_TITLE: &str = "Root";
pub const FALLBACK_TITLE: &str = "Prompt";
pub const EMPTY_SUMMARY: &str = "Awaiting prompt";

pub fn title_for_prompt(prompt: Option<&str>) -> String {
    match prompt.map(str::trim).filter(|prompt| !prompt.is_empty()) {
        Some(prompt) => prompt.chars().take(TITLE_CHARS).collect(),
        None => FALLBACK_TITLE.to_string(),
    }
}

/// Whitespace-collapsed preview with an ellipsis when cut.
pub fn summarize(text: Option<&str>) -> String {
    let collapsed = text
        .unwrap_or_default()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    if collapsed.is_empty() {
        return EMPTY_SUMMARY.to_string();
    }

    let mut chars = collapsed.chars();
    let head = chars.by_ref().take(SUMMARY_CHARS).collect::<String>();
    if chars.next().is_some() {
        format!("{head}…")
    } else {
        head
    }
}

pub fn fork_title(title: &str) -> String {
    format!("{title} (fork)")
}
