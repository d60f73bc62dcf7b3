//! Word-bounded sliding-window splitting of document text.
//!
//! Windows are `window` words long and advance by `window - overlap` words,
//! so adjacent passages share `overlap` words of context. Inline page markers
//! of the form `--- Page N ---` are tracked while scanning; each window
//! inherits the page of the marker most recently seen by its end.

/// Default window size in words.
pub const DEFAULT_WINDOW_WORDS: usize = 500;
/// Default overlap between adjacent windows in words.
pub const DEFAULT_OVERLAP_WORDS: usize = 50;

/// One window of document text plus its inherited page number, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextWindow {
    pub text: String,
    pub page: Option<u32>,
}

/// Split `text` into overlapping word windows.
///
/// The trailing window may be shorter than `window`; windows that are empty
/// after trimming are skipped. `overlap` must be smaller than `window`.
pub fn split_windows(text: &str, window: usize, overlap: usize) -> Vec<TextWindow> {
    debug_assert!(window > 0 && overlap < window);
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() {
        return Vec::new();
    }

    let pages = page_at_word(&words);
    let stride = window - overlap;
    let mut out = Vec::new();
    let mut start = 0;
    while start < words.len() {
        let end = (start + window).min(words.len());
        let body = words[start..end].join(" ");
        if !body.trim().is_empty() {
            out.push(TextWindow {
                text: body,
                page: pages[end - 1],
            });
        }
        if end == words.len() {
            break;
        }
        start += stride;
    }
    out
}

/// For each word index, the page of the most recent `--- Page N ---` marker
/// at or before it. All entries are `None` when the text has no markers.
fn page_at_word(words: &[&str]) -> Vec<Option<u32>> {
    let mut pages = vec![None; words.len()];
    let mut current = None;
    for i in 0..words.len() {
        if words[i] == "---"
            && words.get(i + 1).copied() == Some("Page")
            && words.get(i + 3).copied() == Some("---")
        {
            if let Some(n) = words.get(i + 2).and_then(|w| w.parse::<u32>().ok()) {
                current = Some(n);
            }
        }
        pages[i] = current;
    }
    pages
}
