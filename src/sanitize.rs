//! Cleanup of raw model output into plain LaTeX.
//!
//! Vision-language models wrap answers in code fences, emit whole documents
//! with preambles, bold every heading and loop on the same line when decoding
//! greedily. The steps below undo those habits without touching the content.

use std::borrow::Cow;
use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;

/// Lines whose whitespace-free form is at most this long are never dropped
/// as repetitions.
pub const DEFAULT_MIN_DEDUP_KEY_LEN: usize = 10;

static RE_CODE_FENCE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)```(?:latex)?").unwrap());
static RE_TEXTBF: Lazy<Regex> = Lazy::new(|| Regex::new(r"\\textbf\{([^{}]*)\}").unwrap());
static RE_PREAMBLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)\\documentclass.*?\\begin\{document\}").unwrap());
static RE_END_DOCUMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\\end\{document\}").unwrap());
static RE_MATHRM: Lazy<Regex> = Lazy::new(|| Regex::new(r"\\mathrm").unwrap());

#[derive(Debug, Clone)]
pub struct Sanitizer {
    pub min_dedup_key_len: usize,
    /// Upper bound on `\textbf` unwrap rounds within one pass.
    pub max_unwrap_rounds: usize,
}

impl Default for Sanitizer {
    fn default() -> Self {
        Self {
            min_dedup_key_len: DEFAULT_MIN_DEDUP_KEY_LEN,
            max_unwrap_rounds: 64,
        }
    }
}

impl Sanitizer {
    pub fn new(min_dedup_key_len: usize) -> Self {
        Self {
            min_dedup_key_len,
            ..Self::default()
        }
    }

    /// Run the cleanup pipeline until the text stops changing.
    ///
    /// A pass only ever deletes or shortens text, so a pass that changes its
    /// input strictly reduces the length: the loop runs at most `text.len()`
    /// extra passes.
    pub fn sanitize(&self, text: &str) -> String {
        let mut current = self.sanitize_once(text);
        loop {
            let next = self.sanitize_once(&current);
            if next.len() >= current.len() {
                return current;
            }
            current = next;
        }
    }

    /// One pass of the pipeline. Step order matters: preamble detection
    /// expects fences and bold wrappers to be gone already.
    pub fn sanitize_once(&self, text: &str) -> String {
        let text = strip_code_fences(text);
        let text = unwrap_textbf(&text, self.max_unwrap_rounds);
        let text = strip_preamble(&text);
        let text = strip_end_document(&text);
        let text = rename_mathrm(&text);
        let text = suppress_repetitions(&text, self.min_dedup_key_len);
        text.trim().to_string()
    }
}

/// Sanitize with the default thresholds.
pub fn sanitize(text: &str) -> String {
    Sanitizer::default().sanitize(text)
}

pub fn strip_code_fences(text: &str) -> String {
    RE_CODE_FENCE.replace_all(text, "").trim().to_string()
}

/// Replace innermost `\textbf{...}` with its content until none is left or
/// `max_rounds` is reached.
pub fn unwrap_textbf(text: &str, max_rounds: usize) -> String {
    let mut current = text.to_string();
    for _ in 0..max_rounds {
        let next = match RE_TEXTBF.replace_all(&current, "${1}") {
            Cow::Borrowed(_) => break,
            Cow::Owned(next) => next,
        };
        current = next;
    }
    current
}

pub fn strip_preamble(text: &str) -> String {
    RE_PREAMBLE.replace_all(text, "").into_owned()
}

pub fn strip_end_document(text: &str) -> String {
    RE_END_DOCUMENT.replace_all(text, "").into_owned()
}

pub fn rename_mathrm(text: &str) -> String {
    RE_MATHRM.replace_all(text, r"\text").into_owned()
}

/// Drop lines that repeat an earlier line once whitespace is ignored.
/// Short lines (`\\`, `\hline`, blank) are kept even when repeated.
pub fn suppress_repetitions(text: &str, min_key_len: usize) -> String {
    let mut seen: HashSet<String> = HashSet::new();
    let mut kept: Vec<&str> = Vec::new();

    for line in text.lines() {
        let key: String = line.chars().filter(|c| !c.is_whitespace()).collect();
        if key.chars().count() > min_key_len && seen.contains(&key) {
            continue;
        }
        seen.insert(key);
        kept.push(line);
    }

    kept.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_latex_fences() {
        assert_eq!(sanitize("```latex\nfoo\n```"), "foo");
        assert_eq!(sanitize("```LaTeX\n$x$\n```"), "$x$");
        assert_eq!(sanitize("```\nplain\n```"), "plain");
    }

    #[test]
    fn unwraps_nested_bold() {
        assert_eq!(sanitize(r"\textbf{\textbf{a}}"), "a");
        assert_eq!(
            sanitize(r"\textbf{Theorem \textbf{1}.} Let $x$"),
            "Theorem 1. Let $x$"
        );
    }

    #[test]
    fn bold_with_inner_braces_is_left_alone() {
        assert_eq!(sanitize(r"\textbf{$x^{2}$}"), r"\textbf{$x^{2}$}");
    }

    #[test]
    fn unwrap_respects_round_bound() {
        let nested = r"\textbf{\textbf{\textbf{a}}}";
        assert_eq!(unwrap_textbf(nested, 1), r"\textbf{\textbf{a}}");
        assert_eq!(unwrap_textbf(nested, 0), nested);
    }

    #[test]
    fn strips_document_wrapper() {
        assert_eq!(
            sanitize(r"\documentclass{article}\begin{document}X\end{document}"),
            "X"
        );
    }

    #[test]
    fn preamble_match_is_non_greedy() {
        let text = "\\documentclass{article}\n\\usepackage{amsmath}\n\\begin{document}\nA\n\\begin{document}\nB";
        assert_eq!(strip_preamble(text), "\nA\n\\begin{document}\nB");
    }

    #[test]
    fn renames_mathrm() {
        assert_eq!(sanitize(r"\mathrm{X}"), r"\text{X}");
        assert_eq!(sanitize(r"$\mathrm{d}x$"), r"$\text{d}x$");
    }

    #[test]
    fn drops_long_repeated_lines_only() {
        let text = "abcdefghijk\nxx\nabcdefghijk\nxx";
        assert_eq!(sanitize(text), "abcdefghijk\nxx\nxx");
    }

    #[test]
    fn repetition_key_ignores_whitespace() {
        let text = "x = a + b + c + d + e\n  x=a+b+c+d+e  \nend";
        assert_eq!(suppress_repetitions(text, 10), "x = a + b + c + d + e\nend");
    }

    #[test]
    fn key_of_exactly_threshold_length_is_kept() {
        let text = "abcdefghij\nabcdefghij";
        assert_eq!(suppress_repetitions(text, 10), text);
    }

    #[test]
    fn blank_lines_survive_deduplication() {
        let text = "first paragraph line\n\nsecond paragraph\n\nthird";
        assert_eq!(sanitize(text), text);
    }

    #[test]
    fn threshold_is_configurable() {
        let sanitizer = Sanitizer::new(2);
        assert_eq!(sanitizer.sanitize("abc\nabc\nab\nab"), "abc\nab\nab");
    }

    #[test]
    fn full_pipeline_on_typical_output() {
        let raw = "```latex\n\\documentclass{article}\n\\usepackage{amsmath}\n\\begin{document}\n\\textbf{Problem 1.} Compute $\\mathrm{tr}(A)$.\nThe matrix is given below.\nThe matrix is given below.\n\\end{document}\n```";
        assert_eq!(
            sanitize(raw),
            "Problem 1. Compute $\\text{tr}(A)$.\nThe matrix is given below."
        );
    }

    #[test]
    fn reaches_fixed_point_when_steps_expose_patterns() {
        let raw = r"\textbf{a\end{document}} and \end{\end{document}document}";
        let once = sanitize(raw);
        assert_eq!(once, "a and");
        assert_eq!(sanitize(&once), once);
    }

    #[test]
    fn idempotent_on_assorted_inputs() {
        let inputs = [
            "",
            "   ",
            "```",
            "``\\textbf{`}`",
            "\\textbf{\\textbf{\\textbf{deep}}}",
            "line one is long\nline one is long\n\\mathrm{m}\n\n\n",
            "\\documentclass{a}\\begin{document}\\documentclass{b}\\begin{document}x",
            "unterminated \\textbf{ brace\n\\end{document",
        ];
        for input in inputs {
            let once = sanitize(input);
            assert_eq!(sanitize(&once), once, "input: {input:?}");
        }
    }

    #[test]
    fn deeply_nested_markers_are_fully_removed() {
        let depth = 40;
        let end_document = format!("{}{}", "\\end{".repeat(depth), "document}".repeat(depth));

        let once = sanitize(&format!("x{end_document}"));
        assert_eq!(once, "x");
        assert_eq!(sanitize(&once), once);

        // The fence only appears after every `\end{document}` layer is gone.
        let fenced = sanitize(&format!("x ``{end_document}`"));
        assert_eq!(fenced, "x");

        let preamble = format!(
            "x{}{}",
            "\\document".repeat(depth),
            "class\\begin{document}".repeat(depth)
        );
        assert_eq!(sanitize(&preamble), "x");
    }

    #[test]
    fn malformed_fragments_pass_through() {
        assert_eq!(sanitize(r"\frac{1}{2"), r"\frac{1}{2");
    }
}
