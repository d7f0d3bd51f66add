//! Terminal output cleanup.
//!
//! Raw bytes read from the terminal carry control sequences (colors, cursor
//! movement, title changes) and a mix of line endings. Everything downstream
//! matches on lines, so it only ever sees the output of [`clean_output`].

use std::borrow::Cow;

use once_cell::sync::Lazy;
use regex::Regex;

/// CSI sequences (incl. private `?` parameters), OSC strings terminated by BEL
/// or ST, charset selection, and single-character escapes.
static ANSI_ESCAPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\x1b\[[0-9;?<=>]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[()][AB012]|\x1b[=>78cDEHMNO]",
    )
    .expect("static ANSI regex is valid")
});

/// One or more carriage returns before a line feed.
static CR_LF: Lazy<Regex> = Lazy::new(|| Regex::new(r"\r+\n").expect("static regex is valid"));

/// Strip control sequences and normalize line endings to `\n`.
///
/// Blank lines are kept: an empty or whitespace-only result is valid.
pub fn clean_output(text: &str) -> String {
    let stripped = ANSI_ESCAPE.replace_all(text, "");
    let unified: Cow<'_, str> = CR_LF.replace_all(&stripped, "\n");
    unified.replace('\r', "\n")
}

/// Decode raw terminal bytes (lossy) and clean them.
pub fn clean_bytes(raw: &[u8]) -> String {
    clean_output(&String::from_utf8_lossy(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_colors_and_cursor_movement() {
        let raw = "\x1b[1;32mok\x1b[0m \x1b[2J\x1b[Hdone\x1b[?25l";
        assert_eq!(clean_output(raw), "ok done");
    }

    #[test]
    fn test_strips_osc_title_sequences() {
        assert_eq!(clean_output("\x1b]0;qemu\x07lona> "), "lona> ");
        assert_eq!(clean_output("\x1b]2;title\x1b\\x"), "x");
    }

    #[test]
    fn test_strips_charset_and_short_escapes() {
        assert_eq!(clean_output("\x1b(Bab\x1b=c\x1b>"), "abc");
    }

    #[test]
    fn test_normalizes_line_endings() {
        assert_eq!(clean_output("a\r\nb\rc\nd"), "a\nb\nc\nd");
        assert_eq!(clean_output("a\r\r\nb"), "a\nb");
    }

    #[test]
    fn test_keeps_blank_lines() {
        assert_eq!(clean_output("a\r\n\r\nb"), "a\n\nb");
        assert_eq!(clean_output("\r\n"), "\n");
        assert_eq!(clean_output(""), "");
    }

    #[test]
    fn test_lossy_bytes() {
        assert_eq!(clean_bytes(b"4\r\n\xfflona> "), "4\n\u{fffd}lona> ");
    }
}
