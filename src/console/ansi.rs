//! ANSI escape code handling for console output.
//!
//! Router consoles paint prompts with colors and cursor movement. Prompt
//! matching runs on text with those sequences removed.

/// Where the stripper is inside an escape sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Esc {
    /// Plain text.
    Text,
    /// Just saw ESC.
    Start,
    /// `ESC [` ... final byte 0x40-0x7E.
    Csi,
    /// `ESC ]` or `ESC P` ... terminated by BEL or `ESC \`.
    String,
    /// ESC seen inside a string sequence, expecting `\`.
    StringEsc,
    /// `ESC (` / `ESC )` charset selection, one more byte.
    Charset,
}

/// Strips escape sequences from a stream of chunks. A sequence split
/// across two chunks is still removed whole.
#[derive(Debug, Clone)]
pub struct AnsiStripper {
    state: Esc,
}

impl Default for AnsiStripper {
    fn default() -> Self {
        Self { state: Esc::Text }
    }
}

impl AnsiStripper {
    /// Text of `chunk` without escape sequences and stray control bytes
    /// (BEL, NUL, SI, SO).
    pub fn push(&mut self, chunk: &str) -> String {
        let mut out = String::with_capacity(chunk.len());
        for c in chunk.chars() {
            self.state = match (self.state, c) {
                (Esc::Text, '\x1b') => Esc::Start,
                (Esc::Text, '\x07' | '\x00' | '\x0e' | '\x0f') => Esc::Text,
                (Esc::Text, c) => {
                    out.push(c);
                    Esc::Text
                }

                (Esc::Start, '[') => Esc::Csi,
                (Esc::Start, ']' | 'P') => Esc::String,
                (Esc::Start, '(' | ')') => Esc::Charset,
                // Two-byte sequences such as ESC = / ESC > / ESC M.
                (Esc::Start, _) => Esc::Text,

                (Esc::Csi, c) if ('\x40'..='\x7e').contains(&c) => Esc::Text,
                (Esc::Csi, _) => Esc::Csi,

                (Esc::String, '\x07') => Esc::Text,
                (Esc::String, '\x1b') => Esc::StringEsc,
                (Esc::String, _) => Esc::String,
                (Esc::StringEsc, '\\') => Esc::Text,
                (Esc::StringEsc, _) => Esc::String,

                (Esc::Charset, _) => Esc::Text,
            };
        }
        out
    }
}

/// Strip ANSI escape sequences and stray control bytes from one string.
pub fn strip_ansi_codes(s: &str) -> String {
    AnsiStripper::default().push(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_color_and_cursor_sequences() {
        assert_eq!(
            strip_ansi_codes("\x1b[1;32mRP/0/RP0/CPU0:ios#\x1b[0m "),
            "RP/0/RP0/CPU0:ios# "
        );
        assert_eq!(strip_ansi_codes("\x1b[2K\x1b[1Groot@:~ # "), "root@:~ # ");
    }

    #[test]
    fn test_strips_osc_title_and_charset() {
        assert_eq!(strip_ansi_codes("\x1b]0;vcp-r1\x07login: "), "login: ");
        assert_eq!(strip_ansi_codes("\x1b]2;t\x1b\\ok"), "ok");
        assert_eq!(strip_ansi_codes("\x1b(Bplain\x1b=\x07"), "plain");
    }

    #[test]
    fn test_sequence_split_across_chunks() {
        let mut stripper = AnsiStripper::default();
        let mut text = stripper.push("root@r1> \x1b[1");
        text.push_str(&stripper.push(";32mcommit complete\x1b]0;ti"));
        text.push_str(&stripper.push("tle\x07\n"));
        assert_eq!(text, "root@r1> commit complete\n");
    }

    #[test]
    fn test_plain_text_untouched() {
        let text = "commit complete\r\n[edit]\r\nroot# ";
        assert_eq!(strip_ansi_codes(text), text);
    }
}
