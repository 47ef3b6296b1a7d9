//! Type-tag normalization.
//!
//! Peers that advertise fully qualified runtime type names decorate them with
//! assembly, version, culture and key-token suffixes:
//!
//! ```text
//! System.Tuple`2[[System.Double, mscorlib, Version=4.0.0.0],[System.Double, mscorlib]], mscorlib
//! ```
//!
//! [`simplify`] strips everything after the first comma at each bracket
//! nesting level and keeps the bracket structure, giving
//! `System.Tuple`2[[System.Double],[System.Double]]`. Both ends apply the
//! same rule before comparing tags.
//!
//! Two kinds of comma survive: the separator between bracketed generic
//! arguments (`],[`), and the commas of an array rank specifier such as
//! `[,]` (directly after a `[` or another rank comma).

/// Normalize a fully qualified type name. Applying it twice is a no-op.
pub fn simplify(type_name: &str) -> String {
    let mut out = String::with_capacity(type_name.len());
    let mut chars = type_name.chars().peekable();

    while let Some(c) = chars.next() {
        if c != ',' || keeps_comma(&out, chars.peek().copied()) {
            out.push(c);
            continue;
        }

        // Qualification suffix: drop it up to the bracket that closes the
        // current level, or to the end at the top level.
        let mut depth = 0usize;
        while let Some(&next) = chars.peek() {
            match next {
                '[' => depth += 1,
                ']' if depth == 0 => break,
                ']' => depth -= 1,
                _ => {}
            }
            chars.next();
        }
    }

    out
}

fn keeps_comma(emitted: &str, next: Option<char>) -> bool {
    let previous = emitted.chars().next_back();
    matches!((previous, next), (Some(']'), Some('['))) || matches!(previous, Some('[' | ','))
}
