//! Splitting long messages into platform-sized chunks.
//!
//! Text is split on line boundaries; a newline that separates two chunks
//! is consumed by the split. A line too long for any chunk is wrapped,
//! preferring a space near the end of the window, and its continuation
//! starts a new chunk with nothing consumed. A wrap never lands inside an
//! HTML entity or tag.

/// How far back from the wrap limit to look for a space.
const WRAP_SEARCH_WINDOW: usize = 50;

/// Part number used to size the marker reservation for wrapped lines.
const MARKER_RESERVE_PART: usize = 9999;

/// Longest entity or tag (in bytes) a wrap point is moved back over.
const MARKUP_BACKTRACK: usize = 32;

/// The unit a platform's message limit is counted in.
///
/// Telegram counts UTF-16 code units; Slack counts characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LengthUnit {
    #[default]
    Chars,
    Utf16,
}

impl LengthUnit {
    /// Length of `text` in this unit.
    pub fn measure(self, text: &str) -> usize {
        match self {
            Self::Chars => text.chars().count(),
            Self::Utf16 => text.encode_utf16().count(),
        }
    }

    fn width(self, c: char) -> usize {
        match self {
            Self::Chars => 1,
            Self::Utf16 => c.len_utf16(),
        }
    }

    /// Byte offset of the longest prefix of `s` measuring at most `n`.
    fn byte_offset(self, s: &str, n: usize) -> usize {
        let mut used = 0;
        for (i, c) in s.char_indices() {
            used += self.width(c);
            if used > n {
                return i;
            }
        }
        s.len()
    }
}

/// Length in characters.
pub fn char_len(text: &str) -> usize {
    LengthUnit::Chars.measure(text)
}

/// Split `text` into chunks of at most `limit` units each.
///
/// Every chunk after the first is prefixed with `marker(n)` (n is 1-based),
/// and the marker counts toward the limit.
pub fn split_message(
    text: &str,
    limit: usize,
    unit: LengthUnit,
    marker: impl Fn(usize) -> String,
) -> Vec<String> {
    if unit.measure(text) <= limit {
        return vec![text.to_string()];
    }

    let reserve = unit.measure(&marker(MARKER_RESERVE_PART));
    let wrap_width = limit.saturating_sub(reserve).max(1);
    let budget = |index: usize| {
        if index == 0 {
            limit
        } else {
            limit.saturating_sub(unit.measure(&marker(index + 1)))
        }
    };

    let mut bodies: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;
    let mut current_lines = 0;

    for line in text.split('\n') {
        let pieces = wrap_long_line(line, wrap_width, unit);
        for (j, piece) in pieces.into_iter().enumerate() {
            let piece_len = unit.measure(piece);
            let continuation = j > 0;
            let overflows = current_len + 1 + piece_len > budget(bodies.len());

            if current_lines > 0 && (continuation || overflows) {
                bodies.push(std::mem::take(&mut current));
                current_len = 0;
                current_lines = 0;
            }

            if current_lines > 0 {
                current.push('\n');
                current_len += 1;
            }
            current.push_str(piece);
            current_len += piece_len;
            current_lines += 1;
        }
    }

    if current_lines > 0 {
        bodies.push(current);
    }

    bodies
        .into_iter()
        .enumerate()
        .map(|(i, body)| {
            if i == 0 {
                body
            } else {
                format!("{}{}", marker(i + 1), body)
            }
        })
        .collect()
}

/// Wrap a single line into pieces of at most `width` units.
///
/// Breaks just after the last space within the final
/// [`WRAP_SEARCH_WINDOW`] characters of the window, so the space stays
/// with the earlier piece; otherwise cuts mid-word. A break that would
/// fall inside `&...;` or `<...>` moves back to the `&` or `<`.
/// Concatenating the pieces yields the original line.
pub fn wrap_long_line(line: &str, width: usize, unit: LengthUnit) -> Vec<&str> {
    let width = width.max(1);
    let mut pieces = Vec::new();
    let mut rest = line;

    while unit.measure(rest) > width {
        let mut cut = unit.byte_offset(rest, width);
        if cut == 0 {
            cut = rest.chars().next().map_or(rest.len(), char::len_utf8);
        }
        let window_start = unit.byte_offset(rest, width.saturating_sub(WRAP_SEARCH_WINDOW));

        let split = rest[window_start..cut]
            .rfind(' ')
            .map(|i| window_start + i + 1)
            .unwrap_or(cut);
        let split = markup_safe_split(&rest[..split]);

        pieces.push(&rest[..split]);
        rest = &rest[split..];
    }

    if !rest.is_empty() || pieces.is_empty() {
        pieces.push(rest);
    }
    pieces
}

/// Shorten `piece` so it does not end inside an open entity or tag.
fn markup_safe_split(piece: &str) -> usize {
    let open = [('&', ';'), ('<', '>')]
        .into_iter()
        .filter_map(|(open, close)| {
            let at = piece.rfind(open)?;
            (!piece[at..].contains(close)).then_some(at)
        })
        .min();

    match open {
        Some(at) if at > 0 && piece.len() - at <= MARKUP_BACKTRACK => at,
        _ => piece.len(),
    }
}
