//! Escape-aware scanner for markdown image references.
//!
//! Finds spans shaped `![alt](destination)` with a manual two-pointer lexer
//! rather than a full markdown parser. The alt span ends at the first
//! unescaped `]` (a backslash skips two characters) and is only accepted
//! when `(` immediately follows; the destination is matched with balanced
//! parentheses under the same escape rule, at arbitrary nesting depth.
//! Malformed or unterminated tags are skipped and the scanner resumes past
//! them, so surrounding text is never corrupted.

/// One image tag occurrence. `start..end` is the exact byte span of the
/// whole `![alt](dest)` reference in the scanned text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageTag {
    pub start: usize,
    pub end: usize,
    pub alt_text: String,
    pub destination: String,
}

/// Lazy iterator over the image tags of a text. Restartable: constructing a
/// new scanner over the same text yields the same sequence.
pub struct ImageTagScanner<'a> {
    text: &'a str,
    idx: usize,
}

impl<'a> ImageTagScanner<'a> {
    pub fn new(text: &'a str) -> Self {
        Self { text, idx: 0 }
    }
}

impl Iterator for ImageTagScanner<'_> {
    type Item = ImageTag;

    fn next(&mut self) -> Option<ImageTag> {
        let bytes = self.text.as_bytes();
        let length = bytes.len();
        while self.idx < length {
            let start = match find_from(self.text, self.idx, "![") {
                Some(p) => p,
                None => return None,
            };
            let alt_start = start + 2;
            let alt_end = match find_closing_bracket(bytes, alt_start) {
                Some(p) => p,
                None => return None, // unterminated alt: nothing further can match
            };
            if alt_end + 1 >= length || bytes[alt_end + 1] != b'(' {
                self.idx = alt_end + 1;
                continue;
            }
            let dest_start = alt_end + 2;
            let dest_end = match find_matching_paren(bytes, dest_start) {
                Some(p) => p,
                None => {
                    self.idx = alt_end + 1;
                    continue;
                }
            };
            self.idx = dest_end + 1;
            return Some(ImageTag {
                start,
                end: dest_end + 1,
                alt_text: self.text[alt_start..alt_end].to_string(),
                destination: extract_destination(&self.text[dest_start..dest_end]),
            });
        }
        None
    }
}

/// Convenience collector used by the rewriter.
pub fn find_image_tags(text: &str) -> Vec<ImageTag> {
    ImageTagScanner::new(text).collect()
}

fn find_from(text: &str, from: usize, needle: &str) -> Option<usize> {
    text.get(from..)?.find(needle).map(|p| from + p)
}

fn find_closing_bracket(bytes: &[u8], start: usize) -> Option<usize> {
    let mut i = start;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b']' => return Some(i),
            _ => i += 1,
        }
    }
    None
}

fn find_matching_paren(bytes: &[u8], start: usize) -> Option<usize> {
    let mut i = start;
    let mut depth = 1usize;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => {
                i += 2;
                continue;
            }
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

/// Pull the link destination out of the raw parenthesized span: an
/// angle-bracketed destination is unwrapped, otherwise the span is read up
/// to the first unescaped whitespace (dropping any trailing title).
fn extract_destination(raw: &str) -> String {
    let cleaned = raw.trim();
    if cleaned.is_empty() {
        return String::new();
    }
    if let Some(rest) = cleaned.strip_prefix('<') {
        if let Some(closing) = rest.find('>') {
            return rest[..closing].to_string();
        }
    }
    let mut buffer = String::new();
    let mut escape = false;
    for ch in cleaned.chars() {
        if escape {
            buffer.push(ch);
            escape = false;
            continue;
        }
        if ch == '\\' {
            escape = true;
            continue;
        }
        if ch.is_whitespace() {
            break;
        }
        buffer.push(ch);
    }
    buffer
}

/// Decode `%XX` escapes. Invalid escapes pass through literally; decoded
/// bytes that are not valid UTF-8 are replaced.
pub fn percent_decode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%'
            && i + 2 < bytes.len()
            && bytes[i + 1].is_ascii_hexdigit()
            && bytes[i + 2].is_ascii_hexdigit()
        {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or("");
            if let Ok(v) = u8::from_str_radix(hex, 16) {
                out.push(v);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_simple_tag_with_exact_span() {
        let text = "before ![alt text](images/a.png) after";
        let tags = find_image_tags(text);
        assert_eq!(tags.len(), 1);
        assert_eq!(&text[tags[0].start..tags[0].end], "![alt text](images/a.png)");
        assert_eq!(tags[0].alt_text, "alt text");
        assert_eq!(tags[0].destination, "images/a.png");
    }

    #[test]
    fn escaped_bracket_does_not_close_alt() {
        let tags = find_image_tags(r"![a\]b](x.png)");
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].alt_text, r"a\]b");
        assert_eq!(tags[0].destination, "x.png");
    }

    #[test]
    fn nested_parens_in_destination() {
        let tags = find_image_tags("![d](dir/shot(1)(2).png)");
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].destination, "dir/shot(1)(2).png");
    }

    #[test]
    fn angle_bracket_destination_unwrapped() {
        let tags = find_image_tags("![d](<dir with space/a.png> \"title\")");
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].destination, "dir with space/a.png");
    }

    #[test]
    fn destination_stops_at_unescaped_whitespace() {
        let tags = find_image_tags("![d](a.png \"the title\")");
        assert_eq!(tags[0].destination, "a.png");
        let tags = find_image_tags(r"![d](a\ b.png)");
        assert_eq!(tags[0].destination, "a b.png");
    }

    #[test]
    fn bracket_without_paren_is_not_an_image() {
        let tags = find_image_tags("![just a ref] and later ![real](x.png)");
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].destination, "x.png");
    }

    #[test]
    fn unterminated_alt_ends_scan() {
        let tags = find_image_tags("text ![never closed (x.png)");
        assert!(tags.is_empty());
    }

    #[test]
    fn unbalanced_parens_skipped() {
        // The first tag never balances its parens; the scanner resumes past
        // its alt span and still finds the well-formed inner tag.
        let tags = find_image_tags("![a](broken ![b](ok.png)");
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].destination, "ok.png");
    }

    #[test]
    fn scanner_is_restartable() {
        let text = "![a](1.png) ![b](2.png)";
        let first: Vec<_> = ImageTagScanner::new(text).collect();
        let second: Vec<_> = ImageTagScanner::new(text).collect();
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
    }

    #[test]
    fn percent_decoding() {
        assert_eq!(percent_decode("a%20b.png"), "a b.png");
        assert_eq!(percent_decode("100%"), "100%");
        assert_eq!(percent_decode("%zz"), "%zz");
        assert_eq!(percent_decode("%é정"), "%é정");
    }
}
