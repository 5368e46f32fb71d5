//! File and header name helpers.

use std::collections::HashSet;

/// Title used when the resolver gives us nothing printable.
pub const PLACEHOLDER_TITLE: &str = "Unknown Track";

/// Leaves room for a dedup suffix and extension under the usual 255-byte
/// filename limit.
const MAX_STEM_BYTES: usize = 200;

/// Turns an arbitrary display title into a single, safe file stem.
pub fn sanitize_title(title: &str) -> String {
    let replaced: String = title
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    let trimmed = replaced.trim_matches(|c: char| c.is_whitespace() || c == '.');
    let mut stem = trimmed.to_owned();
    if stem.len() > MAX_STEM_BYTES {
        let mut cut = MAX_STEM_BYTES;
        while !stem.is_char_boundary(cut) {
            cut -= 1;
        }
        stem.truncate(cut);
        stem = stem.trim_end().to_owned();
    }

    if stem.is_empty() || stem.chars().all(|c| c == '_') {
        PLACEHOLDER_TITLE.to_owned()
    } else {
        stem
    }
}

/// Hands out unique file names within one batch. Later duplicates get a
/// ` (2)`, ` (3)`… suffix; comparison ignores case so archives extract
/// cleanly on case-insensitive filesystems.
#[derive(Debug, Default)]
pub struct EntryNames {
    taken: HashSet<String>,
}

impl EntryNames {
    pub fn claim(&mut self, stem: &str, extension: &str) -> String {
        let mut candidate = format!("{stem}.{extension}");
        let mut counter = 2;
        while !self.taken.insert(candidate.to_lowercase()) {
            candidate = format!("{stem} ({counter}).{extension}");
            counter += 1;
        }
        candidate
    }
}

/// Builds an `attachment` disposition. Quotes and backslashes are escaped;
/// non-ASCII names get an ASCII fallback plus an RFC 5987 `filename*`.
pub fn content_disposition(filename: &str) -> String {
    let mut quoted = String::with_capacity(filename.len());
    let mut plain = true;
    for c in filename.chars() {
        match c {
            '"' | '\\' => {
                quoted.push('\\');
                quoted.push(c);
            }
            c if c == ' ' || c.is_ascii_graphic() => quoted.push(c),
            _ => {
                plain = false;
                quoted.push('_');
            }
        }
    }

    if plain {
        format!("attachment; filename=\"{quoted}\"")
    } else {
        format!(
            "attachment; filename=\"{quoted}\"; filename*=UTF-8''{}",
            urlencoding::encode(filename)
        )
    }
}
