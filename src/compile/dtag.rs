//! Durable identifier (`d` tag) derivation.
//!
//! A heading path is slugified segment by segment and then compressed:
//! abbreviations, interior connector removal, boundary de-duplication,
//! chapter/verse collapsing and finally a length ceiling that never touches
//! the last two segments unless nothing else is left to shorten.

/// Longest `d` tag the compiler emits.
pub const MAX_D_TAG_LEN: usize = 75;

const PREAMBLE_SUFFIX: &str = "-preamble";

/// Long words replaced by fixed short forms, sorted by word.
const ABBREVIATIONS: &[(&str, &str)] = &[
    ("according", "acc"),
    ("apocalypse", "apoc"),
    ("canticle", "cant"),
    ("chronicles", "chron"),
    ("colossians", "col"),
    ("commentary", "comm"),
    ("corinthians", "cor"),
    ("deuteronomy", "deut"),
    ("ecclesiastes", "eccl"),
    ("ecclesiasticus", "sir"),
    ("ephesians", "eph"),
    ("epistle", "ep"),
    ("galatians", "gal"),
    ("gospel", "gosp"),
    ("introduction", "intro"),
    ("lamentations", "lam"),
    ("leviticus", "lev"),
    ("machabees", "mac"),
    ("paralipomenon", "par"),
    ("philippians", "phil"),
    ("prologue", "prol"),
    ("revelation", "rev"),
    ("testament", "test"),
    ("thessalonians", "thess"),
];

/// Low-information words dropped from interior segments.
const CONNECTORS: &[&str] = &[
    "a", "an", "and", "at", "by", "for", "from", "in", "of", "on", "or", "the", "to", "with",
];

/// Lowercase ASCII slug: every run of characters outside `[a-z0-9]` becomes a
/// single hyphen, apostrophes vanish, and the result is trimmed of hyphens.
pub fn slugify(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_hyphen = false;
    for ch in text.chars() {
        if matches!(ch, '\'' | '\u{2018}' | '\u{2019}') {
            continue;
        }
        let c = ch.to_ascii_lowercase();
        if c.is_ascii_alphanumeric() {
            if pending_hyphen && !out.is_empty() {
                out.push('-');
            }
            pending_hyphen = false;
            out.push(c);
        } else {
            pending_hyphen = true;
        }
    }
    out
}

/// Derive the `d` tag for a path of titles (collection id first).
pub fn derive_d_tag<S: AsRef<str>>(parts: &[S]) -> String {
    let mut segments: Vec<Vec<String>> = parts
        .iter()
        .map(|p| slugify(p.as_ref()))
        .filter(|s| !s.is_empty())
        .map(|s| s.split('-').map(str::to_string).collect())
        .collect();

    abbreviate(&mut segments);
    drop_interior_connectors(&mut segments);
    dedupe_boundaries(&mut segments);

    let mut joined: Vec<String> = segments.into_iter().map(|w| w.join("-")).collect();
    collapse_chapter_pair(&mut joined);

    let d = fit_length(joined, MAX_D_TAG_LEN);
    if d.is_empty() {
        "untitled".to_string()
    } else {
        d
    }
}

/// Identifier of the synthetic Preamble chapter under a Book.
pub fn preamble_d_tag(book_d: &str) -> String {
    let room = MAX_D_TAG_LEN - PREAMBLE_SUFFIX.len();
    let base = if book_d.len() > room {
        book_d[..room].trim_end_matches('-')
    } else {
        book_d
    };
    format!("{base}{PREAMBLE_SUFFIX}")
}

/// `d` with `-n` appended, shortening `d` so the result stays within the
/// ceiling.
pub fn with_suffix(d: &str, n: usize) -> String {
    let suffix = format!("-{n}");
    let room = MAX_D_TAG_LEN - suffix.len();
    let base = if d.len() > room {
        d[..room].trim_end_matches('-')
    } else {
        d
    };
    format!("{base}{suffix}")
}

fn abbreviate(segments: &mut [Vec<String>]) {
    for word in segments.iter_mut().flatten() {
        if let Ok(pos) = ABBREVIATIONS.binary_search_by(|(long, _)| long.cmp(&word.as_str())) {
            *word = ABBREVIATIONS[pos].1.to_string();
        }
    }
}

fn drop_interior_connectors(segments: &mut [Vec<String>]) {
    let len = segments.len();
    if len < 3 {
        return;
    }
    for segment in &mut segments[1..len - 1] {
        let kept: Vec<String> = segment
            .iter()
            .filter(|w| !CONNECTORS.contains(&w.as_str()))
            .cloned()
            .collect();
        if !kept.is_empty() {
            *segment = kept;
        }
    }
}

/// Remove a segment equal to its successor, and a non-numeric word repeated
/// across a boundary (kept in the later segment).
fn dedupe_boundaries(segments: &mut Vec<Vec<String>>) {
    let mut i = 0;
    while i + 1 < segments.len() {
        if segments[i] == segments[i + 1] {
            segments.remove(i);
            continue;
        }
        let straddles = match (segments[i].last(), segments[i + 1].first()) {
            (Some(a), Some(b)) => a == b && !is_digits(a),
            _ => false,
        };
        if straddles {
            segments[i].pop();
            if segments[i].is_empty() {
                segments.remove(i);
                continue;
            }
        }
        i += 1;
    }
}

/// `["genesis-chapter-1", "1-4"]` becomes `["genesis-1-4"]`; a bare verse
/// number keeps the chapter: `["genesis-chapter-2", "4"]` → `["genesis-2-4"]`.
fn collapse_chapter_pair(joined: &mut Vec<String>) {
    let len = joined.len();
    if len < 2 || !is_numeric_run(&joined[len - 1]) {
        return;
    }
    let Some((node, number)) = split_chapter(&joined[len - 2]) else {
        return;
    };
    let last = &joined[len - 1];
    let merged = if last.starts_with(&format!("{number}-")) {
        format!("{node}-{last}")
    } else {
        format!("{node}-{number}-{last}")
    };
    joined.truncate(len - 2);
    joined.push(merged);
}

fn split_chapter(segment: &str) -> Option<(&str, &str)> {
    let pos = segment.rfind("-chapter-")?;
    let node = &segment[..pos];
    let number = &segment[pos + "-chapter-".len()..];
    (!node.is_empty() && is_digits(number)).then_some((node, number))
}

fn fit_length(segments: Vec<String>, max: usize) -> String {
    let mut segments: Vec<String> = segments.into_iter().filter(|s| !s.is_empty()).collect();
    if segments.join("-").len() <= max {
        return segments.join("-");
    }

    if segments.len() > 2 {
        let protected = segments.len() - 2;
        for width in [6, 3] {
            let shortened: Vec<String> = segments
                .iter()
                .enumerate()
                .map(|(i, s)| if i < protected { prefix(s, width) } else { s.clone() })
                .filter(|s| !s.is_empty())
                .collect();
            if shortened.join("-").len() <= max {
                return shortened.join("-");
            }
            if width == 3 {
                segments = shortened;
            }
        }
    }

    while segments.join("-").len() > max && segments.len() > 2 {
        segments.remove(0);
    }

    let mut d = segments.join("-");
    if d.len() > max {
        d.truncate(max);
        d = d.trim_end_matches('-').to_string();
    }
    d
}

fn prefix(segment: &str, width: usize) -> String {
    let end = segment.len().min(width);
    segment[..end].trim_end_matches('-').to_string()
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

fn is_numeric_run(s: &str) -> bool {
    !s.is_empty() && s.split('-').all(is_digits)
}
