//! Key normalization shared by every provider.

use regex::Regex;
use std::sync::OnceLock;

use crate::model::ImageKind;

/// Canonical set number: trimmed, inner whitespace removed, trailing `-N`
/// variant suffix (one or two digits) stripped, uppercased. `"75192-1"` and
/// `" 75192 "` both become `"75192"`; `"cnd01"` becomes `"CND01"`.
pub fn normalize_set_number(raw: &str) -> Option<String> {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    let base = match compact.rsplit_once('-') {
        Some((head, tail))
            if !head.is_empty()
                && (1..=2).contains(&tail.len())
                && tail.chars().all(|c| c.is_ascii_digit()) =>
        {
            head
        }
        _ => compact.as_str(),
    };
    let out = base.to_ascii_uppercase();
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

/// Lowercased, whitespace-collapsed name used for the fallback name match.
pub fn normalize_name(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Theme key: lowercase alphanumerics with single spaces.
pub fn normalize_theme(raw: &str) -> String {
    let spaced: String = raw
        .chars()
        .map(|c| {
            if c.is_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                ' '
            }
        })
        .collect();
    spaced.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Classify an image URL or file name as packaging art or a product render.
pub fn classify_image(url_or_file: &str) -> ImageKind {
    let name = url_or_file
        .rsplit('/')
        .next()
        .unwrap_or(url_or_file)
        .to_ascii_lowercase();
    let name = urlencoding::decode(&name)
        .map(|s| s.into_owned())
        .unwrap_or(name);
    let tokens: Vec<&str> = name
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();
    let boxy = tokens
        .iter()
        .any(|t| *t == "box" || *t == "boxart" || *t == "packaging" || t.starts_with("box"));
    if boxy {
        ImageKind::BoxArt
    } else {
        ImageKind::Render
    }
}

fn set_code_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^(?:file:)?\s*([a-z]{0,5}\d{2,7}[a-z]?)(?:-\d+)?(?:[\s_.\-]|$)")
            .expect("set code pattern is valid")
    })
}

/// Extract the leading set code from an image file name, uppercased.
/// `"File:75192 Box.jpg"` -> `"75192"`, `"cnd01_alt.png"` -> `"CND01"`.
pub fn set_code_from_filename(file_name: &str) -> Option<String> {
    let caps = set_code_regex().captures(file_name.trim())?;
    caps.get(1)
        .and_then(|m| normalize_set_number(m.as_str()))
}
