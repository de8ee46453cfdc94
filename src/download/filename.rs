use sha2::{Digest, Sha256};
use url::Url;

use crate::model::Episode;

/// Maximum length for the title portion of a filename
const MAX_TITLE_LENGTH: usize = 80;

/// Check if a character is allowed in filenames (whitelist approach)
fn is_valid_filename_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ' ')
}

/// Local filename for an episode's audio.
///
/// Format: `YYYY-MM-DD-sanitized-title-<hash8>.<ext>` (or `undated-...`).
/// The hash comes from the episode identity, so two episodes with the same
/// date and title still get distinct files.
pub fn local_filename(episode: &Episode) -> String {
    let date_prefix = episode
        .air_date
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "undated".to_string());

    let title = sanitize_title(&episode.title);
    let ext = audio_extension(episode);
    let hash = identity_hash(episode);

    if title.is_empty() {
        format!("{date_prefix}-{hash}.{ext}")
    } else {
        format!("{date_prefix}-{title}-{hash}.{ext}")
    }
}

/// First 8 hex digits of the SHA-256 of the episode identity
fn identity_hash(episode: &Episode) -> String {
    let digest = Sha256::digest(episode.id.to_string().as_bytes());
    format!("{digest:x}")[..8].to_string()
}

/// Audio file extension, from the URL path or MIME type, defaulting to "mp3"
pub fn audio_extension(episode: &Episode) -> String {
    if let Ok(url) = Url::parse(&episode.audio_url)
        && let Some(ext) = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .and_then(|filename| filename.rsplit_once('.'))
            .map(|(_, ext)| ext)
            .filter(|ext| is_valid_audio_extension(ext))
    {
        return ext.to_lowercase();
    }

    if let Some(ref mime) = episode.mime_type
        && let Some(ext) = mime_to_extension(mime)
    {
        return ext.to_string();
    }

    "mp3".to_string()
}

/// Sanitize a title for use in a filename
fn sanitize_title(title: &str) -> String {
    let sanitized: String = title
        .chars()
        .map(|c| if is_valid_filename_char(c) { c } else { '-' })
        .collect();

    let collapsed = collapse_separators(&sanitized);
    let trimmed = collapsed.trim_matches(|c: char| c == '-' || c == '.' || c.is_whitespace());

    truncate_at_boundary(trimmed, MAX_TITLE_LENGTH)
}

/// Collapse runs of spaces and dashes into a single dash
fn collapse_separators(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut last_was_separator = false;

    for c in s.chars() {
        if c == '-' || c.is_whitespace() {
            if !last_was_separator {
                result.push('-');
                last_was_separator = true;
            }
        } else {
            result.push(c);
            last_was_separator = false;
        }
    }

    result
}

/// Truncate at a dash if one sits in the back half, otherwise hard cut
fn truncate_at_boundary(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }

    // Only ASCII survives sanitizing, so byte slicing is safe
    let truncated = &s[..max_len];
    if let Some(pos) = truncated.rfind('-')
        && pos > max_len / 2
    {
        return truncated[..pos].to_string();
    }

    truncated.trim_end_matches('-').to_string()
}

fn is_valid_audio_extension(ext: &str) -> bool {
    matches!(
        ext.to_lowercase().as_str(),
        "mp3" | "m4a" | "mp4" | "aac" | "ogg" | "opus" | "wav" | "flac"
    )
}

fn mime_to_extension(mime: &str) -> Option<&'static str> {
    match mime.to_lowercase().as_str() {
        "audio/mpeg" | "audio/mp3" => Some("mp3"),
        "audio/mp4" | "audio/m4a" | "audio/x-m4a" => Some("m4a"),
        "audio/aac" => Some("aac"),
        "audio/ogg" => Some("ogg"),
        "audio/opus" => Some("opus"),
        "audio/wav" | "audio/x-wav" => Some("wav"),
        "audio/flac" | "audio/x-flac" => Some("flac"),
        _ => None,
    }
}
