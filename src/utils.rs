//! Assorted helpers: link detection, naming, human-readable formatting.

use std::time::Duration;

use linkify::{LinkFinder, LinkKind};
use rand::{Rng, distr::Alphanumeric};
use url::Url;

/// Longest file name, in bytes, that we are willing to write to disk.
const MAX_FILE_NAME_LEN: usize = 200;

/// Obtain a random string of the specified length.
pub fn random_string(size: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(size)
        .map(char::from)
        .collect()
}

/// Find all URLs in a given message.
pub fn find_urls(msg: &str) -> Vec<&str> {
    let mut finder = LinkFinder::new();
    finder.kinds(&[LinkKind::Url]);
    finder.links(msg).map(|link| link.as_str()).collect()
}

/// Reduce a host to its registrable part.
///
/// `www.youtube.com` -> `youtube.com`; `vm.tiktok.com` -> `tiktok.com` etc.
pub fn site_of(url: &Url) -> Option<String> {
    let netloc = url.host_str()?;
    let netloc_parts = netloc.split('.').collect::<Vec<_>>();
    if netloc_parts.len() < 2 {
        return Some(netloc.to_lowercase());
    }
    Some(netloc_parts[netloc_parts.len() - 2..].join(".").to_lowercase())
}

/// Make a user- or server-supplied name safe to use as a single path component.
pub fn sanitize_file_name(name: &str) -> Option<String> {
    let cleaned = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect::<String>();
    let trimmed = cleaned.trim().trim_start_matches('.').trim();

    if trimmed.is_empty() {
        return None;
    }

    // cut on a char boundary
    let mut end = trimmed.len().min(MAX_FILE_NAME_LEN);
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    Some(trimmed[..end].to_string())
}

/// Derive a file name from the last path segment of a URL.
pub fn file_name_from_url(url: &Url) -> Option<String> {
    let segment = url.path_segments()?.rev().find(|s| !s.is_empty())?;
    let decoded = urlencoding::decode(segment).ok()?;
    sanitize_file_name(&decoded)
}

/// Extract the `filename` parameter of a `Content-Disposition` header.
pub fn file_name_from_disposition(header: &str) -> Option<String> {
    // RFC 5987 form first: filename*=UTF-8''name
    let extended = header.split(';').map(str::trim).find_map(|part| {
        let value = part.strip_prefix("filename*=")?;
        let (_, encoded) = value.split_once("''")?;
        urlencoding::decode(encoded.trim_matches('"'))
            .ok()
            .map(|s| s.into_owned())
    });

    let plain = || {
        header.split(';').map(str::trim).find_map(|part| {
            part.strip_prefix("filename=")
                .map(|value| value.trim_matches('"').to_string())
        })
    };

    extended.or_else(plain).and_then(|n| sanitize_file_name(&n))
}

/// Format a byte count using binary units, e.g. `12.34 MiB`.
#[allow(clippy::cast_precision_loss)]
pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];

    if bytes < 1024 {
        return format!("{bytes} B");
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    format!("{value:.2} {}", UNITS[unit])
}

/// Format a duration compactly, e.g. `1h 2m 3s`.
pub fn human_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let (hours, minutes, seconds) = (secs / 3600, (secs % 3600) / 60, secs % 60);

    match (hours, minutes) {
        (0, 0) => format!("{seconds}s"),
        (0, _) => format!("{minutes}m {seconds}s"),
        _ => format!("{hours}h {minutes}m {seconds}s"),
    }
}

/// Average rate in bytes per second; zero elapsed time counts as one millisecond.
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn bytes_per_second(bytes: u64, elapsed: Duration) -> u64 {
    let secs = elapsed.as_secs_f64().max(0.001);
    (bytes as f64 / secs) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_every_url() {
        let urls = find_urls("see https://a.example/x and http://b.example/y.bin please");
        assert_eq!(urls, vec!["https://a.example/x", "http://b.example/y.bin"]);
        assert!(find_urls("no links here").is_empty());
    }

    #[test]
    fn site_strips_subdomains() {
        let url = Url::parse("https://www.YouTube.com/watch?v=1").unwrap();
        assert_eq!(site_of(&url).as_deref(), Some("youtube.com"));
        let url = Url::parse("http://localhost:8080/").unwrap();
        assert_eq!(site_of(&url).as_deref(), Some("localhost"));
    }

    #[test]
    fn names_are_sanitized() {
        assert_eq!(sanitize_file_name("../etc/passwd").as_deref(), Some("_etc_passwd"));
        assert_eq!(sanitize_file_name("  report.pdf ").as_deref(), Some("report.pdf"));
        assert_eq!(sanitize_file_name("..."), None);
        assert_eq!(sanitize_file_name(&"é".repeat(150)).map(|s| s.len()), Some(200));
    }

    #[test]
    fn url_file_names_are_decoded() {
        let url = Url::parse("https://host/files/My%20Movie.mkv?x=1").unwrap();
        assert_eq!(file_name_from_url(&url).as_deref(), Some("My Movie.mkv"));
        let url = Url::parse("https://host/").unwrap();
        assert_eq!(file_name_from_url(&url), None);
    }

    #[test]
    fn disposition_prefers_extended_form() {
        assert_eq!(
            file_name_from_disposition("attachment; filename=\"a.zip\"").as_deref(),
            Some("a.zip")
        );
        assert_eq!(
            file_name_from_disposition("attachment; filename=\"a.zip\"; filename*=UTF-8''b%20c.zip")
                .as_deref(),
            Some("b c.zip")
        );
        assert_eq!(file_name_from_disposition("inline"), None);
    }

    #[test]
    fn human_formatting() {
        assert_eq!(human_bytes(512), "512 B");
        assert_eq!(human_bytes(10 * 1024 * 1024), "10.00 MiB");
        assert_eq!(human_duration(Duration::from_secs(5)), "5s");
        assert_eq!(human_duration(Duration::from_secs(3723)), "1h 2m 3s");
        assert_eq!(bytes_per_second(10, Duration::from_secs(2)), 5);
    }
}
