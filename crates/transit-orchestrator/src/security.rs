//! Boundary validation and destination-name resolution (spec.md §6
//! "Security filters applied at the boundary").

use std::path::{Component, Path};

use transit_core::AdmitError;
use uuid::Uuid;

pub fn validate_scheme(url: &str) -> Result<(), AdmitError> {
    let lower = url.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") || lower.starts_with("ftp://") {
        Ok(())
    } else {
        Err(AdmitError::FailedSecurityCheck)
    }
}

/// `targetDir` must never contain a `..` component; a non-privileged caller
/// is further confined beneath `media_root` (spec.md §6 "Security filters
/// applied at the boundary").
pub fn validate_target_dir(dir: &Path, media_root: Option<&Path>) -> Result<(), AdmitError> {
    if dir.components().any(|c| c == Component::ParentDir) {
        return Err(AdmitError::FailedSecurityCheck);
    }
    if let Some(root) = media_root {
        if !dir.starts_with(root) {
            return Err(AdmitError::FailedSecurityCheck);
        }
    }
    Ok(())
}

/// Upload `contentType` must match `^[^\s]+/[^\s]+$` (spec.md §6 "Client
/// request fields (upload)").
pub fn validate_content_type(content_type: &str) -> Result<(), AdmitError> {
    let Some((type_part, subtype_part)) = content_type.split_once('/') else {
        return Err(AdmitError::FailedSecurityCheck);
    };
    let no_whitespace = |s: &str| !s.is_empty() && !s.chars().any(char::is_whitespace);
    if no_whitespace(type_part) && no_whitespace(subtype_part) {
        Ok(())
    } else {
        Err(AdmitError::FailedSecurityCheck)
    }
}

pub fn validate_filename(name: &str) -> Result<(), AdmitError> {
    if name.contains('/') {
        return Err(AdmitError::FailedSecurityCheck);
    }
    if name.chars().all(|c| c == '.') {
        return Err(AdmitError::FailedSecurityCheck);
    }
    Ok(())
}

/// Last path segment of a URL, ignoring any query string.
pub fn filename_from_url(url: &str) -> Option<String> {
    let path = url.split('?').next().unwrap_or(url);
    let last = path.rsplit('/').next()?;
    if last.is_empty() {
        None
    } else {
        Some(last.to_string())
    }
}

fn split_ext(name: &str) -> (String, Option<String>) {
    match name.rfind('.') {
        Some(0) | None => (name.to_string(), None),
        Some(idx) => (name[..idx].to_string(), Some(name[idx + 1..].to_string())),
    }
}

/// Given a candidate name and a predicate that reports whether a name is
/// already taken (checked against both the temp and final path per
/// spec.md §6), derive `name_1`, `name_2`, ... preserving the extension.
/// If the caller explicitly supplied the filename, skip this entirely —
/// that is the caller's responsibility, not this function's.
pub fn resolve_collision(candidate: &str, exists: impl Fn(&str) -> bool) -> String {
    if !exists(candidate) {
        return candidate.to_string();
    }
    let (stem, ext) = split_ext(candidate);
    for n in 1u32.. {
        let next = match &ext {
            Some(e) => format!("{stem}_{n}.{e}"),
            None => format!("{stem}_{n}"),
        };
        if !exists(&next) {
            return next;
        }
    }
    unreachable!("exists() must eventually return false for an unbounded suffix search")
}

/// Mint a unique `fileXXXXXX` template name when no usable filename can be
/// derived from the URL or an explicit override.
pub fn mint_unique_name(exists: impl Fn(&str) -> bool) -> String {
    loop {
        let candidate = format!("file{}", &Uuid::new_v4().simple().to_string()[..6]);
        if !exists(&candidate) {
            return candidate;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_http_ftp_schemes() {
        assert!(validate_scheme("gopher://example.test/a").is_err());
        assert!(validate_scheme("https://example.test/a").is_ok());
        assert!(validate_scheme("ftp://example.test/a").is_ok());
    }

    #[test]
    fn rejects_parent_dir_components() {
        assert!(validate_target_dir(Path::new("/media/internal/../etc"), None).is_err());
        assert!(validate_target_dir(Path::new("/media/internal/downloads"), None).is_ok());
    }

    #[test]
    fn non_privileged_callers_are_confined_to_media_root() {
        let root = Path::new("/media/internal/downloads");
        assert!(validate_target_dir(Path::new("/media/internal/downloads/sub"), Some(root)).is_ok());
        assert!(validate_target_dir(Path::new("/etc"), Some(root)).is_err());
        // A privileged caller (no media_root) is not confined at all.
        assert!(validate_target_dir(Path::new("/etc"), None).is_ok());
    }

    #[test]
    fn rejects_slash_and_all_dot_filenames() {
        assert!(validate_filename("a/b").is_err());
        assert!(validate_filename("...").is_err());
        assert!(validate_filename("a.bin").is_ok());
    }

    #[test]
    fn collision_renaming_preserves_extension_and_increments() {
        let existing = ["a.bin"];
        let first = resolve_collision("a.bin", |n| existing.contains(&n));
        assert_eq!(first, "a_1.bin");

        let existing_both = ["a.bin", "a_1.bin"];
        let second = resolve_collision("a.bin", |n| existing_both.contains(&n));
        assert_eq!(second, "a_2.bin");
    }

    #[test]
    fn content_type_must_be_two_nonempty_slash_separated_tokens() {
        assert!(validate_content_type("application/pdf").is_ok());
        assert!(validate_content_type("application/octet-stream").is_ok());
        assert!(validate_content_type("application").is_err());
        assert!(validate_content_type("application/").is_err());
        assert!(validate_content_type("/pdf").is_err());
        assert!(validate_content_type("application/pdf extra").is_err());
    }

    #[test]
    fn no_collision_returns_candidate_unchanged() {
        let got = resolve_collision("a.bin", |_| false);
        assert_eq!(got, "a.bin");
    }
}
