//! Filename sanitisation shared by uploads and downloads.
//!
//! Uploaded photo names end up on disk inside the staging area; the child's
//! name ends up inside a `Content-Disposition` header. Both go through
//! [`secure_filename`] so a single set of rules guards against path
//! traversal and header injection.

use once_cell::sync::Lazy;
use regex::Regex;

static RE_UNSAFE_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^A-Za-z0-9_.-]").unwrap());

/// Reserved device names that some filesystems refuse as file stems.
const RESERVED_STEMS: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "LPT1", "LPT2", "LPT3",
];

/// Reduce `name` to a flat, ASCII-only filename.
///
/// 1. Drop non-ASCII characters.
/// 2. Turn path separators into whitespace, so directory components
///    become plain words.
/// 3. Join whitespace-separated words with `_`.
/// 4. Remove everything outside `[A-Za-z0-9_.-]`.
/// 5. Strip leading/trailing `.` and `_` (no hidden files, no `..`).
///
/// The result may be empty; callers pick their own fallback.
pub fn secure_filename(name: &str) -> String {
    let ascii: String = name.chars().filter(|c| c.is_ascii()).collect();
    let spaced = ascii.replace(['/', '\\'], " ");
    let joined = spaced.split_whitespace().collect::<Vec<_>>().join("_");
    let cleaned = RE_UNSAFE_CHARS.replace_all(&joined, "");
    let trimmed = cleaned.trim_matches(|c| c == '.' || c == '_');

    let stem = trimmed.split('.').next().unwrap_or_default();
    if RESERVED_STEMS.iter().any(|r| r.eq_ignore_ascii_case(stem)) {
        format!("_{trimmed}")
    } else {
        trimmed.to_string()
    }
}

/// Lower-cased extension after the last `.`, if any.
pub fn extension_of(name: &str) -> Option<String> {
    let (_, ext) = name.rsplit_once('.')?;
    if ext.is_empty() {
        None
    } else {
        Some(ext.to_ascii_lowercase())
    }
}

/// Everything before the last `.`, or the whole name.
pub fn stem_of(name: &str) -> &str {
    name.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(name)
}

/// Attachment filename for a rendered certificate:
/// `adoption_certificate_<child name>.<ext>`.
///
/// Falls back to `adoption_certificate.<ext>` when the name sanitises to
/// nothing (e.g. a name written entirely in a non-Latin script).
pub fn download_filename(child_name: &str, ext: &str) -> String {
    let name = secure_filename(child_name);
    let ext = secure_filename(ext);
    if name.is_empty() {
        format!("adoption_certificate.{ext}")
    } else {
        format!("adoption_certificate_{name}.{ext}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_path_traversal() {
        assert_eq!(secure_filename("../../etc/passwd"), "etc_passwd");
        assert_eq!(secure_filename("..\\..\\boot.ini"), "boot.ini");
        assert_eq!(secure_filename("/abs/path/photo.png"), "abs_path_photo.png");
    }

    #[test]
    fn joins_whitespace_and_drops_specials() {
        assert_eq!(secure_filename("my cute  photo!.JPG"), "my_cute_photo.JPG");
        assert_eq!(secure_filename("a\"b;c\r\nd.png"), "abc_d.png");
    }

    #[test]
    fn drops_non_ascii() {
        assert_eq!(secure_filename("صورة.png"), "png");
        assert_eq!(secure_filename("Zoë"), "Zo");
        assert_eq!(secure_filename("محمد"), "");
    }

    #[test]
    fn no_leading_dots() {
        assert_eq!(secure_filename(".htaccess"), "htaccess");
        assert_eq!(secure_filename("..."), "");
    }

    #[test]
    fn reserved_stems_are_prefixed() {
        assert_eq!(secure_filename("con.png"), "_con.png");
        assert_eq!(secure_filename("console.png"), "console.png");
    }

    #[test]
    fn extension_handling() {
        assert_eq!(extension_of("Photo.PNG").as_deref(), Some("png"));
        assert_eq!(extension_of("archive.tar.gz").as_deref(), Some("gz"));
        assert_eq!(extension_of("noext"), None);
        assert_eq!(extension_of("trailing."), None);
        assert_eq!(stem_of("archive.tar.gz"), "archive.tar");
        assert_eq!(stem_of("noext"), "noext");
    }

    #[test]
    fn download_filename_uses_sanitised_child_name() {
        assert_eq!(
            download_filename("Amal Hassan", "pdf"),
            "adoption_certificate_Amal_Hassan.pdf"
        );
        assert_eq!(
            download_filename("x\"; filename=evil.exe", "pdf"),
            "adoption_certificate_x_filenameevil.exe.pdf"
        );
        assert_eq!(download_filename("محمد", "pdf"), "adoption_certificate.pdf");
        assert_eq!(download_filename("", "pdf"), "adoption_certificate.pdf");
    }
}
