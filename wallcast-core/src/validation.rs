//! Input validation for device identifiers, upload names, and storage paths.
//!
//! Device ids double as directory names under the storage root, so the charset
//! here is the first line of defense against path escapes.

use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};

/// Maximum device id length
pub const DEVICE_ID_MAX: usize = 64;

/// Maximum accepted upload size in bytes (2 GiB)
pub const MAX_FILE_SIZE: u64 = 2 * 1024 * 1024 * 1024;

/// Validate a device identifier: ASCII letters, digits, underscore, hyphen.
pub fn validate_device_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::Validation("device id must not be empty".into()));
    }
    if id.len() > DEVICE_ID_MAX {
        return Err(Error::Validation(format!(
            "device id must be at most {DEVICE_ID_MAX} characters"
        )));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(Error::Validation(
            "device id may only contain letters, digits, underscores, and hyphens".into(),
        ));
    }
    Ok(())
}

/// Storage names reserved for internal machinery: the device placeholder,
/// in-flight transcode output, staged placeholder temp files, and dot-files.
#[must_use]
pub fn is_system_entry(name: &str) -> bool {
    let stem = name.split('.').next().unwrap_or(name);
    stem == "default"
        || name.starts_with(".optimizing_")
        || name.starts_with(".tmp_default_")
        || name.starts_with('.')
}

/// Reduce an arbitrary display name to a safe storage name.
///
/// Cyrillic is transliterated, everything outside `[A-Za-z0-9._-]` becomes an
/// underscore, runs of underscores collapse, and the extension is kept
/// lowercased. An empty result falls back to a timestamped name.
#[must_use]
pub fn safe_filename(original: &str) -> String {
    let (stem, ext) = match original.rsplit_once('.') {
        Some((s, e)) if !s.is_empty() && !e.is_empty() => (s, Some(e)),
        _ => (original, None),
    };

    let mut safe = sanitize_component(&transliterate(stem));
    if safe.is_empty() {
        safe = format!("file_{}", chrono::Utc::now().timestamp_millis());
    }

    match ext {
        Some(e) => {
            let ext = sanitize_component(&transliterate(e)).to_lowercase();
            if ext.is_empty() {
                safe
            } else {
                format!("{safe}.{ext}")
            }
        }
        None => safe,
    }
}

fn sanitize_component(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_underscore = false;
    for c in input.chars() {
        if c.is_ascii_alphanumeric() || c == '-' {
            out.push(c);
            last_underscore = false;
        } else if !last_underscore {
            out.push('_');
            last_underscore = true;
        }
    }
    out.trim_matches(|c| c == '_' || c == '.').to_string()
}

/// Transliterate Cyrillic characters to Latin, leaving everything else as-is.
#[must_use]
pub fn transliterate(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        let lower = c.to_lowercase().next().unwrap_or(c);
        match cyrillic_to_latin(lower) {
            Some(lat) => {
                if c.is_uppercase() {
                    let mut chars = lat.chars();
                    if let Some(first) = chars.next() {
                        out.extend(first.to_uppercase());
                        out.push_str(chars.as_str());
                    }
                } else {
                    out.push_str(lat);
                }
            }
            None => out.push(c),
        }
    }
    out
}

const fn cyrillic_to_latin(c: char) -> Option<&'static str> {
    Some(match c {
        'а' => "a",
        'б' => "b",
        'в' => "v",
        'г' => "g",
        'д' => "d",
        'е' => "e",
        'ё' => "yo",
        'ж' => "zh",
        'з' => "z",
        'и' => "i",
        'й' => "y",
        'к' => "k",
        'л' => "l",
        'м' => "m",
        'н' => "n",
        'о' => "o",
        'п' => "p",
        'р' => "r",
        'с' => "s",
        'т' => "t",
        'у' => "u",
        'ф' => "f",
        'х' => "h",
        'ц' => "ts",
        'ч' => "ch",
        'ш' => "sh",
        'щ' => "sch",
        'ъ' => "",
        'ы' => "y",
        'ь' => "",
        'э' => "e",
        'ю' => "yu",
        'я' => "ya",
        _ => return None,
    })
}

/// Resolve `candidate` against `root` and require the result to stay inside
/// `root`. The check is lexical so it also covers paths that do not exist yet.
pub fn ensure_within_root(root: &Path, candidate: &Path) -> Result<PathBuf> {
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        root.join(candidate)
    };

    let mut resolved = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !resolved.pop() {
                    return Err(Error::integrity(format!(
                        "path '{}' escapes the storage root",
                        candidate.display()
                    )));
                }
            }
            other => resolved.push(other),
        }
    }

    if resolved.starts_with(root) {
        Ok(resolved)
    } else {
        Err(Error::integrity(format!(
            "path '{}' escapes the storage root",
            candidate.display()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_charset() {
        assert!(validate_device_id("tv1").is_ok());
        assert!(validate_device_id("lobby-screen_2").is_ok());
        assert!(validate_device_id("").is_err());
        assert!(validate_device_id("../etc").is_err());
        assert!(validate_device_id("tv 1").is_err());
        assert!(validate_device_id(&"x".repeat(DEVICE_ID_MAX + 1)).is_err());
    }

    #[test]
    fn safe_filename_keeps_extension() {
        assert_eq!(safe_filename("My Movie (final).MP4"), "My_Movie_final.mp4");
        assert_eq!(safe_filename("weird///name.png"), "weird_name.png");
    }

    #[test]
    fn safe_filename_transliterates() {
        assert_eq!(safe_filename("Привет мир.pdf"), "Privet_mir.pdf");
        assert_eq!(transliterate("щука"), "schuka");
    }

    #[test]
    fn safe_filename_falls_back_when_empty() {
        let name = safe_filename("???.mp4");
        assert!(name.starts_with("file_"));
        assert!(name.ends_with(".mp4"));
    }

    #[test]
    fn system_entries_detected() {
        assert!(is_system_entry("default.png"));
        assert!(is_system_entry(".optimizing_1700000000.mp4"));
        assert!(is_system_entry(".tmp_default_1700000000.png"));
        assert!(is_system_entry(".hidden"));
        assert!(!is_system_entry("movie.mp4"));
    }

    #[test]
    fn path_guard_blocks_escapes() {
        let root = Path::new("/srv/wallcast");
        assert!(ensure_within_root(root, Path::new("tv1/movie.mp4")).is_ok());
        assert!(ensure_within_root(root, Path::new("tv1/../../etc/passwd")).is_err());
        assert!(ensure_within_root(root, Path::new("/etc/passwd")).is_err());
    }
}
