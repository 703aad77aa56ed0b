//! Key/filename codec and small filesystem helpers.
//!
//! User keys are mapped to filesystem-safe names either by URL-safe base64
//! without padding (the default) or verbatim after validation (plain mode).
//! Encoding an invalid plain-mode key is a programmer error and panics;
//! decoding an invalid on-disk name returns an error so foreign files found
//! during a reload are tolerated and skipped.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Characters that may not appear in a plain-mode key, based on the common
/// denominator of filesystem filename restrictions.
const BAD_KEY_CHARS: &[char] = &[
    '\0', '\u{ff}', '/', '\\', ':', '%', '?', '*', '|', '"', '>', '<',
];

/// An on-disk name that does not decode to a valid user key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct InvalidName;

/// Encodes a user key to its on-disk filename (URL-safe base64, no padding).
pub(crate) fn encode_name(key: &str) -> String {
    URL_SAFE_NO_PAD.encode(key.as_bytes())
}

/// Decodes an on-disk filename back to the user key.
pub(crate) fn decode_name(name: &str) -> Result<String, InvalidName> {
    let bytes = URL_SAFE_NO_PAD.decode(name).map_err(|_| InvalidName)?;
    String::from_utf8(bytes).map_err(|_| InvalidName)
}

/// Panics if `key` cannot be used verbatim as a filename.
///
/// This is a programmer error: a process feeding hostile key names into a
/// plain-file-names database must not continue. The literal keys `.` and
/// `..` are accepted.
pub(crate) fn check_valid_key(key: &str) {
    if key == "." || key == ".." {
        return;
    }
    if key.contains(BAD_KEY_CHARS) {
        panic!("{key:?} uses an invalid character (one of {BAD_KEY_CHARS:?})");
    }
}

/// Non-panicking variant of [`check_valid_key`] for the decode direction.
pub(crate) fn validate_plain(name: &str) -> Result<(), InvalidName> {
    if name == "." || name == ".." {
        return Ok(());
    }
    if name.contains(BAD_KEY_CHARS) {
        return Err(InvalidName);
    }
    Ok(())
}

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Returns a unique temp-file path next to `path`: `<path>.tmp.<hex>`.
///
/// The suffix comes from a process-wide monotonic counter, so concurrent
/// writers of the same key never collide.
pub(crate) fn tmp_file_name(path: &Path) -> PathBuf {
    let n = TMP_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
    let mut os = path.as_os_str().to_owned();
    os.push(format!(".tmp.{n:x}"));
    PathBuf::from(os)
}

/// Returns `true` if a directory entry name must never be treated as a key:
/// dotfiles (metadata, hidden files) and temp-file residue.
pub(crate) fn is_reserved_name(name: &str) -> bool {
    name.is_empty() || name.starts_with('.') || name.contains(".tmp.")
}

/// Lists a directory once, partitioned into regular files and
/// subdirectories. Reserved names and entries with non-UTF-8 names are
/// skipped.
pub(crate) fn ls_dir(dir: &Path) -> io::Result<(Vec<(String, fs::Metadata)>, Vec<String>)> {
    let mut files = Vec::new();
    let mut dirs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = match entry.file_name().into_string() {
            Ok(name) => name,
            Err(_) => continue,
        };
        if is_reserved_name(&name) {
            continue;
        }
        let stat = entry.metadata()?;
        if stat.is_dir() {
            dirs.push(name);
        } else if stat.is_file() {
            files.push((name, stat));
        }
    }
    Ok((files, dirs))
}

/// Current wall-clock time in whole seconds since the Unix epoch.
pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Reads the process file-descriptor limit, falling back to `fallback` if
/// the limit cannot be queried.
#[cfg(unix)]
pub(crate) fn rlimit_max_open(fallback: usize) -> usize {
    let mut rl = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: getrlimit only writes into the struct we hand it.
    let rc = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rl) };
    if rc != 0 {
        warn!(
            "error getting RLIMIT_NOFILE: {}, defaulting to {fallback}",
            io::Error::last_os_error()
        );
        return fallback;
    }
    rl.rlim_cur as usize
}

#[cfg(not(unix))]
pub(crate) fn rlimit_max_open(fallback: usize) -> usize {
    fallback
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn encoded_names_are_filesystem_safe() {
        let enc = encode_name("a/b\\c:d%e?f");
        assert!(enc
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert_eq!(decode_name("not base64!"), Err(InvalidName));
        // Valid base64 of invalid UTF-8.
        let enc = URL_SAFE_NO_PAD.encode([0xff, 0xfe]);
        assert_eq!(decode_name(&enc), Err(InvalidName));
    }

    #[test]
    #[should_panic(expected = "invalid character")]
    fn plain_mode_rejects_separators() {
        check_valid_key("a/b");
    }

    #[test]
    fn plain_mode_allows_dot_keys() {
        check_valid_key(".");
        check_valid_key("..");
        assert!(validate_plain(".").is_ok());
        assert!(validate_plain("a:b").is_err());
    }

    #[test]
    fn tmp_names_are_unique_and_reserved() {
        let a = tmp_file_name(Path::new("/x/key"));
        let b = tmp_file_name(Path::new("/x/key"));
        assert_ne!(a, b);
        let name = a.file_name().unwrap().to_str().unwrap();
        assert!(is_reserved_name(name) || name.contains(".tmp."));
    }

    #[test]
    fn reserved_names() {
        assert!(is_reserved_name(".meta"));
        assert!(is_reserved_name(".meta.tmp"));
        assert!(is_reserved_name("key.tmp.1f"));
        assert!(!is_reserved_name("key"));
    }

    proptest! {
        #[test]
        fn encode_decode_roundtrip(key in "\\PC{0,64}") {
            let enc = encode_name(&key);
            prop_assert!(enc.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
            prop_assert_eq!(decode_name(&enc).unwrap(), key);
        }
    }
}
