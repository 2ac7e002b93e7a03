//! Guessing which environment variable a script reads its token from.
//!
//! This is a text heuristic, not a parser. It can miss declarations or pick
//! up one inside a comment; the default name covers the misses.

use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

/// Variable name used when nothing better is found.
pub const DEFAULT_SECRET_VAR: &str = "BOT_TOKEN";

fn declaration_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r#"(?i)\b(TELEGRAM_BOT_TOKEN|BOT_TOKEN|TOKEN)\s*=\s*['"][^'"]+['"]"#).ok()
        })
        .as_ref()
}

/// Name of the first recognised `NAME = "literal"` declaration in `source`,
/// spelled as it appears there.
#[must_use]
pub fn find_secret_var(source: &str) -> Option<String> {
    declaration_pattern()?
        .captures(source)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_owned())
}

/// Secret variable name for the entry point at `path`.
///
/// Read or decode failures fall back to [`DEFAULT_SECRET_VAR`].
#[must_use]
pub fn resolve_secret_var(path: &Path) -> String {
    match fs::read_to_string(path) {
        Ok(source) => find_secret_var(&source).unwrap_or_else(|| DEFAULT_SECRET_VAR.to_owned()),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "could not read entry point, using default secret var");
            DEFAULT_SECRET_VAR.to_owned()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_known_names() {
        assert_eq!(
            find_secret_var("BOT_TOKEN = 'abc:123'\n").as_deref(),
            Some("BOT_TOKEN")
        );
        assert_eq!(
            find_secret_var("import os\nTELEGRAM_BOT_TOKEN=\"x\"").as_deref(),
            Some("TELEGRAM_BOT_TOKEN")
        );
        assert_eq!(find_secret_var("token = \"x\"").as_deref(), Some("token"));
    }

    #[test]
    fn ignores_lookalikes() {
        assert_eq!(find_secret_var("MY_BOT_TOKEN = 'x'"), None);
        assert_eq!(find_secret_var("TOKEN = os.environ['TOKEN']"), None);
        assert_eq!(find_secret_var("TOKENS = 'x'"), None);
        assert_eq!(find_secret_var("print('hello')"), None);
    }

    #[test]
    fn unreadable_or_binary_files_use_default() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(resolve_secret_var(&dir.path().join("missing.py")), DEFAULT_SECRET_VAR);

        let binary = dir.path().join("bin.py");
        fs::write(&binary, [0xff, 0xfe, 0x00, 0x80]).unwrap();
        assert_eq!(resolve_secret_var(&binary), DEFAULT_SECRET_VAR);
    }

    #[test]
    fn reads_declaration_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let main = dir.path().join("main.py");
        fs::write(&main, "TOKEN = \"123:abc\"\nrun(TOKEN)\n").unwrap();
        assert_eq!(resolve_secret_var(&main), "TOKEN");
    }
}
