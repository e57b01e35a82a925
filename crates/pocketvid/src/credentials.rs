use std::fs;
use std::path::Path;
use log::debug;

/// Session cookie names that indicate a logged-in export
const SESSION_TOKENS: &[&str] = &[
    "SID",
    "HSID",
    "SSID",
    "APISID",
    "SAPISID",
    "__Secure-1PSID",
    "__Secure-3PSID",
    "LOGIN_INFO",
];

const DOMAIN_MARKER: &str = "youtube.com";

/// Whether `path` looks like a usable cookie export.
///
/// Only a structural check: the file exists, is non-empty, mentions the
/// expected domain and carries at least one known session token. Nothing
/// else in the file is interpreted.
pub fn cookies_usable(path: &Path) -> bool {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => return false,
    };
    if content.trim().is_empty() {
        debug!("Cookie file {} is empty", path.display());
        return false;
    }
    if !content.contains(DOMAIN_MARKER) {
        debug!("Cookie file {} has no {} entries", path.display(), DOMAIN_MARKER);
        return false;
    }
    let has_token = content
        .lines()
        .filter(|line| !line.trim_start().starts_with('#') || line.starts_with("#HttpOnly_"))
        .any(|line| line.split('\t').any(|field| SESSION_TOKENS.contains(&field.trim())));
    if !has_token {
        debug!("Cookie file {} has no session tokens", path.display());
    }
    has_token
}

/// The cookie file to pass to the acquisition tool, if usable
pub fn usable_cookies(path: &Path) -> Option<&Path> {
    cookies_usable(path).then_some(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &tempfile::TempDir, content: &str) -> std::path::PathBuf {
        let path = dir.path().join("cookies.txt");
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn netscape_export_with_session_token_is_usable() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            "# Netscape HTTP Cookie File\n.youtube.com\tTRUE\t/\tTRUE\t1999999999\tSAPISID\tabc123\n",
        );
        assert!(cookies_usable(&path));
        assert_eq!(usable_cookies(&path), Some(path.as_path()));
    }

    #[test]
    fn http_only_lines_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "#HttpOnly_.youtube.com\tTRUE\t/\tTRUE\t0\t__Secure-3PSID\tx\n");
        assert!(cookies_usable(&path));
    }

    #[test]
    fn missing_empty_or_foreign_files_are_not_usable() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!cookies_usable(&dir.path().join("absent.txt")));
        assert!(!cookies_usable(&write(&dir, "   \n")));
        assert!(!cookies_usable(&write(&dir, ".example.com\tTRUE\t/\tTRUE\t0\tSID\tx\n")));
        assert!(!cookies_usable(&write(&dir, ".youtube.com\tTRUE\t/\tTRUE\t0\tPREF\tx\n")));
    }
}
