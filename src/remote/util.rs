//! Path helpers for local key material.

use camino::Utf8PathBuf;

/// Expands a leading `~/` prefix to the user's home directory.
///
/// When `HOME` is unset the path is returned unchanged.
///
/// # Examples
///
/// ```
/// # use blockprep::remote::expand_tilde;
/// assert_eq!(expand_tilde("/absolute/key.pem"), "/absolute/key.pem");
/// ```
#[must_use]
pub fn expand_tilde(path: &str) -> Utf8PathBuf {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return Utf8PathBuf::from(format!("{}/{rest}", home.to_string_lossy()));
    }
    Utf8PathBuf::from(path)
}
