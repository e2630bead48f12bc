//! Path helpers for local key and sync paths.

/// Expands a leading `~/` prefix to the user's home directory.
///
/// The input is returned unchanged when `HOME` is unset.
///
/// # Examples
///
/// ```
/// # use multyvac::ssh::expand_tilde;
/// assert_eq!(expand_tilde("/etc/multyvac"), "/etc/multyvac");
/// ```
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}

/// Joins a volume mount path and a relative path the way the remote
/// filesystem expects.
#[must_use]
pub fn join_remote(mount_path: &str, relative: &str) -> String {
    if relative.is_empty() {
        return mount_path.to_owned();
    }
    format!("{}/{relative}", mount_path.trim_end_matches('/'))
}
