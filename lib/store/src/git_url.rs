//! Access-token injection for repository URLs handed to agent containers.

/// Inserts an access token into an HTTPS git URL.
///
/// `https://github.com/user/repo.git` becomes
/// `https://TOKEN@github.com/user/repo.git`. Existing userinfo is
/// replaced, the `@` scan stops at the first `/` so `@` characters in the
/// path are never mistaken for credentials, and non-HTTPS (SSH-style)
/// URLs pass through untouched. Applying the rewrite twice with the same
/// token yields the same URL.
#[must_use]
pub fn inject_token_into_url(raw_url: &str, token: &str) -> String {
    const HTTPS_PREFIX: &str = "https://";
    if !raw_url.to_lowercase().starts_with(HTTPS_PREFIX) {
        return raw_url.to_string();
    }

    let mut rest = &raw_url[HTTPS_PREFIX.len()..];
    if let Some(at_idx) = index_of_userinfo_end(rest) {
        rest = &rest[at_idx + 1..];
    }
    format!("{HTTPS_PREFIX}{token}@{rest}")
}

/// Finds the `@` terminating a userinfo component, if any.
///
/// The scan stops at the first `/`: an `@` after the host portion belongs
/// to the path.
fn index_of_userinfo_end(s: &str) -> Option<usize> {
    for (i, b) in s.bytes().enumerate() {
        match b {
            b'@' => return Some(i),
            b'/' => return None,
            _ => {}
        }
    }
    None
}
