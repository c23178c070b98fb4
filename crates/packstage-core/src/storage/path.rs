//! POSIX-style path helpers shared by every backend.

/// Forward slashes only, no repeated separators. A leading and a trailing
/// slash are kept because backends give them meaning.
pub fn normalize(path: &str) -> String {
    let replaced = path.replace('\\', "/");
    let mut out = String::with_capacity(replaced.len());
    let mut previous_slash = false;
    for ch in replaced.chars() {
        if ch == '/' {
            if previous_slash {
                continue;
            }
            previous_slash = true;
        } else {
            previous_slash = false;
        }
        out.push(ch);
    }
    out
}

pub fn join(base: &str, name: &str) -> String {
    if base.is_empty() {
        return normalize(name);
    }
    if name.is_empty() {
        return normalize(base);
    }
    normalize(&format!(
        "{}/{}",
        base.trim_end_matches('/'),
        name.trim_start_matches('/')
    ))
}

/// Path of `path` relative to `base`, compared segment-wise.
///
/// Returns `None` when `path` is not below `base`, and an empty string when
/// both name the same location.
pub fn relative_to(path: &str, base: &str) -> Option<String> {
    let path = normalize(path);
    let base = normalize(base);
    let path = path.trim_end_matches('/');
    let base = base.trim_end_matches('/');
    if base.is_empty() {
        return Some(path.trim_start_matches('/').to_string());
    }
    if path == base {
        return Some(String::new());
    }
    path.strip_prefix(base)
        .and_then(|rest| rest.strip_prefix('/'))
        .map(str::to_string)
}

/// Last segment, ignoring a trailing slash.
pub fn file_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

/// Directory form with exactly one trailing slash; the empty path stays empty.
pub fn as_dir(path: &str) -> String {
    let path = normalize(path);
    if path.is_empty() || path.ends_with('/') {
        path
    } else {
        format!("{path}/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_separators() {
        assert_eq!(normalize(r"a\b//c/"), "a/b/c/");
        assert_eq!(normalize("//x"), "/x");
    }

    #[test]
    fn joins_segments() {
        assert_eq!(join("/a/", "/b"), "/a/b");
        assert_eq!(join("", "b"), "b");
        assert_eq!(join("a", ""), "a");
    }

    #[test]
    fn relative_paths() {
        assert_eq!(relative_to("/a/b/c", "/a").as_deref(), Some("b/c"));
        assert_eq!(relative_to("/a/b", "/a/b/").as_deref(), Some(""));
        assert_eq!(relative_to("/ab/c", "/a"), None);
        assert_eq!(relative_to("x/y", "").as_deref(), Some("x/y"));
    }

    #[test]
    fn file_names() {
        assert_eq!(file_name("a/b/c"), "c");
        assert_eq!(file_name("a/b/"), "b");
        assert_eq!(file_name("c"), "c");
    }
}
