//! Remote path helpers. Remote paths are always `/`-separated strings,
//! independent of the local platform.

/// Collapse repeated slashes and strip trailing ones, so `/a`, `/a/` and
/// `//a//` all name the same directory. The root stays `/`; an empty path
/// means the remote working directory (`.`).
pub fn normalize_remote_path(path: &str) -> String {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return ".".to_string();
    }

    let absolute = trimmed.starts_with('/');
    let parts: Vec<&str> = trimmed.split('/').filter(|s| !s.is_empty()).collect();

    match (absolute, parts.is_empty()) {
        (true, true) => "/".to_string(),
        (true, false) => format!("/{}", parts.join("/")),
        (false, true) => ".".to_string(),
        (false, false) => parts.join("/"),
    }
}

/// Join a (normalised) directory with a child name.
pub fn join_remote(dir: &str, name: &str) -> String {
    match dir {
        "/" => format!("/{name}"),
        "." => name.to_string(),
        _ => format!("{dir}/{name}"),
    }
}

/// Last path component, or the path itself when it has none.
pub fn file_name(path: &str) -> &str {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or(path)
}
