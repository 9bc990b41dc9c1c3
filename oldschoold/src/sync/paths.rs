use std::path::{Component, Path, PathBuf};

use thiserror::Error;

/// Leading character of a reserved final segment; such keys are never mirrored.
pub const HIDDEN_MARKER: char = '_';
const AGENTS_SEGMENT: &str = "_agents";

#[derive(Debug, Error)]
pub enum PathError {
    #[error("namespace path is empty")]
    Empty,
    #[error("namespace path contains unsupported component: {0}")]
    UnsupportedComponent(String),
    #[error("{key} is outside the watched prefix {prefix}")]
    OutsidePrefix { key: String, prefix: String },
}

/// Leading slash, no trailing or doubled slashes; the root is `/`.
pub fn normalize_key(raw: &str) -> String {
    let segments: Vec<&str> = raw.split('/').filter(|s| !s.is_empty()).collect();
    format!("/{}", segments.join("/"))
}

pub fn is_hidden(key: &str) -> bool {
    key.rsplit('/')
        .find(|segment| !segment.is_empty())
        .is_some_and(|name| name.starts_with(HIDDEN_MARKER))
}

/// True when `key` or any of its ancestors below `base_key` is reserved, so live events
/// under a skipped snapshot subtree are skipped as well.
pub fn is_hidden_below(base_key: &str, key: &str) -> bool {
    let prefix = normalize_key(base_key);
    let key = normalize_key(key);
    let relative = if prefix == "/" {
        key.as_str()
    } else {
        match key.strip_prefix(&prefix) {
            Some(rest) if rest.is_empty() || rest.starts_with('/') => rest,
            _ => return is_hidden(&key),
        }
    };
    relative
        .split('/')
        .any(|segment| segment.starts_with(HIDDEN_MARKER))
}

pub fn checkpoint_key(base_key: &str, agent: &str) -> String {
    let base = normalize_key(base_key);
    let base = base.trim_end_matches('/');
    format!("{base}/{AGENTS_SEGMENT}/{HIDDEN_MARKER}{agent}")
}

pub fn lease_key(base_key: &str, agent: &str) -> String {
    format!("{}.lease", checkpoint_key(base_key, agent))
}

/// Maps a namespace key under `base_key` to its location under `base_dir`.
pub fn disk_path_for(base_dir: &Path, base_key: &str, key: &str) -> Result<PathBuf, PathError> {
    if key.is_empty() {
        return Err(PathError::Empty);
    }
    let prefix = normalize_key(base_key);
    let key = normalize_key(key);
    let relative = if key == prefix {
        ""
    } else if prefix == "/" {
        &key[1..]
    } else {
        key.strip_prefix(&prefix)
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(|| PathError::OutsidePrefix {
                key: key.clone(),
                prefix: prefix.clone(),
            })?
    };

    let mut out = base_dir.to_path_buf();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => continue,
            Component::RootDir | Component::ParentDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedComponent(key.clone()));
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_key_under_base_dir() {
        let root = PathBuf::from("/srv/mirror");
        let mapped = disk_path_for(&root, "/base", "/base/b/c").unwrap();
        assert_eq!(mapped, PathBuf::from("/srv/mirror/b/c"));
    }

    #[test]
    fn base_key_maps_to_base_dir() {
        let root = PathBuf::from("/srv/mirror");
        assert_eq!(disk_path_for(&root, "/base/", "/base").unwrap(), root);
    }

    #[test]
    fn root_prefix_maps_everything() {
        let root = PathBuf::from("/srv/mirror");
        let mapped = disk_path_for(&root, "/", "/etc/x").unwrap();
        assert_eq!(mapped, PathBuf::from("/srv/mirror/etc/x"));
    }

    #[test]
    fn rejects_sibling_with_shared_prefix() {
        let root = PathBuf::from("/srv/mirror");
        assert!(matches!(
            disk_path_for(&root, "/base", "/basement/x"),
            Err(PathError::OutsidePrefix { .. })
        ));
    }

    #[test]
    fn rejects_parent_dir() {
        let root = PathBuf::from("/srv/mirror");
        assert!(matches!(
            disk_path_for(&root, "/base", "/base/../secret"),
            Err(PathError::UnsupportedComponent(_))
        ));
    }

    #[test]
    fn hidden_keys_are_detected_by_final_segment() {
        assert!(is_hidden("/base/_agents/_agentA"));
        assert!(is_hidden("/base/_agents"));
        assert!(is_hidden("/base/_tmp/"));
        assert!(!is_hidden("/base/_agents/x"));
        assert!(!is_hidden("/base/a_b"));
        assert!(!is_hidden("/"));
    }

    #[test]
    fn hidden_ancestors_below_base_hide_descendants() {
        assert!(is_hidden_below("/base", "/base/_agents/x"));
        assert!(is_hidden_below("/base", "/base/_agents/_a.lease"));
        assert!(!is_hidden_below("/_cfg/base", "/_cfg/base/a"));
        assert!(!is_hidden_below("/base", "/base/a/b_c"));
        assert!(is_hidden_below("/", "/_agents/_a"));
    }

    #[test]
    fn checkpoint_and_lease_keys_live_under_agents() {
        assert_eq!(checkpoint_key("/base", "agentA"), "/base/_agents/_agentA");
        assert_eq!(checkpoint_key("base/", "a"), "/base/_agents/_a");
        assert_eq!(checkpoint_key("/", "a"), "/_agents/_a");
        assert_eq!(lease_key("/base", "a"), "/base/_agents/_a.lease");
    }
}
