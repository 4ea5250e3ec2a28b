//! Path normalization
//!
//! Expands a leading `~`, then collapses `.` and `..` components lexically
//! without touching the filesystem. `abspath` additionally anchors relative
//! paths at the current directory.

use std::path::{Component, Path, PathBuf};

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

/// Expand `~` and normalize `.`/`..` components
pub fn normpath(path: impl AsRef<Path>) -> PathBuf {
    let expanded = expand_home(path.as_ref());

    let mut out = PathBuf::new();
    for component in expanded.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            other => out.push(other.as_os_str()),
        }
    }

    if out.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        out
    }
}

/// `normpath`, with relative paths resolved against the current directory.
///
/// Job scripts and child processes run elsewhere, so every path handed to
/// them must be absolute.
pub fn abspath(path: impl AsRef<Path>) -> PathBuf {
    let expanded = expand_home(path.as_ref());
    if expanded.is_absolute() {
        return normpath(expanded);
    }
    match std::env::current_dir() {
        Ok(cwd) => normpath(cwd.join(expanded)),
        Err(_) => normpath(expanded),
    }
}
