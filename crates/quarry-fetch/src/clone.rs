//! Clone subsystem: source checkouts via git children, not transfers.
//!
//! A clone request never touches the transfer driver. The subsystem spawns
//! a git child against the constructed repository URL, hands the pid to the
//! reactor for a child-exit watch, and lets the exit status drive the
//! completion.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use tracing::debug;

use quarry_fetch_core::error::{FetchError, FetchResult};
use quarry_fetch_core::model::{CloneAction, CloneRequest, DebugMode};
use quarry_fetch_core::reactor::ChildPid;

/// A spawned clone child awaiting its exit watch.
pub(crate) struct CloneChild {
    pub(crate) child: Child,
    pub(crate) pid: ChildPid,
    pub(crate) action: CloneAction,
    pub(crate) workdir: PathBuf,
}

pub(crate) fn clone_url(base: &str, name: &str) -> String {
    format!("{base}/{name}.git")
}

/// Spawn the git child for `request`. An existing checkout is fast-forward
/// updated instead of recloned.
pub(crate) fn spawn(
    git: &Path,
    base: &str,
    request: &CloneRequest,
    debug_mode: &DebugMode,
) -> FetchResult<CloneChild> {
    if request.name.is_empty() {
        return Err(FetchError::Configuration {
            detail: "clone request needs a package name".to_owned(),
        });
    }
    let workdir = request
        .workdir
        .clone()
        .unwrap_or_else(|| PathBuf::from(&request.name));
    let url = clone_url(base, &request.name);
    let action = if workdir.join(".git").exists() {
        CloneAction::Updated
    } else {
        CloneAction::Cloned
    };

    let mut command = Command::new(git);
    match action {
        CloneAction::Cloned => {
            command
                .arg("clone")
                .arg("--quiet")
                .arg("--depth=1")
                .arg(&url)
                .arg(&workdir);
        }
        CloneAction::Updated => {
            command
                .arg("-C")
                .arg(&workdir)
                .arg("pull")
                .arg("--quiet")
                .arg("--ff-only");
        }
    }
    command.stdin(Stdio::null());
    if matches!(debug_mode, DebugMode::Off) {
        command.stdout(Stdio::null()).stderr(Stdio::null());
    }

    let child = command.spawn().map_err(|source| FetchError::Io {
        operation: "spawn git",
        source,
    })?;
    let pid = ChildPid::new(child.id() as i32);
    debug!(url = %url, workdir = %workdir.display(), ?action, "clone child spawned");
    Ok(CloneChild {
        child,
        pid,
        action,
        workdir,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn repository_urls_end_in_dot_git() {
        assert_eq!(
            clone_url("https://quarry.example.org", "demo"),
            "https://quarry.example.org/demo.git"
        );
    }

    #[test]
    fn empty_names_are_rejected_before_spawning() {
        let request = CloneRequest {
            name: String::new(),
            workdir: None,
        };
        assert!(matches!(
            spawn(Path::new("git"), "https://quarry.example.org", &request, &DebugMode::Off),
            Err(FetchError::Configuration { .. })
        ));
    }

    #[test]
    fn existing_checkouts_are_updated() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let workdir = dir.path().join("demo");
        std::fs::create_dir_all(workdir.join(".git"))?;

        let request = CloneRequest {
            name: "demo".into(),
            workdir: Some(workdir.clone()),
        };
        let mut spawned = spawn(
            Path::new("true"),
            "https://quarry.example.org",
            &request,
            &DebugMode::Off,
        )?;
        assert_eq!(spawned.action, CloneAction::Updated);
        assert_eq!(spawned.workdir, workdir);
        spawned.child.wait()?;
        Ok(())
    }

    #[test]
    fn missing_checkouts_are_cloned() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let request = CloneRequest {
            name: "demo".into(),
            workdir: Some(dir.path().join("fresh")),
        };
        let mut spawned = spawn(
            Path::new("true"),
            "https://quarry.example.org",
            &request,
            &DebugMode::Off,
        )?;
        assert_eq!(spawned.action, CloneAction::Cloned);
        spawned.child.wait()?;
        Ok(())
    }
}
