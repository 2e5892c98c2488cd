// Utility Functions
// Workspace discovery and workflow file lookup

use crate::error::{EngineError, EngineResult};

use std::fs;
use std::path::{Path, PathBuf};

/// Directory holding workflow files, relative to the workspace
pub const WORKFLOWS_DIR: &str = ".github/workflows";

/// Walk up from `start` to the nearest directory containing `.git`.
pub fn find_repo_root(start: &Path) -> Option<PathBuf> {
    let start = start.canonicalize().ok()?;
    start
        .ancestors()
        .find(|ancestor| ancestor.join(".git").exists())
        .map(Path::to_path_buf)
}

/// Workspace for a run: the explicit directory when given, otherwise the
/// repository containing the current directory, otherwise the current
/// directory itself.
pub fn resolve_workspace(explicit: Option<&Path>) -> EngineResult<PathBuf> {
    if let Some(dir) = explicit {
        if !dir.is_dir() {
            return Err(EngineError::config(format!(
                "workspace '{}' is not a directory",
                dir.display()
            )));
        }
        return Ok(dir.canonicalize()?);
    }

    let cwd = std::env::current_dir()?;
    Ok(find_repo_root(&cwd).unwrap_or(cwd))
}

/// Resolve a workflow argument: an existing path, or a workflow name under
/// `.github/workflows` with or without extension.
pub fn locate_workflow(arg: &Path, workspace: &Path) -> EngineResult<PathBuf> {
    if arg.is_file() {
        return Ok(arg.to_path_buf());
    }

    let dir = workspace.join(WORKFLOWS_DIR);
    let candidates = [
        dir.join(arg),
        dir.join(arg).with_extension("yml"),
        dir.join(arg).with_extension("yaml"),
    ];
    candidates
        .into_iter()
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| {
            EngineError::config(format!(
                "workflow '{}' not found (looked in {})",
                arg.display(),
                dir.display()
            ))
        })
}

/// Workflow files of a workspace, sorted by path
pub fn list_workflows(workspace: &Path) -> EngineResult<Vec<PathBuf>> {
    let dir = workspace.join(WORKFLOWS_DIR);
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut files: Vec<PathBuf> = fs::read_dir(&dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.is_file()
                && matches!(
                    path.extension().and_then(|e| e.to_str()),
                    Some("yml") | Some("yaml")
                )
        })
        .collect();
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_repo_root_from_nested_dir() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path();
        fs::create_dir(root.join(".git")).unwrap();
        let sub = root.join("a").join("b").join("c");
        fs::create_dir_all(&sub).unwrap();

        assert_eq!(
            find_repo_root(&sub).unwrap(),
            root.canonicalize().unwrap()
        );
        assert_eq!(
            find_repo_root(root).unwrap(),
            root.canonicalize().unwrap()
        );
    }

    #[test]
    fn test_find_repo_root_nonexistent_path() {
        assert!(find_repo_root(Path::new("/nonexistent/path/that/does/not/exist")).is_none());
    }

    #[test]
    fn test_resolve_workspace() {
        let temp = tempfile::tempdir().unwrap();
        assert_eq!(
            resolve_workspace(Some(temp.path())).unwrap(),
            temp.path().canonicalize().unwrap()
        );

        let file = temp.path().join("file.txt");
        fs::write(&file, "").unwrap();
        assert!(matches!(
            resolve_workspace(Some(&file)),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn test_locate_and_list_workflows() {
        let temp = tempfile::tempdir().unwrap();
        let dir = temp.path().join(WORKFLOWS_DIR);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("ci.yml"), "").unwrap();
        fs::write(dir.join("release.yaml"), "").unwrap();
        fs::write(dir.join("notes.md"), "").unwrap();

        assert_eq!(
            locate_workflow(Path::new("ci"), temp.path()).unwrap(),
            dir.join("ci.yml")
        );
        assert_eq!(
            locate_workflow(Path::new("release"), temp.path()).unwrap(),
            dir.join("release.yaml")
        );
        assert!(locate_workflow(Path::new("missing"), temp.path()).is_err());

        let listed = list_workflows(temp.path()).unwrap();
        assert_eq!(listed, vec![dir.join("ci.yml"), dir.join("release.yaml")]);
    }
}
