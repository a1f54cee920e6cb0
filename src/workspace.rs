use crate::{registry::LanguageProfile, submission::Submission, Error, Result};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tempdir::TempDir;

/// Readable and traversable by the sandbox identity, writable only by us.
fn read_only_dir_permissions() -> Option<fs::Permissions> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        Some(PermissionsExt::from_mode(0o755))
    }

    #[cfg(not(unix))]
    None
}

fn read_only_file_permissions() -> Option<fs::Permissions> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        Some(PermissionsExt::from_mode(0o644))
    }

    #[cfg(not(unix))]
    None
}

/// Staging directory holding exactly one submission's source and input.
#[derive(Debug)]
pub struct Workspace {
    scratch: Option<TempDir>,
    path: PathBuf,
    source_file: PathBuf,
    input_file: PathBuf,
}

impl Workspace {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn source_file(&self) -> &Path {
        &self.source_file
    }

    pub fn input_file(&self) -> &Path {
        &self.input_file
    }

    /// Removes the directory. Calling this again is a no-op.
    pub fn teardown(&mut self) -> Result<()> {
        match self.scratch.take() {
            Some(scratch) => {
                scratch
                    .close()
                    .map_err(|e| Error::UnableToRemoveWorkspace { source: e })?;
                log::debug!("Removed workspace {}", self.path.display());
                Ok(())
            }
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkspaceBuilder {
    root: PathBuf,
}

impl WorkspaceBuilder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        WorkspaceBuilder { root: root.into() }
    }

    /// Stages the submission's files. A failure partway through removes
    /// whatever was already written.
    pub fn build(&self, submission: &Submission, profile: &LanguageProfile) -> Result<Workspace> {
        fs::create_dir_all(&self.root).map_err(|e| Error::UnableToCreateWorkspace { source: e })?;

        let prefix = format!("submission-{}", submission.id());
        let scratch = TempDir::new_in(&self.root, &prefix)
            .map_err(|e| Error::UnableToCreateWorkspace { source: e })?;

        let path = scratch.path().to_path_buf();
        let mut workspace = Workspace {
            source_file: path.join(&profile.source_file),
            input_file: path.join(&profile.input_file),
            scratch: Some(scratch),
            path,
        };

        if let Err(e) = populate(&workspace, submission) {
            if let Err(cleanup) = workspace.teardown() {
                log::warn!(
                    "Unable to remove partial workspace {}: {}",
                    workspace.path.display(),
                    cleanup
                );
            }
            return Err(e);
        }

        log::debug!(
            "Staged {} bytes of source and {} bytes of input in {}",
            submission.source().len(),
            submission.stdin().len(),
            workspace.path.display()
        );
        Ok(workspace)
    }
}

fn populate(workspace: &Workspace, submission: &Submission) -> Result<()> {
    fs::write(&workspace.source_file, submission.source())
        .map_err(|e| Error::UnableToWriteSource { source: e })?;
    fs::write(&workspace.input_file, submission.stdin())
        .map_err(|e| Error::UnableToWriteInput { source: e })?;

    if let Some(perms) = read_only_file_permissions() {
        for file in &[&workspace.source_file, &workspace.input_file] {
            fs::set_permissions(file, perms.clone())
                .map_err(|e| Error::UnableToSetWorkspacePermissions { source: e })?;
        }
    }

    if let Some(perms) = read_only_dir_permissions() {
        fs::set_permissions(&workspace.path, perms)
            .map_err(|e| Error::UnableToSetWorkspacePermissions { source: e })?;
    }

    Ok(())
}
