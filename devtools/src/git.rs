use anyhow::Result;
use log::{info, warn};
use std::path::Path;

use crate::{
    errors::Error,
    process::{CommandLine, CommandRunner},
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RepositoryInfo {
    pub remote_url: Option<String>,
    pub name: String,
    pub commit: String,
}

impl RepositoryInfo {
    pub fn query(runner: &mut dyn CommandRunner, git: &str, repo_root: &Path) -> Result<Self> {
        let remote = CommandLine::new(git)
            .args(vec!["remote", "get-url", "origin"])
            .current_dir(repo_root);
        let remote = runner.capture(&remote)?;

        let remote_url = if remote.success() {
            Some(remote.output.trim().to_owned()).filter(|url| !url.is_empty())
        } else {
            info!("{} has no origin remote", repo_root.display());
            None
        };

        let commit_command = CommandLine::new(git)
            .args(vec!["rev-parse", "HEAD"])
            .current_dir(repo_root);
        let commit = runner.capture(&commit_command)?;
        commit.check(&commit_command)?;

        if !commit.errors.is_empty() {
            warn!("{}: {}", commit_command, commit.errors.trim());
        }

        let commit = commit.output.trim().to_owned();
        if commit.is_empty() || !commit.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::Precondition(format!(
                "could not determine the current commit of '{}' from '{}'",
                repo_root.display(),
                commit
            ))
            .into());
        }

        let name = match remote_url.as_deref().and_then(repository_name) {
            Some(name) => name,
            None => repo_root
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .ok_or_else(|| {
                    Error::Precondition(format!(
                        "could not determine the repository name of '{}'",
                        repo_root.display()
                    ))
                })?,
        };

        Ok(RepositoryInfo {
            remote_url,
            name,
            commit,
        })
    }
}

/// `https://github.com/owner/Repo.git` and `git@github.com:owner/Repo`
/// both name `Repo`.
fn repository_name(remote_url: &str) -> Option<String> {
    let trimmed = remote_url.trim_end_matches('/');
    let last = trimmed.rsplit(|c| c == '/' || c == ':').next()?;
    let name = last.strip_suffix(".git").unwrap_or(last);

    if name.is_empty() {
        None
    } else {
        Some(name.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{testing::RecordingRunner, CommandResult};

    #[test]
    fn names_from_remote_urls() {
        assert_eq!(
            repository_name("https://github.com/owner/Repo.git").as_deref(),
            Some("Repo")
        );
        assert_eq!(
            repository_name("git@github.com:owner/DevTools").as_deref(),
            Some("DevTools")
        );
        assert_eq!(repository_name("/srv/git/tools/").as_deref(), Some("tools"));
        assert_eq!(repository_name(""), None);
    }

    #[test]
    fn queries_remote_and_commit() {
        let mut runner = RecordingRunner::default()
            .respond("remote get-url", 0, "https://github.com/owner/Repo.git\n")
            .respond("rev-parse", 0, "ABC123\n");

        let info = RepositoryInfo::query(&mut runner, "git", Path::new("/work/checkout")).unwrap();

        assert_eq!(
            info,
            RepositoryInfo {
                remote_url: Some("https://github.com/owner/Repo.git".into()),
                name: "Repo".into(),
                commit: "ABC123".into(),
            }
        );
        assert_eq!(
            runner.rendered(),
            vec!["git remote get-url origin", "git rev-parse HEAD"]
        );
    }

    #[test]
    fn falls_back_to_the_directory_name() {
        let mut runner = RecordingRunner::default()
            .respond("remote get-url", 2, "error: No such remote 'origin'\n")
            .respond("rev-parse", 0, "abc\n");

        let info = RepositoryInfo::query(&mut runner, "git", Path::new("/work/checkout")).unwrap();

        assert_eq!(info.remote_url, None);
        assert_eq!(info.name, "checkout");
    }

    #[test]
    fn warnings_stay_out_of_the_commit() {
        let mut runner = RecordingRunner::default().respond_with(
            "rev-parse",
            CommandResult {
                code: 0,
                output: "abc123def\n".into(),
                errors: "warning: refname 'HEAD' is ambiguous.\n".into(),
            },
        );

        let info = RepositoryInfo::query(&mut runner, "git", Path::new("/work/checkout")).unwrap();

        assert_eq!(info.commit, "abc123def");
    }

    #[test]
    fn non_hash_commit_output_is_an_error() {
        let mut runner = RecordingRunner::default().respond("rev-parse", 0, "HEAD\nmain\n");

        let err = RepositoryInfo::query(&mut runner, "git", Path::new("/work/checkout")).unwrap_err();

        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::Precondition(_))
        ));
    }

    #[test]
    fn missing_commit_is_an_error() {
        let mut runner = RecordingRunner::default().respond("rev-parse", 128, "fatal\n");

        assert!(RepositoryInfo::query(&mut runner, "git", Path::new("/work/checkout")).is_err());
    }
}
