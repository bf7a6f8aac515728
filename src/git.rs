use crate::error::Error;
use crate::project::Project;
use git2::Repository;
use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;
use std::str::FromStr;
use tokio::process::Command;
use url::Url;

#[derive(Debug, PartialEq, Copy, Clone)]
pub enum CloneMethod {
    Ssh,
    Https,
}

impl FromStr for CloneMethod {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "https" => Ok(CloneMethod::Https),
            "ssh" => Ok(CloneMethod::Ssh),
            _ => Err("expected `https` or `ssh`"),
        }
    }
}

/// Embeds `oauth2:<token>` into http(s) URLs. Anything else is returned as is.
pub fn authenticated_url(repo_url: &str, token: &str) -> Result<String, Error> {
    let mut url = match Url::parse(repo_url) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => url,
        _ => return Ok(repo_url.to_owned()),
    };
    url.set_username("oauth2")
        .and_then(|_| url.set_password(Some(token)))
        .map_err(|_| Error::Clone(format!("cannot embed credentials into {}", repo_url)))?;
    Ok(url.to_string())
}

/// A remote to mirror from. `auth_url` may carry the token: it is only
/// ever handed to `git` and never logged, stored or reported.
#[derive(Clone)]
pub struct Remote {
    pub url: String,
    auth_url: String,
    token: Option<String>,
}

impl Remote {
    pub fn new(url: &str, token: Option<&str>) -> Result<Self, Error> {
        let auth_url = match token {
            Some(token) => authenticated_url(url, token)?,
            None => url.to_owned(),
        };
        Ok(Remote {
            url: url.to_owned(),
            auth_url,
            token: token.map(str::to_owned),
        })
    }

    pub fn for_project(project: &Project, method: CloneMethod, token: &str) -> Result<Self, Error> {
        match method {
            CloneMethod::Https => Remote::new(&project.http_url_to_repo, Some(token)),
            CloneMethod::Ssh => match &project.ssh_url_to_repo {
                Some(ssh_url) => Remote::new(ssh_url, None),
                None => Err(Error::Clone(format!(
                    "project {} has no ssh url",
                    project.path_with_namespace
                ))),
            },
        }
    }

    /// GitLab serves the wiki next to the repository as `<repo>.wiki.git`.
    pub fn wiki(&self) -> Result<Self, Error> {
        let base = self.url.strip_suffix(".git").unwrap_or(&self.url);
        Remote::new(&format!("{}.wiki.git", base), self.token.as_deref())
    }

    fn redact(&self, text: &str) -> String {
        let text = text.replace(&self.auth_url, &self.url);
        match &self.token {
            Some(token) if !token.is_empty() => text.replace(token.as_str(), "***"),
            _ => text,
        }
    }
}

async fn run_git(
    remote: &Remote,
    cwd: Option<&Path>,
    subcommand: &str,
    args: &[&OsStr],
) -> Result<(), Error> {
    let mut command = Command::new("git");
    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }
    let output = command
        .arg(subcommand)
        .args(args)
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| Error::Clone(format!("failed to execute git: {}", e)))?;

    let stderr = String::from_utf8_lossy(&output.stderr);
    if !output.status.success() {
        return Err(Error::Clone(format!(
            "git {} from {} exited with {}: {}",
            subcommand,
            remote.url,
            output.status,
            remote.redact(stderr.trim())
        )));
    }
    log::debug!(
        "git {} from {}: {}",
        subcommand,
        remote.url,
        remote.redact(stderr.trim())
    );
    Ok(())
}

/// `git clone --mirror` into `dest`, then strip credentials from the stored
/// origin URL.
pub async fn mirror_clone(remote: &Remote, dest: &Path) -> Result<(), Error> {
    log::debug!("Mirroring {} into {:?}", remote.url, dest);
    run_git(
        remote,
        None,
        "clone",
        &[
            OsStr::new("--mirror"),
            OsStr::new(&remote.auth_url),
            dest.as_os_str(),
        ],
    )
    .await?;
    set_origin_url(dest, &remote.url)
}

/// Brings an existing mirror up to date with every ref of `remote`.
pub async fn refresh_mirror(remote: &Remote, dest: &Path) -> Result<(), Error> {
    log::debug!("Refreshing mirror {:?} from {}", dest, remote.url);
    run_git(
        remote,
        Some(dest),
        "fetch",
        &[
            OsStr::new("--prune"),
            OsStr::new(&remote.auth_url),
            OsStr::new("+refs/*:refs/*"),
        ],
    )
    .await
}

pub fn set_origin_url(repo_path: &Path, url: &str) -> Result<(), Error> {
    let repo = Repository::open_bare(repo_path)?;
    repo.remote_set_url("origin", url)?;
    Ok(())
}

/// A bare repository created by `git clone --mirror`.
pub fn is_mirror(repo_path: &Path) -> bool {
    Repository::open_bare(repo_path)
        .and_then(|repo| repo.config())
        .and_then(|config| config.get_bool("remote.origin.mirror"))
        .unwrap_or(false)
}

/// No refs at all, i.e. the remote had nothing to mirror.
pub fn has_no_refs(repo_path: &Path) -> Result<bool, Error> {
    let repo = Repository::open_bare(repo_path)?;
    let mut refs = repo.references()?;
    let empty = refs.next().is_none();
    Ok(empty)
}
