use crate::error::Error;
use crate::git::{self, CloneMethod, Remote};
use crate::gitlab::GitlabClient;
use crate::project::{ArchiveResult, ArchiveStatus, Project};
use chrono::{SecondsFormat, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use std::fs::File;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArchiveOptions {
    pub clone_method: CloneMethod,
    pub dry_run: bool,
    pub with_metadata: bool,
    pub with_wiki: bool,
    pub compress: bool,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        ArchiveOptions {
            clone_method: CloneMethod::Https,
            dry_run: false,
            with_metadata: false,
            with_wiki: false,
            compress: false,
        }
    }
}

#[derive(Serialize)]
struct ArchiveReadme<'a> {
    id: u64,
    path_with_namespace: &'a str,
    name: Option<&'a str>,
    web_url: Option<&'a str>,
    default_branch: Option<&'a str>,
    archived_at: String,
}

pub struct Archiver {
    outdir: PathBuf,
    token: String,
    options: ArchiveOptions,
}

impl Archiver {
    pub fn new(outdir: impl Into<PathBuf>, token: impl Into<String>, options: ArchiveOptions) -> Self {
        Archiver {
            outdir: outdir.into(),
            token: token.into(),
            options,
        }
    }

    /// Archives one project. Failures are captured in the result and never
    /// escape, so the caller can move on to the next project.
    pub async fn archive(&self, client: &GitlabClient, project: Project) -> ArchiveResult {
        let output_path = self.outdir.join(project.archive_dir_name());
        let mut messages = Vec::new();
        let status = match self
            .archive_project(client, &project, &output_path, &mut messages)
            .await
        {
            Ok(status) => status,
            Err(e) => {
                log::error!(
                    "Failed to archive: project={} err={}",
                    project.path_with_namespace,
                    e
                );
                ArchiveStatus::Failed {
                    reason: e.to_string(),
                }
            }
        };
        ArchiveResult {
            project,
            output_path,
            status,
            messages,
        }
    }

    async fn archive_project(
        &self,
        client: &GitlabClient,
        project: &Project,
        project_dir: &Path,
        messages: &mut Vec<String>,
    ) -> Result<ArchiveStatus, Error> {
        let remote = Remote::for_project(project, self.options.clone_method, &self.token)?;
        let mirror_path = project_dir.join(project.mirror_dir_name());

        if self.options.dry_run {
            messages.push(format!("dry-run: would mirror {} into {:?}", remote.url, mirror_path));
            if self.options.compress {
                messages.push(format!("dry-run: would create {:?}", self.tarball_path(project)));
            }
            return Ok(ArchiveStatus::DryRun);
        }

        std::fs::create_dir_all(project_dir).map_err(|e| Error::io(project_dir, e))?;

        if self.options.with_metadata {
            messages.push(String::from("exporting metadata"));
            let meta = client.export_metadata(project.id).await?;
            write_json(&project_dir.join("metadata.json"), &meta)?;
        }

        messages.push(format!("mirroring {}", remote.url));
        mirror(&remote, &mirror_path, messages).await?;
        if git::has_no_refs(&mirror_path)? {
            return Err(Error::Clone(format!(
                "{} is empty, nothing to mirror",
                remote.url
            )));
        }

        if self.options.with_wiki && project.wiki_enabled {
            let wiki_path = project_dir.join(project.wiki_mirror_dir_name());
            let wiki = remote.wiki()?;
            match mirror(&wiki, &wiki_path, messages).await {
                Ok(()) => messages.push(format!("mirrored wiki into {:?}", wiki_path)),
                Err(e) => {
                    log::warn!(
                        "Wiki not archived: project={} err={}",
                        project.path_with_namespace,
                        e
                    );
                    messages.push(format!("wiki clone failed: {}", e));
                }
            }
        }

        let readme = ArchiveReadme {
            id: project.id,
            path_with_namespace: &project.path_with_namespace,
            name: project.name.as_deref(),
            web_url: project.web_url.as_deref(),
            default_branch: project.default_branch.as_deref(),
            archived_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        };
        write_json(&project_dir.join("README.archive.json"), &readme)?;

        if self.options.compress {
            let tarball = self.tarball_path(project);
            compress_dir(project_dir, &tarball).await?;
            messages.push(format!("created archive {:?}", tarball));
        }

        let size_bytes = dir_size(project_dir);
        log::info!(
            "Archived project={} size={}",
            project.path_with_namespace,
            bytesize::ByteSize(size_bytes)
        );
        Ok(ArchiveStatus::Archived { size_bytes })
    }

    fn tarball_path(&self, project: &Project) -> PathBuf {
        self.outdir
            .join(format!("{}.tar.gz", project.archive_dir_name()))
    }
}

/// Clones `remote` into `dest`, or refreshes `dest` when it already holds a
/// mirror. A mirror whose refresh fails is left untouched and the failure is
/// reported. Anything else found at `dest` (e.g. the leftovers of an aborted
/// run) is removed and replaced by a fresh clone.
async fn mirror(remote: &Remote, dest: &Path, messages: &mut Vec<String>) -> Result<(), Error> {
    if dest.exists() {
        if git::is_mirror(dest) {
            if let Err(e) = git::refresh_mirror(remote, dest).await {
                log::warn!("Refresh failed, keeping existing mirror: path={:?} err={}", dest, e);
                messages.push(format!("kept existing mirror {:?}", dest));
                return Err(e);
            }
            messages.push(format!("refreshed existing mirror {:?}", dest));
            return Ok(());
        }
        log::warn!("Replacing partial archive: path={:?}", dest);
        messages.push(format!("replacing partial archive {:?}", dest));
        remove_path(dest)?;
    }
    git::mirror_clone(remote, dest).await?;
    messages.push(format!("cloned mirror into {:?}", dest));
    Ok(())
}

fn remove_path(path: &Path) -> Result<(), Error> {
    let result = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    result.map_err(|e| Error::io(path, e))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), Error> {
    let json = serde_json::to_vec_pretty(value)
        .map_err(|e| Error::io(path, std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
    std::fs::write(path, json).map_err(|e| Error::io(path, e))
}

/// `<dest>` becomes a gzip'd tarball whose single root is the project dir.
async fn compress_dir(source_dir: &Path, dest_path: &Path) -> Result<(), Error> {
    let source_dir = source_dir.to_path_buf();
    let dest_path = dest_path.to_path_buf();
    let root = source_dir
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("archive"));

    tokio::task::spawn_blocking(move || {
        if dest_path.exists() {
            std::fs::remove_file(&dest_path).map_err(|e| Error::io(&dest_path, e))?;
        }
        let file = File::create(&dest_path).map_err(|e| Error::io(&dest_path, e))?;
        let encoder = GzEncoder::new(file, Compression::default());
        let mut tar = tar::Builder::new(encoder);
        tar.append_dir_all(&root, &source_dir)
            .map_err(|e| Error::io(&source_dir, e))?;
        tar.into_inner()
            .and_then(|encoder| encoder.finish())
            .map_err(|e| Error::io(&dest_path, e))?;
        Ok::<(), Error>(())
    })
    .await
    .map_err(|e| Error::Setup(format!("compression task failed: {}", e)))?
}

fn dir_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_map(Result::ok)
        .filter_map(|entry| entry.metadata().ok())
        .filter(|metadata| metadata.is_file())
        .map(|metadata| metadata.len())
        .sum()
}
