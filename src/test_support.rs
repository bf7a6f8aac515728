use git2::{Repository, Signature};
use std::path::{Path, PathBuf};

/// Serves a warp filter on an ephemeral local port and yields its base URL.
macro_rules! serve {
    ($filter:expr) => {{
        let (addr, server) = warp::serve($filter).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);
        format!("http://{}", addr)
    }};
}

pub(crate) use serve;

/// A small repository with two branches and a tag.
pub fn fixture_repo(dir: &Path) -> PathBuf {
    let repo = Repository::init(dir).unwrap();
    let sig = Signature::now("Archiver Test", "archiver@example.com").unwrap();

    std::fs::write(dir.join("README.md"), "hello\n").unwrap();
    let mut index = repo.index().unwrap();
    index.add_path(Path::new("README.md")).unwrap();
    index.write().unwrap();
    let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
    let first = repo
        .commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[])
        .unwrap();
    let first = repo.find_commit(first).unwrap();

    repo.branch("feature", &first, false).unwrap();
    repo.tag_lightweight("v1.0.0", first.as_object(), false)
        .unwrap();
    dir.to_path_buf()
}

pub fn file_url(path: &Path) -> String {
    format!("file://{}", path.display())
}
