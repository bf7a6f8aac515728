mod archive;
mod error;
mod git;
mod gitlab;
mod project;
mod report;
#[cfg(test)]
mod test_support;

use crate::archive::{ArchiveOptions, Archiver};
use crate::error::Error;
use crate::git::CloneMethod;
use crate::gitlab::{GitlabClient, Listing};
use crate::report::RunReport;
use clap::{ArgGroup, Parser};
use std::path::{Path, PathBuf};
use std::process::exit;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const EXIT_PARTIAL_FAILURE: i32 = 1;
const EXIT_AUTH: i32 = 3;
const EXIT_NOT_RUN: i32 = 4;
const EXIT_INTERRUPTED: i32 = 130;

/// Archive GitLab projects as bare mirror clones, ready to be pushed elsewhere.
#[derive(Parser, Debug)]
#[clap(version)]
#[clap(group(
    ArgGroup::new("scope")
        .required(true)
        .args(&["project-ids", "group-path", "group-id"])
))]
struct Opts {
    /// GitLab base URL, e.g. https://gitlab.example.edu
    #[clap(long = "gitlab", value_name = "BASE_URL", parse(try_from_str = parse_base_url))]
    gitlab_url: String,

    /// Archive these project ids instead of a group
    #[clap(
        name = "project-ids",
        long = "project-ids",
        value_name = "ID",
        multiple_values = true
    )]
    project_ids: Vec<u64>,

    /// Archive every project below this group path, subgroups included
    #[clap(name = "group-path", long = "group-path", value_name = "PATH")]
    group_path: Option<String>,

    /// Same as --group-path, by numeric group id
    #[clap(name = "group-id", long = "group-id", value_name = "ID")]
    group_id: Option<u64>,

    /// Root directory for archives, created if absent
    #[clap(long, value_name = "PATH", parse(from_os_str))]
    outdir: PathBuf,

    /// Personal access token
    #[clap(long, env = "GITLAB_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Transport used to clone: https or ssh
    #[clap(long, default_value = "https")]
    clone_method: CloneMethod,

    /// Export issues, merge requests, labels, milestones, releases, tags and pipelines
    #[clap(long)]
    with_metadata: bool,

    /// Also mirror the project wiki when it is enabled
    #[clap(long)]
    with_wiki: bool,

    /// Pack each project directory into <outdir>/<dir>.tar.gz
    #[clap(long)]
    compress: bool,

    /// List the projects and show what would be done, without writing anything
    #[clap(long)]
    dry_run: bool,

    /// API page size (1-100)
    #[clap(long, default_value_t = gitlab::DEFAULT_PER_PAGE)]
    per_page: u32,

    /// Pause between API pages and between projects
    #[clap(long, value_name = "MS", default_value_t = 350)]
    request_delay_ms: u64,
}

fn parse_base_url(s: &str) -> Result<String, String> {
    let url = url::Url::parse(s).map_err(|e| format!("invalid URL {:?}: {}", s, e))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(format!("expected an http(s) URL, got {:?}", s));
    }
    Ok(s.trim_end_matches('/').to_owned())
}

fn expand_tilde(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

#[derive(Debug, PartialEq)]
enum Scope {
    Projects(Vec<u64>),
    Group(String),
}

impl Opts {
    fn scope(&self) -> Scope {
        match (&self.group_path, self.group_id) {
            (Some(path), _) => Scope::Group(path.clone()),
            (None, Some(id)) => Scope::Group(id.to_string()),
            (None, None) => Scope::Projects(self.project_ids.clone()),
        }
    }

    fn archive_options(&self) -> ArchiveOptions {
        ArchiveOptions {
            clone_method: self.clone_method,
            dry_run: self.dry_run,
            with_metadata: self.with_metadata,
            with_wiki: self.with_wiki,
            compress: self.compress,
        }
    }
}

async fn list_projects(client: &GitlabClient, scope: &Scope) -> Result<Listing, Error> {
    match scope {
        Scope::Projects(ids) => client.list_projects_by_id(ids).await,
        Scope::Group(id_or_path) => {
            let group = client.resolve_group(id_or_path).await?;
            log::info!(
                "Listing projects in group {} (id={}) ...",
                group.full_path,
                group.id
            );
            Ok(Listing {
                projects: client.list_group_projects(&group).await?,
                missing: Vec::new(),
            })
        }
    }
}

/// Lists first, archives second. Any listing error aborts before the first
/// clone; archiving errors stay with their project.
async fn run(opts: Opts, interrupted: Arc<AtomicBool>) -> Result<RunReport, Error> {
    let token = match opts.token.as_deref().map(str::trim) {
        Some(token) if !token.is_empty() => token.to_owned(),
        _ => {
            return Err(Error::Auth(String::from(
                "a token is required via --token or GITLAB_TOKEN",
            )))
        }
    };

    let client = GitlabClient::new(&opts.gitlab_url, &token)?
        .with_per_page(opts.per_page)
        .with_request_delay(Duration::from_millis(opts.request_delay_ms));

    let Listing { projects, missing } = list_projects(&client, &opts.scope()).await?;
    log::info!("Found {} projects.", projects.len());

    let outdir = expand_tilde(&opts.outdir);
    if !opts.dry_run {
        std::fs::create_dir_all(&outdir).map_err(|e| Error::io(&outdir, e))?;
    }

    let archiver = Archiver::new(&outdir, token, opts.archive_options());
    let mut report = RunReport::new(missing);
    let total = projects.len();
    for (idx, project) in projects.into_iter().enumerate() {
        if interrupted.load(Ordering::SeqCst) {
            break;
        }
        log::info!(
            "[{}/{}] Archiving {} (id={}) ...",
            idx + 1,
            total,
            project.path_with_namespace,
            project.id
        );
        report.results.push(archiver.archive(&client, project).await);
        if idx + 1 < total && !client.request_delay().is_zero() {
            tokio::time::sleep(client.request_delay()).await;
        }
    }
    report.interrupted = interrupted.load(Ordering::SeqCst);

    if !opts.dry_run {
        if let Err(e) = report.write_index(&outdir) {
            log::error!("{:#}", e);
            report.index_error = Some(format!("{:#}", e));
        }
    }
    Ok(report)
}

fn exit_code(result: &Result<RunReport, Error>) -> i32 {
    match result {
        Ok(report) if report.interrupted => EXIT_INTERRUPTED,
        Ok(report) if report.has_errors() => EXIT_PARTIAL_FAILURE,
        Ok(_) => 0,
        Err(Error::Auth(_)) => EXIT_AUTH,
        Err(_) => EXIT_NOT_RUN,
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let opts = Opts::parse();

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = interrupted.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupted: stopping after the current project");
            flag.store(true, Ordering::SeqCst);
        }
    });

    let result = run(opts, interrupted).await;
    match &result {
        Ok(report) => report.print_summary(),
        Err(e) => log::error!("Nothing archived: {}", e),
    }
    exit(exit_code(&result));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::{project, Project};
    use crate::test_support::{file_url, fixture_repo, serve};
    use clap::ErrorKind;
    use std::sync::atomic::AtomicUsize;
    use warp::http::StatusCode;
    use warp::{Filter, Reply};

    fn parse(args: &[&str]) -> Result<Opts, clap::Error> {
        let mut argv = vec!["gitlab-group-archive"];
        argv.extend_from_slice(args);
        Opts::try_parse_from(argv)
    }

    fn opts(base: &str, outdir: &Path, scope: &[&str]) -> Opts {
        let outdir = outdir.to_string_lossy().into_owned();
        let mut args = vec![
            "--gitlab",
            base,
            "--outdir",
            outdir.as_str(),
            "--token",
            "tok",
            "--request-delay-ms",
            "0",
        ];
        args.extend_from_slice(scope);
        parse(&args).unwrap()
    }

    fn not_interrupted() -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(false))
    }

    #[test]
    fn project_ids_and_group_path_are_mutually_exclusive() {
        let err = parse(&[
            "--gitlab",
            "https://gitlab.example.edu",
            "--outdir",
            "/tmp/out",
            "--project-ids",
            "1",
            "--group-path",
            "acme",
        ])
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArgumentConflict);
    }

    #[test]
    fn a_scope_is_required() {
        let err = parse(&["--gitlab", "https://gitlab.example.edu", "--outdir", "/tmp/out"])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn base_url_must_be_http() {
        let err = parse(&["--gitlab", "gitlab.example.edu", "--outdir", "o", "--group-id", "3"])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValueValidation);
    }

    #[test]
    fn project_ids_accept_several_values_and_occurrences() {
        let opts = parse(&[
            "--gitlab",
            "https://gitlab.example.edu/",
            "--outdir",
            "o",
            "--project-ids",
            "1",
            "2",
            "--project-ids",
            "3",
        ])
        .unwrap();
        assert_eq!(opts.scope(), Scope::Projects(vec![1, 2, 3]));
        assert_eq!(opts.gitlab_url, "https://gitlab.example.edu");
        assert_eq!(opts.clone_method, CloneMethod::Https);
        assert_eq!(opts.per_page, 100);
    }

    #[test]
    fn group_id_becomes_group_scope() {
        let opts = parse(&["--gitlab", "http://h", "--outdir", "o", "--group-id", "12"]).unwrap();
        assert_eq!(opts.scope(), Scope::Group(String::from("12")));
    }

    #[test]
    fn tilde_is_expanded() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde(Path::new("~/archives")), home.join("archives"));
        }
        assert_eq!(expand_tilde(Path::new("/srv/a")), PathBuf::from("/srv/a"));
    }

    #[tokio::test]
    async fn missing_token_is_fatal_before_any_request() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls1 = calls.clone();
        let route = warp::any().map(move || {
            calls1.fetch_add(1, Ordering::SeqCst);
            warp::reply()
        });
        let base = serve!(route);
        let tmp = tempfile::tempdir().unwrap();
        let mut opts = opts(&base, &tmp.path().join("out"), &["--group-path", "acme"]);
        opts.token = None;

        let result = run(opts, not_interrupted()).await;

        assert!(matches!(result, Err(Error::Auth(_))));
        assert_eq!(exit_code(&result), EXIT_AUTH);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!tmp.path().join("out").exists());
    }

    #[tokio::test]
    async fn rejected_token_aborts_before_archiving() {
        let route =
            warp::any().map(|| warp::reply::with_status(warp::reply(), StatusCode::FORBIDDEN));
        let base = serve!(route);
        let tmp = tempfile::tempdir().unwrap();

        let result = run(
            opts(&base, &tmp.path().join("out"), &["--group-path", "acme"]),
            not_interrupted(),
        )
        .await;

        assert_eq!(exit_code(&result), EXIT_AUTH);
        assert!(!tmp.path().join("out").exists());
    }

    fn group_api(
        projects: Vec<Project>,
    ) -> impl Filter<Extract = (warp::reply::Response,), Error = warp::Rejection> + Clone + Send + Sync + 'static
    {
        let group = warp::path!("api" / "v4" / "groups" / String).map(|_| {
            warp::reply::json(&serde_json::json!({"id": 10, "full_path": "acme"})).into_response()
        });
        let group_projects =
            warp::path!("api" / "v4" / "groups" / u64 / "projects").map(move |id: u64| {
                if id == 10 {
                    warp::reply::json(&projects).into_response()
                } else {
                    warp::reply::json(&Vec::<Project>::new()).into_response()
                }
            });
        let subgroups = warp::path!("api" / "v4" / "groups" / u64 / "subgroups")
            .map(|_| warp::reply::json(&Vec::<Project>::new()).into_response());
        group_projects.or(subgroups).unify().or(group).unify()
    }

    #[tokio::test]
    async fn group_with_one_unreachable_project() {
        let tmp = tempfile::tempdir().unwrap();
        let app = fixture_repo(&tmp.path().join("remotes").join("app"));
        let lib = fixture_repo(&tmp.path().join("remotes").join("lib"));
        let gone = tmp.path().join("remotes").join("gone");
        let base = serve!(group_api(vec![
            project(1, "acme/app", &file_url(&app)),
            project(2, "acme/tools/lib", &file_url(&lib)),
            project(3, "acme/gone", &file_url(&gone)),
        ]));
        let outdir = tmp.path().join("out");

        let result = run(opts(&base, &outdir, &["--group-path", "acme"]), not_interrupted()).await;

        assert_eq!(exit_code(&result), EXIT_PARTIAL_FAILURE);
        let report = result.unwrap();
        assert!(git::is_mirror(&outdir.join("acme__app-1").join("app.git")));
        assert!(git::is_mirror(&outdir.join("acme__tools__lib-2").join("lib.git")));
        let failed: Vec<&str> = report
            .failures()
            .map(|r| r.project.path_with_namespace.as_str())
            .collect();
        assert_eq!(failed, vec!["acme/gone"]);

        let index: serde_json::Value =
            serde_json::from_slice(&std::fs::read(outdir.join("index.json")).unwrap()).unwrap();
        assert_eq!(index["results"].as_array().map(Vec::len), Some(3));
    }

    #[tokio::test]
    async fn unknown_project_id_is_reported_and_others_archived() {
        let tmp = tempfile::tempdir().unwrap();
        let app = fixture_repo(&tmp.path().join("app"));
        let app_url = file_url(&app);
        let route = warp::path!("api" / "v4" / "projects" / u64).map(move |id: u64| {
            if id == 1 {
                warp::reply::json(&project(1, "acme/app", &app_url)).into_response()
            } else {
                warp::reply::with_status(warp::reply(), StatusCode::NOT_FOUND).into_response()
            }
        });
        let base = serve!(route);
        let outdir = tmp.path().join("out");

        let result = run(
            opts(&base, &outdir, &["--project-ids", "1", "404"]),
            not_interrupted(),
        )
        .await;

        assert_eq!(exit_code(&result), EXIT_PARTIAL_FAILURE);
        let report = result.unwrap();
        assert_eq!(report.results.len(), 1);
        assert!(!report.results[0].status.is_failure());
        assert_eq!(report.missing.len(), 1);
        assert_eq!(report.missing[0].id, 404);
    }

    #[tokio::test]
    async fn interruption_stops_before_the_next_project() {
        let tmp = tempfile::tempdir().unwrap();
        let app = fixture_repo(&tmp.path().join("app"));
        let base = serve!(group_api(vec![project(1, "acme/app", &file_url(&app))]));
        let outdir = tmp.path().join("out");

        let result = run(
            opts(&base, &outdir, &["--group-path", "acme"]),
            Arc::new(AtomicBool::new(true)),
        )
        .await;

        assert_eq!(exit_code(&result), EXIT_INTERRUPTED);
        let report = result.unwrap();
        assert!(report.results.is_empty());
        assert!(!outdir.join("acme__app-1").exists());
    }

    #[tokio::test]
    async fn unwritable_index_is_a_partial_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let app = fixture_repo(&tmp.path().join("app"));
        let base = serve!(group_api(vec![project(1, "acme/app", &file_url(&app))]));
        let outdir = tmp.path().join("out");
        std::fs::create_dir_all(outdir.join("index.json")).unwrap();

        let result = run(opts(&base, &outdir, &["--group-path", "acme"]), not_interrupted()).await;

        assert_eq!(exit_code(&result), EXIT_PARTIAL_FAILURE);
        let report = result.unwrap();
        assert_eq!(report.failure_count(), 0);
        assert!(report.index_error.is_some());
        assert!(git::is_mirror(&outdir.join("acme__app-1").join("app.git")));
    }

    #[tokio::test]
    async fn full_success_exits_zero() {
        let tmp = tempfile::tempdir().unwrap();
        let app = fixture_repo(&tmp.path().join("app"));
        let base = serve!(group_api(vec![project(1, "acme/app", &file_url(&app))]));

        let result = run(
            opts(&base, &tmp.path().join("out"), &["--group-path", "acme"]),
            not_interrupted(),
        )
        .await;

        assert_eq!(exit_code(&result), 0);
    }
}
