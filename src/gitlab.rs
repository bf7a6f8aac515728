use crate::error::Error;
use crate::project::{Group, Project};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::{HashSet, VecDeque};
use std::time::Duration;

pub const DEFAULT_PER_PAGE: u32 = 100;

const NEXT_PAGE_HEADER: &str = "X-Next-Page";

pub fn make_http_client(api_token: &str) -> Result<Client, Error> {
    let mut headers = HeaderMap::new();
    headers.insert(
        "PRIVATE-TOKEN",
        HeaderValue::from_str(api_token)
            .map_err(|_| Error::Auth(String::from("token cannot be set as HTTP header")))?,
    );

    reqwest::Client::builder()
        .timeout(Duration::from_secs(120))
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .default_headers(headers)
        .build()
        .map_err(|e| Error::Setup(format!("failed to create http client: {}", e)))
}

/// Projects resolved from explicit ids, plus the ids the API did not know.
#[derive(Debug, Default)]
pub struct Listing {
    pub projects: Vec<Project>,
    pub missing: Vec<(u64, Error)>,
}

#[derive(Debug, PartialEq)]
enum NextPage {
    Page(u32),
    Last,
    Unknown,
}

fn next_page(headers: &HeaderMap) -> NextPage {
    match headers.get(NEXT_PAGE_HEADER) {
        None => NextPage::Unknown,
        Some(v) => match v.to_str().map(str::trim) {
            Ok("") => NextPage::Last,
            Ok(s) => s.parse().map(NextPage::Page).unwrap_or(NextPage::Unknown),
            Err(_) => NextPage::Unknown,
        },
    }
}

/// One client per run. Every request carries the token and goes through
/// the same status mapping.
pub struct GitlabClient {
    http: Client,
    api_base: String,
    per_page: u32,
    request_delay: Duration,
}

impl GitlabClient {
    pub fn new(gitlab_url: &str, api_token: &str) -> Result<Self, Error> {
        Ok(GitlabClient {
            http: make_http_client(api_token)?,
            api_base: format!("{}/api/v4", gitlab_url.trim_end_matches('/')),
            per_page: DEFAULT_PER_PAGE,
            request_delay: Duration::ZERO,
        })
    }

    pub fn with_per_page(mut self, per_page: u32) -> Self {
        self.per_page = per_page.clamp(1, DEFAULT_PER_PAGE);
        self
    }

    pub fn with_request_delay(mut self, request_delay: Duration) -> Self {
        self.request_delay = request_delay;
        self
    }

    pub fn request_delay(&self) -> Duration {
        self.request_delay
    }

    async fn pause(&self) {
        if !self.request_delay.is_zero() {
            tokio::time::sleep(self.request_delay).await;
        }
    }

    async fn send(&self, url: &str, query: &[(&str, String)]) -> Result<Response, Error> {
        log::debug!("GET {} query={:?}", url, query);
        let response = self
            .http
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|e| Error::Transient {
                url: url.to_owned(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        log::debug!("GET {} failed: status={} body={}", url, status, body);
        Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Error::Auth(format!("{} answered {}", url, status))
            }
            StatusCode::NOT_FOUND => Error::NotFound(url.to_owned()),
            s if s.is_server_error() => Error::Transient {
                url: url.to_owned(),
                reason: s.to_string(),
            },
            s => Error::Api {
                url: url.to_owned(),
                reason: format!("{}: {}", s, body),
            },
        })
    }

    async fn decode<T: DeserializeOwned>(url: &str, response: Response) -> Result<T, Error> {
        let json = response.text().await.map_err(|e| Error::Transient {
            url: url.to_owned(),
            reason: e.to_string(),
        })?;
        serde_json::from_str(&json).map_err(|e| Error::Api {
            url: url.to_owned(),
            reason: format!("failed to parse JSON ({}): json={}", e, json),
        })
    }

    async fn get_one<T: DeserializeOwned>(&self, path: &str) -> Result<T, Error> {
        let url = format!("{}{}", self.api_base, path);
        let response = self.send(&url, &[]).await?;
        Self::decode(&url, response).await
    }

    /// Walks every page of a list endpoint. Only the current page is in
    /// flight; results are accumulated in order.
    async fn get_paginated<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, &str)],
    ) -> Result<Vec<T>, Error> {
        let url = format!("{}{}", self.api_base, path);
        let mut items = Vec::new();
        let mut page: u32 = 1;
        loop {
            let mut query: Vec<(&str, String)> =
                params.iter().map(|(k, v)| (*k, (*v).to_owned())).collect();
            query.push(("per_page", self.per_page.to_string()));
            query.push(("page", page.to_string()));

            let response = self.send(&url, &query).await?;
            let next = next_page(response.headers());
            let batch: Vec<T> = Self::decode(&url, response).await?;
            let fetched = batch.len();
            items.extend(batch);
            log::debug!(
                "Fetched page: url={} page={} count={} next={:?}",
                url,
                page,
                fetched,
                next
            );

            if fetched == 0 {
                break;
            }
            page = match next {
                NextPage::Page(n) if n > page => n,
                NextPage::Page(_) | NextPage::Last => break,
                NextPage::Unknown if fetched < self.per_page as usize => break,
                NextPage::Unknown => page + 1,
            };
            self.pause().await;
        }
        Ok(items)
    }

    pub async fn fetch_project(&self, project_id: u64) -> Result<Project, Error> {
        self.get_one(&format!("/projects/{}", project_id)).await
    }

    /// Accepts a numeric id or a full path such as `acme/infra`.
    pub async fn resolve_group(&self, id_or_path: &str) -> Result<Group, Error> {
        let encoded = urlencoding::encode(id_or_path.trim_matches('/'));
        self.get_one(&format!("/groups/{}", encoded)).await
    }

    /// Looks every id up once. Unknown ids are collected, any other error
    /// aborts the listing.
    pub async fn list_projects_by_id(&self, project_ids: &[u64]) -> Result<Listing, Error> {
        let mut listing = Listing::default();
        let mut seen = HashSet::new();
        for &id in project_ids {
            if !seen.insert(id) {
                continue;
            }
            match self.fetch_project(id).await {
                Ok(project) => listing.projects.push(project),
                Err(e) if !e.is_fatal_for_listing() => {
                    log::warn!("Project not found: id={} err={}", id, e);
                    listing.missing.push((id, e));
                }
                Err(e) => return Err(e),
            }
            self.pause().await;
        }
        Ok(listing)
    }

    /// All projects below `root`, subgroups included. Groups are walked with
    /// a work queue; a group id is visited at most once even if the API
    /// reports a cycle.
    pub async fn list_group_projects(&self, root: &Group) -> Result<Vec<Project>, Error> {
        let mut queue = VecDeque::from([root.id]);
        let mut visited = HashSet::new();
        let mut seen_projects = HashSet::new();
        let mut projects = Vec::new();

        while let Some(group_id) = queue.pop_front() {
            if !visited.insert(group_id) {
                continue;
            }
            let found: Vec<Project> = self
                .get_paginated(
                    &format!("/groups/{}/projects", group_id),
                    &[("with_shared", "false"), ("order_by", "id"), ("sort", "asc")],
                )
                .await?;
            log::debug!("Group projects: group={} count={}", group_id, found.len());
            for project in found {
                if seen_projects.insert(project.id) {
                    projects.push(project);
                }
            }

            let subgroups: Vec<Group> = self
                .get_paginated(&format!("/groups/{}/subgroups", group_id), &[])
                .await?;
            for subgroup in subgroups {
                if !visited.contains(&subgroup.id) {
                    queue.push_back(subgroup.id);
                }
            }
        }
        Ok(projects)
    }

    /// Issues, merge requests and friends for `metadata.json`.
    pub async fn export_metadata(&self, project_id: u64) -> Result<Value, Error> {
        let mut meta = Map::new();
        let project: Value = self.get_one(&format!("/projects/{}", project_id)).await?;
        meta.insert(String::from("project"), project);

        let lists: [(&str, &str, &[(&str, &str)]); 6] = [
            ("issues", "issues", &[("scope", "all")]),
            ("merge_requests", "merge_requests", &[("scope", "all")]),
            ("labels", "labels", &[]),
            ("milestones", "milestones", &[]),
            ("releases", "releases", &[]),
            ("tags", "repository/tags", &[]),
        ];
        for (key, endpoint, params) in lists {
            let items: Vec<Value> = self
                .get_paginated(&format!("/projects/{}/{}", project_id, endpoint), params)
                .await?;
            meta.insert(key.to_owned(), Value::Array(items));
        }

        // Pipelines are optional: CI may be disabled for the project.
        let pipelines = match self
            .get_paginated::<Value>(&format!("/projects/{}/pipelines", project_id), &[])
            .await
        {
            Ok(items) => Value::Array(items),
            Err(e) => {
                log::debug!("No pipelines exported: project={} err={}", project_id, e);
                Value::Null
            }
        };
        meta.insert(String::from("pipelines"), pipelines);
        Ok(Value::Object(meta))
    }
}
