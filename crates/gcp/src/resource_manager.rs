//! Cloud Resource Manager v3 project listing.
//!
//! `projects.list` only returns direct children of a parent, so the listing
//! walks the organization's folder tree breadth-first and lists the projects
//! of every folder it finds.

use std::collections::VecDeque;

use backup_core::{Error, Organization, Project, Result};
use futures::{future, stream, StreamExt, TryStreamExt};
use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

use crate::config::GcpConfig;
use crate::http::{endpoint, ApiClient};
use crate::traits::{ProjectDirectory, ProjectStream};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListProjectsResponse {
    #[serde(default)]
    projects: Vec<ProjectResource>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectResource {
    project_id: String,
    #[serde(default)]
    state: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListFoldersResponse {
    #[serde(default)]
    folders: Vec<FolderResource>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FolderResource {
    /// `folders/{id}`
    name: String,
    #[serde(default)]
    state: Option<String>,
}

/// `GET {base}/{resource}?parent=..&pageSize=..[&pageToken=..]`
fn list_url(base: &Url, resource: &str, parent: &str, page_size: u32, page_token: Option<&str>) -> Url {
    let mut url = endpoint(base, &[resource]);
    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("parent", parent)
            .append_pair("pageSize", &page_size.to_string());
        if let Some(token) = page_token {
            query.append_pair("pageToken", token);
        }
    }
    url
}

/// Position in the folder walk.
struct Walk {
    /// Parents whose projects are still to be listed
    parents: VecDeque<String>,
    /// Parent being paged through, with the next page token
    current: Option<(String, Option<String>)>,
}

impl ProjectResource {
    /// Projects pending deletion cannot be queried or exported.
    fn is_active(&self) -> bool {
        self.state.as_deref().map_or(true, |s| s == "ACTIVE")
    }
}

/// Lists the projects of an organization, including those inside folders
/// unless `include_folders` is off.
#[derive(Clone)]
pub struct ResourceManagerClient {
    api: ApiClient,
    base: Url,
    page_size: u32,
    include_folders: bool,
}

impl ResourceManagerClient {
    pub fn new(config: &GcpConfig) -> Result<Self> {
        Ok(Self {
            api: ApiClient::new(config)?,
            base: config.resource_manager_base()?,
            page_size: config.page_size,
            include_folders: config.include_folders,
        })
    }

    fn list_url(&self, resource: &str, parent: &str, page_token: Option<&str>) -> Url {
        list_url(&self.base, resource, parent, self.page_size, page_token)
    }

    /// Active folders directly under `parent`, all pages.
    async fn child_folders(&self, parent: &str) -> Result<Vec<String>> {
        let mut folders = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let url = self.list_url("folders", parent, token.as_deref());
            let page: ListFoldersResponse = self.api.get_json(url).await?;
            folders.extend(
                page.folders
                    .into_iter()
                    .filter(|f| f.state.as_deref().map_or(true, |s| s == "ACTIVE"))
                    .map(|f| f.name),
            );
            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        debug!(parent = parent, folders = folders.len(), "Listed child folders");
        Ok(folders)
    }

    /// Fetches the next page of projects in the walk, descending into folders
    /// as each parent is first visited. `None` once every parent is done.
    async fn next_page(&self, mut walk: Walk) -> Result<Option<(Vec<ProjectResource>, Walk)>> {
        let (parent, token) = match walk.current.take() {
            Some(current) => current,
            None => {
                let Some(parent) = walk.parents.pop_front() else {
                    return Ok(None);
                };
                if self.include_folders {
                    walk.parents.extend(self.child_folders(&parent).await?);
                }
                (parent, None)
            }
        };

        let page = self.fetch_page(&parent, token.as_deref()).await?;
        walk.current = page
            .next_page_token
            .filter(|t| !t.is_empty())
            .map(|next| (parent, Some(next)));
        Ok(Some((page.projects, walk)))
    }

    async fn fetch_page(
        &self,
        parent: &str,
        page_token: Option<&str>,
    ) -> Result<ListProjectsResponse> {
        let url = self.list_url("projects", parent, page_token);
        let page: ListProjectsResponse = self.api.get_json(url).await?;
        debug!(
            parent = parent,
            projects = page.projects.len(),
            more = page.next_page_token.is_some(),
            "Fetched project page"
        );
        Ok(page)
    }
}

impl ProjectDirectory for ResourceManagerClient {
    fn list_projects<'a>(&'a self, organization: &'a Organization) -> ProjectStream<'a> {
        let parent = organization.resource_name();
        info!(parent = %parent, include_folders = self.include_folders, "Listing projects");

        let walk = Walk {
            parents: VecDeque::from([parent]),
            current: None,
        };
        let pages = stream::try_unfold(walk, move |walk| self.next_page(walk));

        pages
            .map_ok(|projects| stream::iter(projects.into_iter().map(Ok::<_, Error>)))
            .try_flatten()
            .try_filter_map(move |resource| {
                let project = if resource.is_active() {
                    Some(Project::new(resource.project_id, organization.id.clone()))
                } else {
                    debug!(
                        project_id = %resource.project_id,
                        state = ?resource.state,
                        "Skipping inactive project"
                    );
                    None
                };
                future::ready(Ok(project))
            })
            .boxed()
    }
}
