//! Bitbucket Server REST client.

use crate::config::SourceConnection;
use crate::error::{MigrationError, Platform, Result};
use crate::platform::{Page, PageRequest, ProjectRecord, RepoRecord, SourcePlatform};
use crate::secret::SecretString;
use crate::types::SourceUser;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

/// Bitbucket Server paged response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BitbucketPage<T> {
    values: Vec<T>,
    #[serde(default = "default_last_page")]
    is_last_page: bool,
    next_page_start: Option<u64>,
}

fn default_last_page() -> bool {
    true
}

impl<T> BitbucketPage<T> {
    fn into_page<U>(self, map: impl Fn(T) -> U) -> Page<U> {
        Page {
            next_start: if self.is_last_page {
                None
            } else {
                self.next_page_start
            },
            values: self.values.into_iter().map(map).collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct BitbucketProject {
    key: String,
    name: String,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BitbucketRepo {
    slug: String,
    name: String,
    description: Option<String>,
    #[serde(default)]
    public: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BitbucketUser {
    name: String,
    display_name: Option<String>,
    email_address: Option<String>,
}

/// Client for the Bitbucket Server REST API 1.0.
pub struct BitbucketServerClient {
    client: Client,
    base_url: String,
    username: String,
    token: SecretString,
}

impl BitbucketServerClient {
    /// Create a client for the given connection.
    pub fn new(connection: &SourceConnection) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("ferry/", env!("CARGO_PKG_VERSION")))
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| MigrationError::NetworkError(e.to_string()))?;

        Ok(Self {
            client,
            base_url: connection.url.trim_end_matches('/').to_string(),
            username: connection.username.clone(),
            token: connection.token.clone(),
        })
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let url = format!("{}/rest/api/1.0{path}", self.base_url);
        debug!(url = %url, "GET");

        let response = self
            .client
            .get(&url)
            .basic_auth(&self.username, Some(self.token.expose()))
            .query(query)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(MigrationError::from_response(Platform::Source, response).await);
        }

        Ok(response.json().await?)
    }

    async fn get_page<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        page: PageRequest,
    ) -> Result<BitbucketPage<T>> {
        self.get(
            path,
            &[
                ("start", page.start.to_string()),
                ("limit", page.limit.to_string()),
            ],
        )
        .await
    }
}

#[async_trait]
impl SourcePlatform for BitbucketServerClient {
    async fn verify_credentials(&self) -> Result<()> {
        let _: serde_json::Value = self
            .get(&format!("/users/{}", self.username), &[])
            .await
            .map_err(|e| match e {
                // Anonymous access hides the user entirely
                MigrationError::NotFound(_) => MigrationError::AuthenticationFailed {
                    platform: Platform::Source,
                    message: format!("user {} is not visible", self.username),
                },
                other => other,
            })?;
        Ok(())
    }

    async fn list_projects(&self, page: PageRequest) -> Result<Page<ProjectRecord>> {
        let raw: BitbucketPage<BitbucketProject> = self.get_page("/projects", page).await?;
        Ok(raw.into_page(|p| ProjectRecord {
            key: p.key,
            name: p.name,
            description: p.description,
        }))
    }

    async fn list_repos(&self, project_key: &str, page: PageRequest) -> Result<Page<RepoRecord>> {
        let raw: BitbucketPage<BitbucketRepo> = self
            .get_page(&format!("/projects/{project_key}/repos"), page)
            .await?;
        Ok(raw.into_page(|r| RepoRecord {
            slug: r.slug,
            name: r.name,
            description: r.description,
            public: r.public,
        }))
    }

    async fn list_users(&self, page: PageRequest) -> Result<Page<SourceUser>> {
        let raw: BitbucketPage<BitbucketUser> = self.get_page("/users", page).await?;
        Ok(raw.into_page(|u| SourceUser {
            username: u.name,
            display_name: u.display_name,
            email: u.email_address,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::InventoryCollector;
    use serde_json::json;
    use std::sync::Arc;
    use wiremock::matchers::{basic_auth, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> BitbucketServerClient {
        BitbucketServerClient::new(&SourceConnection {
            url: format!("{}/", server.uri()),
            username: "migrator".into(),
            token: "secret".into(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_list_projects_follows_paging() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/rest/api/1.0/projects"))
            .and(query_param("start", "0"))
            .and(basic_auth("migrator", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "size": 1,
                "limit": 1,
                "start": 0,
                "isLastPage": false,
                "nextPageStart": 1,
                "values": [{"key": "A", "id": 1, "name": "Team A", "public": false}]
            })))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/rest/api/1.0/projects"))
            .and(query_param("start", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "size": 1,
                "limit": 1,
                "start": 1,
                "isLastPage": true,
                "values": [{"key": "B", "id": 2, "name": "Team B", "description": "backend"}]
            })))
            .mount(&server)
            .await;

        let client = client(&server);
        let first = client
            .list_projects(PageRequest { start: 0, limit: 1 })
            .await
            .unwrap();
        assert_eq!(first.values[0].key, "A");
        assert_eq!(first.next_start, Some(1));

        let second = client.list_projects(PageRequest { start: 1, limit: 1 }).await.unwrap();
        assert_eq!(second.values[0].description.as_deref(), Some("backend"));
        assert_eq!(second.next_start, None);
    }

    #[tokio::test]
    async fn test_inventory_over_http() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/rest/api/1.0/projects"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "isLastPage": true,
                "values": [{"key": "A", "name": "Team A"}]
            })))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/rest/api/1.0/projects/A/repos"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "isLastPage": true,
                "values": [
                    {"slug": "svc-one", "name": "svc-one", "public": true},
                    {"slug": "svc-two", "name": "Svc Two"}
                ]
            })))
            .mount(&server)
            .await;

        let inventory = InventoryCollector::new(Arc::new(client(&server)))
            .collect()
            .await
            .unwrap();
        assert_eq!(inventory.repo_count(), 2);
        let repo = &inventory.projects[0].repos[1];
        assert_eq!(repo.name, "Svc Two");
        assert_eq!(repo.project_key, "A");
        assert!(inventory.projects[0].repos[0].public);
    }

    #[tokio::test]
    async fn test_unauthorized_maps_to_auth_error() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/rest/api/1.0/users/migrator"))
            .respond_with(ResponseTemplate::new(401).set_body_string("Authentication failed"))
            .mount(&server)
            .await;

        let err = client(&server).verify_credentials().await.unwrap_err();
        assert!(err.is_auth());
        assert!(err.to_string().contains("source"));
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/rest/api/1.0/users"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = client(&server)
            .list_users(PageRequest::first())
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_list_users() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/rest/api/1.0/users"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "isLastPage": true,
                "values": [
                    {"name": "jdoe", "displayName": "Jane Doe", "emailAddress": "jane@example.com"},
                    {"name": "svc-bot"}
                ]
            })))
            .mount(&server)
            .await;

        let page = client(&server).list_users(PageRequest::first()).await.unwrap();
        assert_eq!(page.values.len(), 2);
        assert_eq!(page.values[0].email.as_deref(), Some("jane@example.com"));
        assert_eq!(page.values[1].display_name, None);
    }
}
