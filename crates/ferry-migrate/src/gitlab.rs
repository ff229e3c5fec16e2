//! GitLab REST client driving the Bitbucket Server importer.

use crate::config::{SourceConnection, TargetConnection};
use crate::error::{MigrationError, Platform, Result};
use crate::platform::{ExistingProject, ImportRequest, ImportStatus, JobHandle, TargetPlatform};
use crate::secret::SecretString;
use crate::types::{SourceUser, TargetPath};
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Deserialize)]
struct GitLabProject {
    id: u64,
    path_with_namespace: String,
}

#[derive(Debug, Deserialize)]
struct GitLabGroup {
    id: u64,
}

#[derive(Debug, Serialize)]
struct CreateGroupRequest<'a> {
    name: &'a str,
    path: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_id: Option<u64>,
}

#[derive(Debug, Serialize)]
struct BitbucketServerImport<'a> {
    bitbucket_server_url: &'a str,
    bitbucket_server_username: &'a str,
    personal_access_token: &'a str,
    bitbucket_server_project: &'a str,
    bitbucket_server_repo: &'a str,
    new_name: &'a str,
    new_namespace: &'a str,
}

#[derive(Debug, Deserialize)]
struct ImportedProject {
    id: u64,
    full_path: String,
}

#[derive(Debug, Deserialize)]
struct ProjectImport {
    import_status: String,
    import_error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GitLabUser {
    username: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    public_email: Option<String>,
}

impl GitLabUser {
    /// `search` also matches substrings, so only an equal address counts.
    fn has_email(&self, email: &str) -> bool {
        [&self.email, &self.public_email]
            .into_iter()
            .flatten()
            .any(|e| e.eq_ignore_ascii_case(email))
    }
}

/// Percent-encode a full path for use as a single path segment.
fn encode_path(path: &str) -> String {
    url::form_urlencoded::byte_serialize(path.as_bytes()).collect()
}

fn parse_import_status(import: ProjectImport) -> Result<ImportStatus> {
    match import.import_status.as_str() {
        "none" | "scheduled" => Ok(ImportStatus::Queued),
        "started" => Ok(ImportStatus::Running),
        "finished" => Ok(ImportStatus::Succeeded),
        "failed" => Ok(ImportStatus::Failed(
            import
                .import_error
                .unwrap_or_else(|| "import failed".to_string()),
        )),
        "canceled" => Ok(ImportStatus::Failed("import canceled".to_string())),
        other => Err(MigrationError::InvalidResponse(format!(
            "unknown import status '{other}'"
        ))),
    }
}

/// Client for the GitLab REST API v4.
///
/// Imports are started through GitLab's Bitbucket Server importer, so the
/// client also carries the source connection GitLab will read from.
pub struct GitLabClient {
    client: Client,
    base_url: String,
    token: SecretString,
    source_url: String,
    source_username: String,
    source_token: SecretString,
}

impl GitLabClient {
    /// Create a client for `target` that imports from `source`.
    pub fn new(target: &TargetConnection, source: &SourceConnection) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("ferry/", env!("CARGO_PKG_VERSION")))
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| MigrationError::NetworkError(e.to_string()))?;

        Ok(Self {
            client,
            base_url: target.url.trim_end_matches('/').to_string(),
            token: target.token.clone(),
            source_url: source.url.trim_end_matches('/').to_string(),
            source_username: source.username.clone(),
            source_token: source.token.clone(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/api/v4{path}", self.base_url);
        debug!(method = %method, url = %url, "GitLab request");
        self.client
            .request(method, url)
            .header("PRIVATE-TOKEN", self.token.expose())
    }

    async fn send(&self, request: RequestBuilder) -> Result<reqwest::Response> {
        let response = request.send().await?;
        if response.status().is_success() {
            return Ok(response);
        }
        Err(MigrationError::from_response(Platform::Target, response).await)
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.send(self.request(Method::GET, path)).await?;
        Ok(response.json().await?)
    }

    async fn find_group(&self, full_path: &str) -> Result<Option<GitLabGroup>> {
        match self.get(&format!("/groups/{}", encode_path(full_path))).await {
            Ok(group) => Ok(Some(group)),
            Err(MigrationError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create_group(&self, name: &str, path: &str, parent_id: Option<u64>) -> Result<GitLabGroup> {
        let request = self
            .request(Method::POST, "/groups")
            .json(&CreateGroupRequest {
                name,
                path,
                parent_id,
            });
        let response = self.send(request).await?;
        Ok(response.json().await?)
    }
}

#[async_trait]
impl TargetPlatform for GitLabClient {
    async fn verify_credentials(&self) -> Result<()> {
        let user: GitLabUser = self.get("/user").await?;
        debug!(user = %user.username, "GitLab token accepted");
        Ok(())
    }

    async fn find_project(&self, path: &TargetPath) -> Result<Option<ExistingProject>> {
        match self
            .get::<GitLabProject>(&format!("/projects/{}", encode_path(&path.full_path())))
            .await
        {
            Ok(project) => {
                let (namespace, name) = project
                    .path_with_namespace
                    .rsplit_once('/')
                    .unwrap_or(("", project.path_with_namespace.as_str()));
                Ok(Some(ExistingProject {
                    id: project.id.to_string(),
                    path: TargetPath::new(namespace, name),
                }))
            }
            Err(MigrationError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn ensure_namespace(&self, namespace: &str, title: &str) -> Result<()> {
        let segments: Vec<&str> = namespace.split('/').collect();
        let mut parent_id = None;
        let mut full_path = String::new();

        for (idx, segment) in segments.iter().enumerate() {
            if !full_path.is_empty() {
                full_path.push('/');
            }
            full_path.push_str(segment);

            if let Some(group) = self.find_group(&full_path).await? {
                parent_id = Some(group.id);
                continue;
            }

            let name = if idx + 1 == segments.len() { title } else { segment };
            let group = match self.create_group(name, segment, parent_id).await {
                Ok(group) => {
                    info!(group = %full_path, "Created GitLab group");
                    group
                }
                // Another worker may have created it in the meantime
                Err(MigrationError::ApiError { status: 400, .. }) => self
                    .find_group(&full_path)
                    .await?
                    .ok_or_else(|| MigrationError::ApiError {
                        status: 400,
                        message: format!("could not create group {full_path}"),
                    })?,
                Err(e) => return Err(e),
            };
            parent_id = Some(group.id);
        }

        Ok(())
    }

    async fn delete_project(&self, project: &ExistingProject) -> Result<()> {
        let request = self.request(Method::DELETE, &format!("/projects/{}", project.id));
        self.send(request).await?;
        info!(project = %project.path, "Deleted GitLab project");
        Ok(())
    }

    async fn submit_import(&self, request: &ImportRequest) -> Result<JobHandle> {
        let body = BitbucketServerImport {
            bitbucket_server_url: &self.source_url,
            bitbucket_server_username: &self.source_username,
            personal_access_token: self.source_token.expose(),
            bitbucket_server_project: &request.project_key,
            bitbucket_server_repo: &request.repo_slug,
            new_name: &request.target.project,
            new_namespace: &request.target.namespace,
        };

        let response = self
            .send(
                self.request(Method::POST, "/import/bitbucket_server")
                    .json(&body),
            )
            .await?;
        let project: ImportedProject = response.json().await?;
        debug!(unit = %request.unit, project = %project.full_path, "Import accepted");

        Ok(JobHandle {
            id: project.id.to_string(),
            target: request.target.clone(),
        })
    }

    async fn import_status(&self, job: &JobHandle) -> Result<ImportStatus> {
        let import: ProjectImport = self.get(&format!("/projects/{}/import", job.id)).await?;
        parse_import_status(import)
    }

    async fn find_user(&self, user: &SourceUser) -> Result<Option<String>> {
        if let Some(email) = &user.email {
            let found: Vec<GitLabUser> = self
                .send(
                    self.request(Method::GET, "/users")
                        .query(&[("search", email.as_str())]),
                )
                .await?
                .json()
                .await?;
            if let Some(found) = found.into_iter().find(|u| u.has_email(email)) {
                return Ok(Some(found.username));
            }
        }

        let found: Vec<GitLabUser> = self
            .send(
                self.request(Method::GET, "/users")
                    .query(&[("username", user.username.as_str())]),
            )
            .await?
            .json()
            .await?;
        Ok(found.into_iter().next().map(|u| u.username))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UnitId;
    use serde_json::json;
    use wiremock::matchers::{body_json, body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> GitLabClient {
        GitLabClient::new(
            &TargetConnection {
                url: server.uri(),
                token: "glpat-secret".into(),
            },
            &SourceConnection {
                url: "https://bitbucket.example.com/".into(),
                username: "migrator".into(),
                token: "bb-secret".into(),
            },
        )
        .unwrap()
    }

    #[test]
    fn test_path_encoding() {
        assert_eq!(encode_path("group/project"), "group%2Fproject");
        assert_eq!(encode_path("a/b/c.d"), "a%2Fb%2Fc.d");
    }

    #[test]
    fn test_import_status_mapping() {
        let status = |s: &str, e: Option<&str>| {
            parse_import_status(ProjectImport {
                import_status: s.to_string(),
                import_error: e.map(str::to_string),
            })
        };
        assert_eq!(status("scheduled", None).unwrap(), ImportStatus::Queued);
        assert_eq!(status("started", None).unwrap(), ImportStatus::Running);
        assert_eq!(status("finished", None).unwrap(), ImportStatus::Succeeded);
        assert_eq!(
            status("failed", Some("Repository is empty")).unwrap(),
            ImportStatus::Failed("Repository is empty".into())
        );
        assert!(status("exploded", None).is_err());
    }

    #[tokio::test]
    async fn test_verify_credentials_sends_token() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/v4/user"))
            .and(header("PRIVATE-TOKEN", "glpat-secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 1, "username": "root"})))
            .mount(&server)
            .await;

        client(&server).verify_credentials().await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_token_is_auth_error() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/v4/user"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({"message": "401 Unauthorized"})))
            .mount(&server)
            .await;

        let err = client(&server).verify_credentials().await.unwrap_err();
        assert!(err.is_auth());
    }

    #[tokio::test]
    async fn test_rate_limit_reads_retry_after() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/v4/user"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "42"))
            .mount(&server)
            .await;

        let err = client(&server).verify_credentials().await.unwrap_err();
        assert!(matches!(err, MigrationError::RateLimitExceeded(42)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_find_project() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/v4/projects/bb-team-a%2Fsvc-one"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": 42,
                "path_with_namespace": "bb-team-a/svc-one"
            })))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/api/v4/projects/bb-team-a%2Fsvc-two"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"message": "404 Project Not Found"})))
            .mount(&server)
            .await;

        let client = client(&server);
        let found = client
            .find_project(&TargetPath::new("bb-team-a", "svc-one"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, "42");
        assert_eq!(found.path.full_path(), "bb-team-a/svc-one");

        assert!(client
            .find_project(&TargetPath::new("bb-team-a", "svc-two"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_ensure_namespace_creates_missing_groups() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/v4/groups/archive"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 7})))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/api/v4/groups/archive%2Fbb-team-a"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/api/v4/groups"))
            .and(body_json(json!({
                "name": "bb-Team A",
                "path": "bb-team-a",
                "parent_id": 7
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 8})))
            .expect(1)
            .mount(&server)
            .await;

        client(&server)
            .ensure_namespace("archive/bb-team-a", "bb-Team A")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_submit_import() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/v4/import/bitbucket_server"))
            .and(body_partial_json(json!({
                "bitbucket_server_url": "https://bitbucket.example.com",
                "bitbucket_server_username": "migrator",
                "personal_access_token": "bb-secret",
                "bitbucket_server_project": "A",
                "bitbucket_server_repo": "svc-one",
                "new_name": "svc-one",
                "new_namespace": "bb-team-a"
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": 99,
                "name": "svc-one",
                "full_path": "/bb-team-a/svc-one",
                "import_status": "scheduled"
            })))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/api/v4/projects/99/import"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": 99,
                "import_status": "failed",
                "import_error": "Repository not found"
            })))
            .mount(&server)
            .await;

        let client = client(&server);
        let job = client
            .submit_import(&ImportRequest {
                unit: UnitId::new("A", "svc-one"),
                project_key: "A".into(),
                repo_slug: "svc-one".into(),
                target: TargetPath::new("bb-team-a", "svc-one"),
                project_name: "svc-one".into(),
            })
            .await
            .unwrap();
        assert_eq!(job.id, "99");

        assert_eq!(
            client.import_status(&job).await.unwrap(),
            ImportStatus::Failed("Repository not found".into())
        );
    }

    #[tokio::test]
    async fn test_find_user_by_email_then_username() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/v4/users"))
            .and(query_param("search", "jane@example.com"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/api/v4/users"))
            .and(query_param("username", "jdoe"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": 3, "username": "jdoe"}])))
            .mount(&server)
            .await;

        let user = SourceUser {
            username: "jdoe".into(),
            display_name: None,
            email: Some("jane@example.com".into()),
        };
        assert_eq!(client(&server).find_user(&user).await.unwrap().as_deref(), Some("jdoe"));
    }

    #[tokio::test]
    async fn test_find_user_ignores_partial_email_matches() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/v4/users"))
            .and(query_param("search", "jane@example.com"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": 4, "username": "jane-au", "email": "jane@example.com.au"},
                {"id": 5, "username": "mary", "public_email": "mary.jane@example.com"},
                {"id": 6, "username": "jane", "email": "Jane@Example.com"}
            ])))
            .mount(&server)
            .await;

        let user = SourceUser {
            username: "jdoe".into(),
            display_name: None,
            email: Some("jane@example.com".into()),
        };
        assert_eq!(client(&server).find_user(&user).await.unwrap().as_deref(), Some("jane"));
    }

    #[tokio::test]
    async fn test_find_user_without_exact_email_falls_back_to_username() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/v4/users"))
            .and(query_param("search", "jane@example.com"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": 4, "username": "jane-au", "email": "jane@example.com.au"}
            ])))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/api/v4/users"))
            .and(query_param("username", "jdoe"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let user = SourceUser {
            username: "jdoe".into(),
            display_name: None,
            email: Some("jane@example.com".into()),
        };
        assert_eq!(client(&server).find_user(&user).await.unwrap(), None);
    }
}
