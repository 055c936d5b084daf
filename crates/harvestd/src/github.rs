//! GitHub REST client.
//!
//! Authenticates as a GitHub App: a short-lived RS256 JWT is exchanged
//! for an installation access token per operation (tokens expire, so
//! nothing is cached between jobs). Covers exactly the calls the pipeline
//! consumes: artifact listing, one-shot artifact download URLs, raw
//! asset/zip downloads, and the token mint itself.

use std::path::Path;
use std::time::Duration;

use futures_util::StreamExt;
use harvest_core::config::GithubApp;
use harvest_core::github::{ArtifactList, WorkflowArtifact};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::{header, redirect, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::debug;

const DEFAULT_API_BASE: &str = "https://api.github.com";
const USER_AGENT: &str = concat!("harvestd/", env!("CARGO_PKG_VERSION"));

/// Lifetime of the self-signed app JWT.
const APP_JWT_TTL: Duration = Duration::from_secs(10 * 60);
/// Timeout for minting tokens and one-shot download links.
pub const LINK_TIMEOUT: Duration = Duration::from_secs(5);
/// Timeout covering an entire file download.
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);

const ARTIFACTS_PER_PAGE: usize = 100;

#[derive(Debug, Error)]
pub enum GithubError {
    #[error("failed to read github app private key: {0}")]
    PrivateKey(#[source] jsonwebtoken::errors::Error),
    #[error("failed to sign a jwt: {0}")]
    Jwt(#[source] jsonwebtoken::errors::Error),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected http status {status} from {context}")]
    Status { status: u16, context: String },
    #[error("download link response carried no location")]
    MissingLocation,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GithubError>;

pub struct GithubClient {
    http: reqwest::Client,
    no_redirect: reqwest::Client,
    api_base: String,
    app_id: i64,
    installation_id: i64,
    signing_key: EncodingKey,
}

impl std::fmt::Debug for GithubClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GithubClient")
            .field("api_base", &self.api_base)
            .field("app_id", &self.app_id)
            .field("installation_id", &self.installation_id)
            .finish_non_exhaustive()
    }
}

impl GithubClient {
    pub fn new(app: &GithubApp) -> Result<Self> {
        let signing_key = EncodingKey::from_rsa_pem(app.private_key.as_bytes())
            .map_err(GithubError::PrivateKey)?;
        Ok(Self {
            http: reqwest::Client::builder().user_agent(USER_AGENT).build()?,
            no_redirect: reqwest::Client::builder()
                .user_agent(USER_AGENT)
                .redirect(redirect::Policy::none())
                .build()?,
            api_base: DEFAULT_API_BASE.to_string(),
            app_id: app.id,
            installation_id: app.installation_id,
            signing_key,
        })
    }

    /// Point the client at a different API root (tests).
    pub fn with_api_base(mut self, base: &str) -> Self {
        self.api_base = base.trim_end_matches('/').to_string();
        self
    }

    /// Self-signed app JWT: `{iat, exp: iat+10m, iss: app_id}`, RS256.
    fn app_jwt(&self) -> Result<String> {
        #[derive(Serialize)]
        struct Claims {
            iat: i64,
            exp: i64,
            iss: i64,
        }

        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            iat: now,
            exp: now + APP_JWT_TTL.as_secs() as i64,
            iss: self.app_id,
        };
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &self.signing_key)
            .map_err(GithubError::Jwt)
    }

    /// Mint an installation access token. The API answers 201 on success.
    pub async fn create_installation_token(&self) -> Result<String> {
        #[derive(Deserialize)]
        struct TokenResponse {
            token: String,
        }

        let url = format!(
            "{}/app/installations/{}/access_tokens",
            self.api_base, self.installation_id,
        );
        let response = self
            .http
            .post(&url)
            .timeout(LINK_TIMEOUT)
            .bearer_auth(self.app_jwt()?)
            .header(header::ACCEPT, "application/vnd.github+json")
            .send()
            .await?;
        if response.status() != StatusCode::CREATED {
            return Err(GithubError::Status {
                status: response.status().as_u16(),
                context: url,
            });
        }
        let token: TokenResponse = response.json().await?;
        Ok(token.token)
    }

    /// List every artifact of a workflow run, walking all pages.
    pub async fn list_workflow_run_artifacts(
        &self,
        owner: &str,
        repo: &str,
        run_id: i64,
    ) -> Result<Vec<WorkflowArtifact>> {
        let token = self.create_installation_token().await?;

        let mut artifacts = Vec::new();
        let mut page = 1usize;
        loop {
            let url = format!(
                "{}/repos/{owner}/{repo}/actions/runs/{run_id}/artifacts",
                self.api_base,
            );
            let response = self
                .http
                .get(&url)
                .timeout(LINK_TIMEOUT)
                .bearer_auth(&token)
                .header(header::ACCEPT, "application/vnd.github+json")
                .query(&[("per_page", ARTIFACTS_PER_PAGE), ("page", page)])
                .send()
                .await?;
            if response.status() != StatusCode::OK {
                return Err(GithubError::Status {
                    status: response.status().as_u16(),
                    context: url,
                });
            }
            let list: ArtifactList = response.json().await?;
            let fetched = list.artifacts.len();
            artifacts.extend(list.artifacts);

            let total = list.total_count.unwrap_or_default() as usize;
            if fetched < ARTIFACTS_PER_PAGE || artifacts.len() >= total {
                break;
            }
            page += 1;
        }

        Ok(artifacts)
    }

    /// Mint the one-shot artifact download URL: the zip endpoint answers
    /// with a redirect whose location is the pre-signed link.
    pub async fn artifact_download_url(
        &self,
        owner: &str,
        repo: &str,
        artifact_id: i64,
    ) -> Result<String> {
        let token = self.create_installation_token().await?;
        let url = format!(
            "{}/repos/{owner}/{repo}/actions/artifacts/{artifact_id}/zip",
            self.api_base,
        );
        let response = self
            .no_redirect
            .get(&url)
            .timeout(LINK_TIMEOUT)
            .bearer_auth(&token)
            .header(header::ACCEPT, "application/vnd.github+json")
            .send()
            .await?;
        if !response.status().is_redirection() {
            return Err(GithubError::Status {
                status: response.status().as_u16(),
                context: url,
            });
        }
        response
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or(GithubError::MissingLocation)
    }

    /// Stream a URL to disk with an octet-stream accept header. Used for
    /// both pre-signed artifact links and release asset URLs.
    pub async fn download_to_file(
        &self,
        url: &str,
        authenticated: bool,
        destination: &Path,
    ) -> Result<()> {
        let mut request = self
            .http
            .get(url)
            .timeout(DOWNLOAD_TIMEOUT)
            .header(header::ACCEPT, "application/octet-stream");
        if authenticated {
            let token = self.create_installation_token().await?;
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        if response.status() != StatusCode::OK {
            return Err(GithubError::Status {
                status: response.status().as_u16(),
                context: url.to_string(),
            });
        }

        debug!(url, destination = %destination.display(), "downloading a file");
        let mut file = tokio::fs::File::create(destination).await?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    // 2048-bit throwaway key used only to exercise JWT signing in tests.
    const TEST_RSA_KEY: &str = include_str!("../testdata/test_rsa_key.pem");

    fn test_app() -> GithubApp {
        GithubApp {
            id: 123,
            installation_id: 456,
            private_key: TEST_RSA_KEY.to_string(),
        }
    }

    async fn client_against(server: &MockServer) -> GithubClient {
        GithubClient::new(&test_app())
            .unwrap()
            .with_api_base(&server.uri())
    }

    fn token_mock() -> Mock {
        Mock::given(method("POST"))
            .and(path("/app/installations/456/access_tokens"))
            .respond_with(
                ResponseTemplate::new(201).set_body_json(serde_json::json!({"token": "inst-tok"})),
            )
    }

    #[test]
    fn rejects_garbage_private_key() {
        let app = GithubApp {
            id: 1,
            installation_id: 2,
            private_key: "not a key".to_string(),
        };
        assert!(matches!(
            GithubClient::new(&app),
            Err(GithubError::PrivateKey(_))
        ));
    }

    #[tokio::test]
    async fn installation_token_requires_201() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/app/installations/456/access_tokens"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"token": "t"})),
            )
            .mount(&server)
            .await;

        let client = client_against(&server).await;
        let err = client.create_installation_token().await.unwrap_err();
        assert!(matches!(err, GithubError::Status { status: 200, .. }));
    }

    #[tokio::test]
    async fn installation_token_round_trip() {
        let server = MockServer::start().await;
        token_mock().mount(&server).await;

        let client = client_against(&server).await;
        assert_eq!(client.create_installation_token().await.unwrap(), "inst-tok");
    }

    #[tokio::test]
    async fn artifact_listing_walks_pages() {
        let server = MockServer::start().await;
        token_mock().mount(&server).await;

        let page1: Vec<serde_json::Value> = (0..100)
            .map(|i| {
                serde_json::json!({
                    "id": i,
                    "name": format!("artifact-{i}"),
                    "expired": false,
                    "workflow_run": {"id": 9, "head_sha": "abc"}
                })
            })
            .collect();
        Mock::given(method("GET"))
            .and(path("/repos/o/r/actions/runs/9/artifacts"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "total_count": 101,
                "artifacts": page1,
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/o/r/actions/runs/9/artifacts"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "total_count": 101,
                "artifacts": [{
                    "id": 100,
                    "name": "artifact-100",
                    "expired": false,
                    "workflow_run": {"id": 9, "head_sha": "abc"}
                }],
            })))
            .mount(&server)
            .await;

        let client = client_against(&server).await;
        let artifacts = client
            .list_workflow_run_artifacts("o", "r", 9)
            .await
            .unwrap();
        assert_eq!(artifacts.len(), 101);
        assert_eq!(artifacts[100].name(), "artifact-100");
    }

    #[tokio::test]
    async fn download_url_comes_from_redirect_location() {
        let server = MockServer::start().await;
        token_mock().mount(&server).await;
        Mock::given(method("GET"))
            .and(path("/repos/o/r/actions/artifacts/7/zip"))
            .respond_with(
                ResponseTemplate::new(302)
                    .insert_header("location", "https://signed.example/artifact.zip"),
            )
            .mount(&server)
            .await;

        let client = client_against(&server).await;
        let url = client.artifact_download_url("o", "r", 7).await.unwrap();
        assert_eq!(url, "https://signed.example/artifact.zip");
    }

    #[tokio::test]
    async fn download_to_file_streams_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/asset.zip"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"zip-bytes".to_vec()))
            .mount(&server)
            .await;

        let dir = tempfile::TempDir::new().unwrap();
        let dest = dir.path().join("asset.zip");
        let client = client_against(&server).await;
        client
            .download_to_file(&format!("{}/asset.zip", server.uri()), false, &dest)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"zip-bytes");
    }

    #[tokio::test]
    async fn download_to_file_rejects_non_200() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing.zip"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = tempfile::TempDir::new().unwrap();
        let client = client_against(&server).await;
        let err = client
            .download_to_file(
                &format!("{}/missing.zip", server.uri()),
                false,
                &dir.path().join("missing.zip"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GithubError::Status { status: 404, .. }));
    }
}
