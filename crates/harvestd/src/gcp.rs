//! GCP destination clients.
//!
//! Two concerns: minting OAuth2 access tokens (service-account key file
//! when `GOOGLE_APPLICATION_CREDENTIALS` points at one, metadata server
//! otherwise), and the Generic Artifact Registry REST surface (list files
//! with a name filter, multipart upload). Tokens are minted per operation
//! and never cached.

use std::path::PathBuf;
use std::time::Duration;

use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const SCOPE_CLOUD_PLATFORM: &str = "https://www.googleapis.com/auth/cloud-platform";

const CREDENTIALS_ENV: &str = "GOOGLE_APPLICATION_CREDENTIALS";
const DEFAULT_REGISTRY_BASE: &str = "https://artifactregistry.googleapis.com";
const DEFAULT_METADATA_BASE: &str = "http://metadata.google.internal";
const ASSERTION_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_TTL: Duration = Duration::from_secs(3600);

/// Timeout for the token mint itself.
pub const TOKEN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum GcpError {
    #[error("failed to read gcp credentials {path}: {source}")]
    Credentials {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed gcp credentials {path}: {source}")]
    CredentialsFormat {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed to sign token assertion: {0}")]
    Assertion(#[source] jsonwebtoken::errors::Error),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected http status {status} from {context}")]
    Status { status: u16, context: String },
    #[error("gcp error: {0}")]
    Api(String),
}

pub type Result<T> = std::result::Result<T, GcpError>;

/// A file already present at the generic destination, as reported by the
/// list call.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryFile {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub hashes: Vec<FileHash>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileHash {
    #[serde(rename = "type", default)]
    pub hash_type: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    token_uri: String,
}

#[derive(Debug)]
pub struct GcpClient {
    http: reqwest::Client,
    registry_base: String,
    metadata_base: String,
    credentials_file: Option<PathBuf>,
}

impl GcpClient {
    pub fn new() -> Result<Self> {
        Ok(Self {
            http: reqwest::Client::builder()
                .user_agent(concat!("harvestd/", env!("CARGO_PKG_VERSION")))
                .build()?,
            registry_base: DEFAULT_REGISTRY_BASE.to_string(),
            metadata_base: DEFAULT_METADATA_BASE.to_string(),
            credentials_file: std::env::var_os(CREDENTIALS_ENV).map(PathBuf::from),
        })
    }

    pub fn with_registry_base(mut self, base: &str) -> Self {
        self.registry_base = base.trim_end_matches('/').to_string();
        self
    }

    pub fn with_metadata_base(mut self, base: &str) -> Self {
        self.metadata_base = base.trim_end_matches('/').to_string();
        self
    }

    pub fn with_credentials_file(mut self, path: PathBuf) -> Self {
        self.credentials_file = Some(path);
        self
    }

    /// Fetch an access token for `scope` from the default credential
    /// chain: a service-account key file when configured, the instance
    /// metadata server otherwise.
    pub async fn access_token(&self, scope: &str) -> Result<String> {
        match &self.credentials_file {
            Some(path) => self.token_from_key_file(path.clone(), scope).await,
            None => self.token_from_metadata(scope).await,
        }
    }

    async fn token_from_key_file(&self, path: PathBuf, scope: &str) -> Result<String> {
        #[derive(Serialize)]
        struct Claims<'a> {
            iss: &'a str,
            scope: &'a str,
            aud: &'a str,
            iat: i64,
            exp: i64,
        }
        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
        }

        let bytes = std::fs::read(&path).map_err(|source| GcpError::Credentials {
            path: path.clone(),
            source,
        })?;
        let key: ServiceAccountKey =
            serde_json::from_slice(&bytes).map_err(|source| GcpError::CredentialsFormat {
                path: path.clone(),
                source,
            })?;

        let signing_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .map_err(GcpError::Assertion)?;
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            iss: &key.client_email,
            scope,
            aud: &key.token_uri,
            iat: now,
            exp: now + ASSERTION_TTL.as_secs() as i64,
        };
        let assertion =
            jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &signing_key)
                .map_err(GcpError::Assertion)?;

        let response = self
            .http
            .post(&key.token_uri)
            .timeout(TOKEN_TIMEOUT)
            .form(&[("grant_type", ASSERTION_GRANT), ("assertion", &assertion)])
            .send()
            .await?;
        if response.status() != StatusCode::OK {
            return Err(GcpError::Status {
                status: response.status().as_u16(),
                context: key.token_uri,
            });
        }
        let token: TokenResponse = response.json().await?;
        Ok(token.access_token)
    }

    async fn token_from_metadata(&self, scope: &str) -> Result<String> {
        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
        }

        let url = format!(
            "{}/computeMetadata/v1/instance/service-accounts/default/token",
            self.metadata_base,
        );
        let response = self
            .http
            .get(&url)
            .timeout(TOKEN_TIMEOUT)
            .header("metadata-flavor", "Google")
            .query(&[("scopes", scope)])
            .send()
            .await?;
        if response.status() != StatusCode::OK {
            return Err(GcpError::Status {
                status: response.status().as_u16(),
                context: url,
            });
        }
        let token: TokenResponse = response.json().await?;
        Ok(token.access_token)
    }

    /// List destination files whose resource name matches `filter`.
    pub async fn list_files(
        &self,
        parent: &str,
        filter: &str,
        token: &str,
    ) -> Result<Vec<RegistryFile>> {
        #[derive(Deserialize)]
        struct ListResponse {
            #[serde(default)]
            files: Vec<RegistryFile>,
        }

        let url = format!("{}/v1/{parent}/files", self.registry_base);
        let response = self
            .http
            .get(&url)
            .bearer_auth(token)
            .query(&[("filter", filter)])
            .send()
            .await?;
        if response.status() != StatusCode::OK {
            return Err(GcpError::Status {
                status: response.status().as_u16(),
                context: url,
            });
        }
        let list: ListResponse = response.json().await?;
        Ok(list.files)
    }

    /// Upload one file into a generic package version. The media and its
    /// metadata travel in a single multipart/related request.
    pub async fn upload_generic(
        &self,
        parent: &str,
        filename: &str,
        package_id: &str,
        version_id: &str,
        media: Vec<u8>,
        token: &str,
    ) -> Result<()> {
        #[derive(Serialize)]
        struct UploadRequest<'a> {
            filename: &'a str,
            #[serde(rename = "packageId")]
            package_id: &'a str,
            #[serde(rename = "versionId")]
            version_id: &'a str,
        }
        #[derive(Deserialize, Default)]
        struct UploadResponse {
            #[serde(default)]
            operation: Option<Operation>,
        }
        #[derive(Deserialize)]
        struct Operation {
            #[serde(default)]
            error: Option<OperationError>,
        }
        #[derive(Deserialize)]
        struct OperationError {
            #[serde(default)]
            message: String,
        }

        let metadata = serde_json::to_vec(&UploadRequest {
            filename,
            package_id,
            version_id,
        })
        .map_err(|e| GcpError::Api(e.to_string()))?;

        let boundary = format!("harvestd-{}", rand_boundary());
        let body = multipart_related(&metadata, &media, &boundary);

        let url = format!(
            "{}/upload/v1/{parent}/genericArtifacts:create",
            self.registry_base,
        );
        let response = self
            .http
            .post(&url)
            .bearer_auth(token)
            .query(&[("uploadType", "multipart"), ("alt", "json")])
            .header(
                reqwest::header::CONTENT_TYPE,
                format!("multipart/related; boundary={boundary}"),
            )
            .body(body)
            .send()
            .await?;

        let status = response.status();
        let payload: UploadResponse = response.json().await.unwrap_or_default();
        if let Some(error) = payload.operation.and_then(|op| op.error) {
            return Err(GcpError::Api(error.message));
        }
        if status != StatusCode::OK {
            return Err(GcpError::Status {
                status: status.as_u16(),
                context: url,
            });
        }
        Ok(())
    }
}

fn rand_boundary() -> String {
    format!("{:016x}", rand::random::<u64>())
}

fn multipart_related(metadata: &[u8], media: &[u8], boundary: &str) -> Vec<u8> {
    let mut body = Vec::with_capacity(metadata.len() + media.len() + 256);
    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
    body.extend_from_slice(metadata);
    body.extend_from_slice(format!("\r\n--{boundary}\r\n").as_bytes());
    body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
    body.extend_from_slice(media);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TEST_RSA_KEY: &str = include_str!("../testdata/test_rsa_key.pem");

    fn write_credentials(dir: &tempfile::TempDir, token_uri: &str) -> PathBuf {
        let path = dir.path().join("sa.json");
        let key = serde_json::json!({
            "type": "service_account",
            "client_email": "svc@project.iam.gserviceaccount.com",
            "private_key": TEST_RSA_KEY,
            "token_uri": token_uri,
        });
        std::fs::write(&path, serde_json::to_vec(&key).unwrap()).unwrap();
        path
    }

    #[tokio::test]
    async fn key_file_token_exchange() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                serde_json::json!({"access_token": "gcp-tok", "token_type": "Bearer"}),
            ))
            .mount(&server)
            .await;

        let dir = tempfile::TempDir::new().unwrap();
        let creds = write_credentials(&dir, &format!("{}/token", server.uri()));
        let client = GcpClient::new().unwrap().with_credentials_file(creds);

        let token = client.access_token(SCOPE_CLOUD_PLATFORM).await.unwrap();
        assert_eq!(token, "gcp-tok");
    }

    #[tokio::test]
    async fn metadata_token_fallback() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(
                "/computeMetadata/v1/instance/service-accounts/default/token",
            ))
            .and(header("metadata-flavor", "Google"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"access_token": "md-tok"})),
            )
            .mount(&server)
            .await;

        let mut client = GcpClient::new().unwrap().with_metadata_base(&server.uri());
        client.credentials_file = None;
        let token = client.access_token(SCOPE_CLOUD_PLATFORM).await.unwrap();
        assert_eq!(token, "md-tok");
    }

    #[tokio::test]
    async fn list_files_decodes_hashes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/projects/p/locations/us/repositories/generic/files"))
            .and(query_param(
                "filter",
                r#"name="projects/p/locations/us/repositories/generic/files/pkg:1.0:bin""#,
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "files": [{
                    "name": "projects/p/locations/us/repositories/generic/files/pkg:1.0:bin",
                    "hashes": [{"type": "SHA256", "value": "aGFzaA=="}]
                }]
            })))
            .mount(&server)
            .await;

        let client = GcpClient::new().unwrap().with_registry_base(&server.uri());
        let files = client
            .list_files(
                "projects/p/locations/us/repositories/generic",
                r#"name="projects/p/locations/us/repositories/generic/files/pkg:1.0:bin""#,
                "tok",
            )
            .await
            .unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].hashes[0].hash_type, "SHA256");
        assert_eq!(files[0].hashes[0].value, "aGFzaA==");
    }

    #[tokio::test]
    async fn upload_surfaces_operation_error_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(
                "/upload/v1/projects/p/locations/us/repositories/generic/genericArtifacts:create",
            ))
            .respond_with(ResponseTemplate::new(409).set_body_json(serde_json::json!({
                "operation": {"error": {"message": "version already exists"}}
            })))
            .mount(&server)
            .await;

        let client = GcpClient::new().unwrap().with_registry_base(&server.uri());
        let err = client
            .upload_generic(
                "projects/p/locations/us/repositories/generic",
                "bin",
                "pkg",
                "1.0",
                b"data".to_vec(),
                "tok",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GcpError::Api(msg) if msg == "version already exists"));
    }

    #[tokio::test]
    async fn upload_accepts_200() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(
                "/upload/v1/projects/p/locations/us/repositories/generic/genericArtifacts:create",
            ))
            .and(query_param("uploadType", "multipart"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let client = GcpClient::new().unwrap().with_registry_base(&server.uri());
        client
            .upload_generic(
                "projects/p/locations/us/repositories/generic",
                "bin",
                "pkg",
                "1.0",
                b"data".to_vec(),
                "tok",
            )
            .await
            .unwrap();
    }

    #[test]
    fn multipart_related_layout() {
        let body = multipart_related(b"{\"a\":1}", b"DATA", "b0");
        let text = String::from_utf8(body).unwrap();
        assert!(text.starts_with("--b0\r\n"));
        assert!(text.contains("Content-Type: application/json; charset=UTF-8\r\n\r\n{\"a\":1}"));
        assert!(text.contains("Content-Type: application/octet-stream\r\n\r\nDATA"));
        assert!(text.ends_with("--b0--\r\n"));
    }
}
