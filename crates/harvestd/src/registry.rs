//! Minimal container-registry client.
//!
//! Speaks the subset of the OCI distribution protocol the daemon needs:
//! manifest GET/PUT, blob HEAD/GET and the two-step blob upload. Handles
//! the bearer-token challenge dance transparently; credentials are passed
//! per call and never cached.

use std::collections::HashMap;

use harvest_core::manifest::{Digest, DigestError, MEDIA_TYPE_OCI_MANIFEST};
use reqwest::header;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid image reference: {0}")]
    InvalidReference(String),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected http status {status} from {context}")]
    Status { status: u16, context: String },
    #[error("registry did not return an upload location")]
    MissingUploadLocation,
    #[error(transparent)]
    Digest(#[from] DigestError),
    #[error("bearer token exchange failed: {0}")]
    TokenExchange(String),
}

impl RegistryError {
    /// Whether retrying the operation later could plausibly succeed.
    /// Protocol rejections (4xx other than timeout/throttling) will not.
    pub fn is_temporary(&self) -> bool {
        match self {
            Self::Http(_) => true,
            Self::Status { status, .. } => {
                *status == 408 || *status == 429 || *status >= 500
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// `registry/repository[:tag][@digest]` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub registry: String,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<Digest>,
}

impl Reference {
    pub fn parse(s: &str) -> Result<Self> {
        let (base, digest) = match s.split_once('@') {
            Some((base, digest)) => (base, Some(Digest::parse(digest)?)),
            None => (s, None),
        };

        let (path, tag) = match base.rfind(':') {
            // A colon inside the last path segment is a tag separator; a
            // colon before the last `/` is part of a host:port.
            Some(idx) if !base[idx..].contains('/') => {
                (&base[..idx], Some(base[idx + 1..].to_string()))
            }
            _ => (base, None),
        };

        let Some((registry, repository)) = path.split_once('/') else {
            return Err(RegistryError::InvalidReference(s.to_string()));
        };
        if repository.is_empty()
            || !(registry.contains('.') || registry.contains(':') || registry == "localhost")
        {
            return Err(RegistryError::InvalidReference(s.to_string()));
        }
        if tag.as_deref().is_some_and(str::is_empty) {
            return Err(RegistryError::InvalidReference(s.to_string()));
        }

        Ok(Self {
            registry: registry.to_string(),
            repository: repository.to_string(),
            tag,
            digest,
        })
    }

    /// What to fetch or push under: digest wins over tag, default `latest`.
    pub fn identifier(&self) -> String {
        if let Some(digest) = &self.digest {
            return digest.to_string();
        }
        self.tag.clone().unwrap_or_else(|| "latest".to_string())
    }

    fn base_url(&self) -> String {
        let scheme = if self.registry.starts_with("localhost")
            || self.registry.starts_with("127.0.0.1")
        {
            "http"
        } else {
            "https"
        };
        format!("{scheme}://{}", self.registry)
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

/// Per-call credentials, sent as basic auth or exchanged for a bearer
/// token when the registry asks for one.
#[derive(Debug, Clone)]
pub struct RegistryAuth {
    pub username: String,
    pub password: String,
}

impl RegistryAuth {
    /// The username registries expect alongside an OAuth2 access token.
    pub fn oauth2(token: String) -> Self {
        Self {
            username: "oauth2accesstoken".to_string(),
            password: token,
        }
    }
}

#[derive(Debug)]
pub struct ManifestResponse {
    pub bytes: Vec<u8>,
    pub media_type: String,
    pub digest: Digest,
}

const MANIFEST_ACCEPT: &str = concat_accept();

const fn concat_accept() -> &'static str {
    // Accept both index and single-image manifests, OCI and Docker.
    concat!(
        "application/vnd.oci.image.index.v1+json",
        ", application/vnd.oci.image.manifest.v1+json",
        ", application/vnd.docker.distribution.manifest.list.v2+json",
        ", application/vnd.docker.distribution.manifest.v2+json"
    )
}

#[derive(Debug)]
pub struct RegistryClient {
    http: reqwest::Client,
}

impl RegistryClient {
    pub fn new() -> Result<Self> {
        Ok(Self {
            http: reqwest::Client::builder()
                .user_agent(concat!("harvestd/", env!("CARGO_PKG_VERSION")))
                .build()?,
        })
    }

    pub async fn get_manifest(
        &self,
        reference: &Reference,
        auth: &RegistryAuth,
    ) -> Result<ManifestResponse> {
        let url = format!(
            "{}/v2/{}/manifests/{}",
            reference.base_url(),
            reference.repository,
            reference.identifier(),
        );
        let response = self
            .send(
                self.http
                    .request(Method::GET, &url)
                    .header(header::ACCEPT, MANIFEST_ACCEPT),
                auth,
            )
            .await?;
        let response = expect_status(response, &[StatusCode::OK], &url)?;

        let media_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(MEDIA_TYPE_OCI_MANIFEST)
            .to_string();
        let digest = response
            .headers()
            .get("docker-content-digest")
            .and_then(|v| v.to_str().ok())
            .map(Digest::parse)
            .transpose()?;
        let bytes = response.bytes().await?.to_vec();
        let digest = digest.unwrap_or_else(|| Digest::from_bytes(&bytes));

        Ok(ManifestResponse {
            bytes,
            media_type,
            digest,
        })
    }

    pub async fn get_manifest_by_digest(
        &self,
        reference: &Reference,
        digest: &Digest,
        auth: &RegistryAuth,
    ) -> Result<ManifestResponse> {
        let by_digest = Reference {
            tag: None,
            digest: Some(digest.clone()),
            ..reference.clone()
        };
        self.get_manifest(&by_digest, auth).await
    }

    pub async fn get_blob(
        &self,
        reference: &Reference,
        digest: &Digest,
        auth: &RegistryAuth,
    ) -> Result<Vec<u8>> {
        let url = format!(
            "{}/v2/{}/blobs/{}",
            reference.base_url(),
            reference.repository,
            digest,
        );
        let response = self
            .send(self.http.request(Method::GET, &url), auth)
            .await?;
        let response = expect_status(response, &[StatusCode::OK], &url)?;
        Ok(response.bytes().await?.to_vec())
    }

    pub async fn blob_exists(
        &self,
        reference: &Reference,
        digest: &Digest,
        auth: &RegistryAuth,
    ) -> Result<bool> {
        let url = format!(
            "{}/v2/{}/blobs/{}",
            reference.base_url(),
            reference.repository,
            digest,
        );
        let response = self
            .send(self.http.request(Method::HEAD, &url), auth)
            .await?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(RegistryError::Status {
                status: status.as_u16(),
                context: url,
            }),
        }
    }

    /// Two-step upload: open an upload session, then PUT the content
    /// against the returned location with the digest attached.
    pub async fn upload_blob(
        &self,
        reference: &Reference,
        digest: &Digest,
        bytes: Vec<u8>,
        auth: &RegistryAuth,
    ) -> Result<()> {
        let start_url = format!(
            "{}/v2/{}/blobs/uploads/",
            reference.base_url(),
            reference.repository,
        );
        let response = self
            .send(self.http.request(Method::POST, &start_url), auth)
            .await?;
        let response = expect_status(response, &[StatusCode::ACCEPTED], &start_url)?;

        let location = response
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(RegistryError::MissingUploadLocation)?;
        let location = if location.starts_with("http://") || location.starts_with("https://") {
            location.to_string()
        } else {
            format!("{}{location}", reference.base_url())
        };
        let separator = if location.contains('?') { '&' } else { '?' };
        let put_url = format!("{location}{separator}digest={digest}");

        let response = self
            .send(
                self.http
                    .request(Method::PUT, &put_url)
                    .header(header::CONTENT_TYPE, "application/octet-stream")
                    .body(bytes),
                auth,
            )
            .await?;
        expect_status(response, &[StatusCode::CREATED], &put_url)?;
        Ok(())
    }

    /// PUT a manifest under a tag or digest identifier.
    pub async fn put_manifest(
        &self,
        reference: &Reference,
        identifier: &str,
        media_type: &str,
        bytes: Vec<u8>,
        auth: &RegistryAuth,
    ) -> Result<()> {
        let url = format!(
            "{}/v2/{}/manifests/{identifier}",
            reference.base_url(),
            reference.repository,
        );
        let response = self
            .send(
                self.http
                    .request(Method::PUT, &url)
                    .header(header::CONTENT_TYPE, media_type)
                    .body(bytes),
                auth,
            )
            .await?;
        expect_status(response, &[StatusCode::CREATED, StatusCode::OK], &url)?;
        Ok(())
    }

    /// Send with basic credentials; on a bearer challenge, exchange them
    /// for a token at the advertised realm and retry once.
    async fn send(&self, request: RequestBuilder, auth: &RegistryAuth) -> Result<Response> {
        let basic = request
            .try_clone()
            .ok_or_else(|| RegistryError::TokenExchange("unclonable request".to_string()))?
            .basic_auth(&auth.username, Some(&auth.password));
        let response = basic.send().await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }
        let Some(challenge) = response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_bearer_challenge)
        else {
            return Ok(response);
        };

        debug!(realm = %challenge.realm, "registry requested bearer auth");
        let token = self.exchange_token(&challenge, auth).await?;
        Ok(request.bearer_auth(token).send().await?)
    }

    async fn exchange_token(
        &self,
        challenge: &BearerChallenge,
        auth: &RegistryAuth,
    ) -> Result<String> {
        #[derive(serde::Deserialize)]
        struct TokenResponse {
            token: Option<String>,
            access_token: Option<String>,
        }

        let mut request = self
            .http
            .get(&challenge.realm)
            .basic_auth(&auth.username, Some(&auth.password));
        if let Some(service) = &challenge.service {
            request = request.query(&[("service", service)]);
        }
        if let Some(scope) = &challenge.scope {
            request = request.query(&[("scope", scope)]);
        }

        let response = request.send().await?;
        if response.status() != StatusCode::OK {
            return Err(RegistryError::TokenExchange(format!(
                "unexpected http status: {}",
                response.status().as_u16(),
            )));
        }
        let token: TokenResponse = response.json().await?;
        token
            .token
            .or(token.access_token)
            .ok_or_else(|| RegistryError::TokenExchange("response carried no token".to_string()))
    }
}

struct BearerChallenge {
    realm: String,
    service: Option<String>,
    scope: Option<String>,
}

fn parse_bearer_challenge(header: &str) -> Option<BearerChallenge> {
    let params = header.strip_prefix("Bearer ")?;
    let mut fields = HashMap::new();
    for pair in params.split(',') {
        let (key, value) = pair.trim().split_once('=')?;
        fields.insert(key, value.trim_matches('"').to_string());
    }
    Some(BearerChallenge {
        realm: fields.remove("realm")?,
        service: fields.remove("service"),
        scope: fields.remove("scope"),
    })
}

fn expect_status(response: Response, ok: &[StatusCode], context: &str) -> Result<Response> {
    if ok.contains(&response.status()) {
        return Ok(response);
    }
    Err(RegistryError::Status {
        status: response.status().as_u16(),
        context: context.to_string(),
    })
}
