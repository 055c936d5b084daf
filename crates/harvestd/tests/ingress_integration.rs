//! End-to-end ingress flow: a signed webhook delivery becomes a persisted
//! job, the scheduler picks it up, and the discover handler fans out into
//! sync jobs against a mocked GitHub API.

use std::sync::Arc;

use axum::body::Body;
use axum::http::Request;
use harvest_core::job::{Job, JobKind};
use harvest_core::Config;
use harvestd::download::Downloader;
use harvestd::gcp::GcpClient;
use harvestd::github::GithubClient;
use harvestd::metrics::Metrics;
use harvestd::registry::RegistryClient;
use harvestd::scheduler::{Scheduler, QUEUE_CAPACITY};
use harvestd::server::{create_router, AppState};
use harvestd::store::JobStore;
use harvestd::upload::Uploader;
use harvestd::{handlers, Daemon};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SECRET: &str = "hush";
const TEST_RSA_KEY: &str = include_str!("../testdata/test_rsa_key.pem");

struct TestDaemon {
    daemon: Arc<Daemon>,
    _jobs_dir: TempDir,
    _downloads_dir: TempDir,
}

fn build_daemon(github_base: &str) -> TestDaemon {
    let jobs_dir = TempDir::new().unwrap();
    let downloads_dir = TempDir::new().unwrap();

    let yaml = format!(
        r#"
repositories:
  o/r:
    workflows:
      ci.yml:
        artifacts:
          "^bin-(.*)\\.zip$":
            destinations:
              - type: gcp.artifactregistry.generic
                path: projects/p/locations/us/repositories/generic
                package: pkg
github:
  app:
    id: 123
    installation_id: 456
    private_key: placeholder
  webhook_secret: {SECRET}
dir:
  jobs: {}
  downloads: {}
"#,
        jobs_dir.path().display(),
        downloads_dir.path().display(),
    );
    let mut config: Config = serde_yaml::from_str(&yaml).unwrap();
    config.github.app.private_key = TEST_RSA_KEY.to_string();
    let config = Arc::new(config);

    let metrics = Arc::new(Metrics::new().unwrap());
    let store = Arc::new(JobStore::new(&config.dir.jobs, None).unwrap());
    let github = Arc::new(
        GithubClient::new(&config.github.app)
            .unwrap()
            .with_api_base(github_base),
    );
    let registry = Arc::new(RegistryClient::new().unwrap());
    let gcp = Arc::new(GcpClient::new().unwrap());

    let downloader = Downloader::new(
        config.dir.downloads.clone(),
        Arc::clone(&github),
        Arc::clone(&registry),
    );
    let uploader = Uploader::new(gcp, registry, Arc::clone(&metrics));
    let scheduler = Arc::new(Scheduler::new(Arc::clone(&store), Arc::clone(&metrics)));

    TestDaemon {
        daemon: Arc::new(Daemon {
            config,
            store,
            scheduler,
            github,
            downloader,
            uploader,
            metrics,
        }),
        _jobs_dir: jobs_dir,
        _downloads_dir: downloads_dir,
    }
}

fn signed_workflow_request() -> Request<Body> {
    let body = serde_json::json!({
        "action": "completed",
        "repository": {"name": "r", "full_name": "o/r", "owner": {"login": "o"}},
        "workflow": {"path": ".github/workflows/ci.yml"},
        "workflow_run": {
            "id": 9,
            "status": "completed",
            "conclusion": "success",
            "head_sha": "abc",
            "triggering_actor": {"login": "octocat"}
        }
    });
    let bytes = serde_json::to_vec(&body).unwrap();

    let mut mac = Hmac::<Sha256>::new_from_slice(SECRET.as_bytes()).unwrap();
    mac.update(&bytes);
    let signature = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));

    Request::builder()
        .method("POST")
        .uri("/")
        .header("x-github-event", "workflow_run")
        .header("x-hub-signature-256", signature)
        .body(Body::from(bytes))
        .unwrap()
}

async fn mount_github(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/app/installations/456/access_tokens"))
        .respond_with(
            ResponseTemplate::new(201).set_body_json(serde_json::json!({"token": "inst-tok"})),
        )
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/repos/o/r/actions/runs/9/artifacts"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "total_count": 2,
            "artifacts": [
                {
                    "id": 7,
                    "name": "bin-1.2.3.zip",
                    "expired": false,
                    "url": "https://api.github.com/repos/o/r/actions/artifacts/7",
                    "workflow_run": {"id": 9, "head_sha": "abc"}
                },
                {
                    "id": 8,
                    "name": "other.zip",
                    "expired": false,
                    "url": "https://api.github.com/repos/o/r/actions/artifacts/8",
                    "workflow_run": {"id": 9, "head_sha": "abc"}
                }
            ]
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn webhook_to_artifact_fan_out() {
    let github = MockServer::start().await;
    mount_github(&github).await;

    let fixture = build_daemon(&github.uri());
    let daemon = &fixture.daemon;

    // 1. A signed workflow_run delivery persists one discover job.
    let router = create_router(Arc::new(AppState {
        config: Arc::clone(&daemon.config),
        store: Arc::clone(&daemon.store),
        metrics: Arc::clone(&daemon.metrics),
    }));
    let response = router.oneshot(signed_workflow_request()).await.unwrap();
    assert_eq!(response.status(), 200);

    let persisted = daemon.store.scan().unwrap();
    assert_eq!(persisted.len(), 1);
    assert!(persisted[0].ends_with("discover-workflow-artifacts-9.json"));

    // 2. The scheduler sweeps it into the work channel.
    let (tx, mut rx) = mpsc::channel(QUEUE_CAPACITY);
    daemon.scheduler.pump(&tx).await;
    let job = rx.try_recv().unwrap();
    assert_eq!(job.kind(), JobKind::DiscoverWorkflowArtifacts);

    // 3. Handling fans out into one sync job for the matching artifact,
    //    with the version captured from the artifact name.
    let outcome = handlers::handle(daemon, &job).await;
    assert!(outcome.is_ok());
    daemon.scheduler.settle(&job, &outcome);

    let persisted = daemon.store.scan().unwrap();
    assert_eq!(persisted.len(), 1);
    assert!(persisted[0].ends_with("sync-workflow-artifact-9-7.json"));

    let sync = JobStore::load(&persisted[0]).unwrap();
    match sync {
        Job::SyncWorkflowArtifact(j) => {
            assert_eq!(j.version, "1.2.3");
            assert_eq!(j.artifact_name(), "bin-1.2.3.zip");
            assert_eq!(j.destinations.len(), 1);
        }
        other => panic!("wrong job variant: {other:?}"),
    }

    // 4. The next sweep picks up the fan-out job.
    daemon.scheduler.pump(&tx).await;
    let job = rx.try_recv().unwrap();
    assert_eq!(job.kind(), JobKind::SyncWorkflowArtifact);
    assert_eq!(job.id(), "sync-workflow-artifact-9-7");
}

#[tokio::test]
async fn unparseable_job_file_is_cleaned_up_end_to_end() {
    let github = MockServer::start().await;
    let fixture = build_daemon(&github.uri());
    let daemon = &fixture.daemon;

    let bad = daemon.store.jobs_dir().join("corrupt.json");
    std::fs::write(&bad, b"{oops").unwrap();

    let (tx, mut rx) = mpsc::channel(QUEUE_CAPACITY);
    daemon.scheduler.pump(&tx).await;
    let job = rx.try_recv().unwrap();
    assert_eq!(job.kind(), JobKind::CleanupUnparseable);

    let outcome = handlers::handle(daemon, &job).await;
    daemon.scheduler.settle(&job, &outcome);

    assert!(!bad.exists());
    assert!(daemon.store.scan().unwrap().is_empty());
}
