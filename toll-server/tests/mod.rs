use std::{
    error::Error,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener},
    time::Duration,
};

use camino::Utf8PathBuf;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tracing::Level;
use url::Url;
use uuid::Uuid;
use wiremock::MockServer;

use toll_server::{
    app::{App, Args},
    integrations::postmark::POSTMARK_API_TOKEN_ENV,
    store::AccountStore,
};

pub mod api;

/// The server under test, wired to mock lookup and email backends.
pub struct TestApp {
    url: Url,
    accounts_file: Utf8PathBuf,
    pub lookup_server: MockServer,
    pub postmark_server: MockServer,
}

#[derive(Error, Debug)]
pub enum TestError {
    #[error("failed to connect to test server: {0}")]
    ConnectError(#[source] reqwest::Error),
    #[error("failed to check test server health")]
    HealthCheckError,
    #[error("failed to parse URL: {0}")]
    UrlError(#[from] url::ParseError),
    #[error("failed to execute request: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("failed to serialize/deserialize JSON: {0}")]
    JSONSerializationError(#[from] serde_json::Error),
}

impl TestApp {
    pub async fn start_and_connect() -> (Self, TestClient) {
        let app = Self::start().await;
        let client = app.connect().await.unwrap();
        (app, client)
    }

    pub async fn start() -> Self {
        let lookup_server = MockServer::start().await;
        let postmark_server = MockServer::start().await;

        std::env::set_var(POSTMARK_API_TOKEN_ENV, "server-token");

        let accounts_file = Utf8PathBuf::from_path_buf(std::env::temp_dir())
            .expect("temporary directory is not UTF-8")
            .join(format!("it_{}.json", Uuid::new_v4()));
        let port = next_available_port();
        let listen_address = SocketAddr::from(([127, 0, 0, 1], port));

        let app = App::with_args(Args {
            listen_address,
            accounts_file: accounts_file.clone(),
            lookup_url: lookup_server.uri(),
            postmark_url: postmark_server.uri(),
            disable_background_jobs: true,
            ..Args::default()
        });

        let _ = tokio::spawn(async move { app.run().await });

        let url =
            Url::parse(&format!("http://127.0.0.1:{}", port)).expect("failed to generate URL");

        Self {
            url,
            accounts_file,
            lookup_server,
            postmark_server,
        }
    }

    pub async fn connect(&self) -> Result<TestClient, TestError> {
        let mut remaining_tries = 50;
        let client = reqwest::Client::new();

        while remaining_tries > 0 {
            let result = client
                .request(reqwest::Method::GET, self.url.join("/health")?)
                .send()
                .await;
            match result {
                Ok(res) => {
                    if res.text().await?.trim() == "UP" {
                        break;
                    } else {
                        return Err(TestError::HealthCheckError);
                    }
                }
                Err(e) => {
                    if let Some(source) = e.source() {
                        if let Some(hyper_error) = source.downcast_ref::<hyper::Error>() {
                            if hyper_error.is_connect() {
                                tokio::time::sleep(Duration::from_millis(20)).await;
                                remaining_tries -= 1;
                                continue;
                            }
                        }
                    }
                    return Err(TestError::ConnectError(e));
                }
            }
        }

        Ok(TestClient(client, self.url.clone()))
    }

    /// The accounts as the server last wrote them to disk.
    pub async fn store(&self) -> AccountStore {
        AccountStore::open(&self.accounts_file)
            .await
            .expect("failed to read test accounts file")
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.accounts_file) {
            tracing::trace!(
                "test accounts file {} not removed: {}",
                self.accounts_file,
                e
            );
        }
    }
}

fn next_available_port() -> u16 {
    for _ in 0..10 {
        if let Some(port) = bind_os_available_port() {
            return port;
        }
    }

    panic!("no port available")
}

fn bind_os_available_port() -> Option<u16> {
    TcpListener::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|l| l.local_addr())
        .map(|a| a.port())
        .ok()
}

pub struct TestClient(reqwest::Client, Url);

pub type TestResult<T> = Result<T, TestError>;

impl TestClient {
    pub async fn get_string(&self, path: &str) -> TestResult<String> {
        Ok(self
            .0
            .request(reqwest::Method::GET, self.1.join(path)?)
            .send()
            .await?
            .text()
            .await?)
    }

    pub async fn get<RS: DeserializeOwned>(&self, path: &str) -> TestResult<RS> {
        self.execute_json_request_response(reqwest::Method::GET, path, None::<()>)
            .await
    }

    pub async fn post<RQ: Serialize, RS: DeserializeOwned>(
        &self,
        path: &str,
        body: RQ,
    ) -> TestResult<RS> {
        self.execute_json_request_response(reqwest::Method::POST, path, Some(body))
            .await
    }

    pub async fn patch<RQ: Serialize, RS: DeserializeOwned>(
        &self,
        path: &str,
        body: RQ,
    ) -> TestResult<RS> {
        self.execute_json_request_response(reqwest::Method::PATCH, path, Some(body))
            .await
    }

    pub async fn delete(&self, path: &str) -> TestResult<()> {
        self.0
            .request(reqwest::Method::DELETE, self.1.join(path)?)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Sends `body` as-is and returns the status and JSON body, whatever the
    /// status.
    pub async fn post_raw(
        &self,
        path: &str,
        body: &'static str,
    ) -> TestResult<(reqwest::StatusCode, serde_json::Value)> {
        let response = self
            .0
            .request(reqwest::Method::POST, self.1.join(path)?)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;
        let status = response.status();
        Ok((status, response.json().await?))
    }

    async fn execute_json_request_response<RQ: Serialize, RS: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<RQ>,
    ) -> Result<RS, TestError> {
        let mut req = self.0.request(method, self.1.join(path)?);
        if let Some(body) = body {
            if tracing::event_enabled!(Level::DEBUG) {
                tracing::debug!(body = serde_json::to_string(&body)?, "sending request");
            }
            req = req.json(&body);
        }
        let response = self.0.execute(req.build()?).await?;
        response
            .error_for_status_ref()
            .map_err(TestError::RequestError)?;
        let bytes = response.bytes().await?;
        let json: serde_json::Value = serde_json::from_slice(&bytes)?;
        tracing::debug!(body = json.to_string(), "received response");
        Ok(serde_json::from_value(json)?)
    }
}
