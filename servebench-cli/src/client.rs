//! HTTP collaborators for a TorchServe-style model server
//!
//! `ManagementClient` talks to the management API (register, unregister,
//! list); `InferenceClient` posts multipart predictions.

use reqwest::StatusCode;
use reqwest::blocking::multipart::{Form, Part};
use reqwest::blocking::{Client, Response};
use servebench_core::{
    HitError, InferenceEndpoint, Registration, RegistrationRequest, ServiceError, ServiceManager,
    Unregistration,
};
use std::time::Duration;
use tracing::debug;

fn build_client(timeout: Duration) -> reqwest::Result<Client> {
    Client::builder().timeout(timeout).build()
}

fn transport_error(e: reqwest::Error) -> ServiceError {
    if e.is_connect() {
        ServiceError::Unreachable(e.to_string())
    } else {
        ServiceError::Transport(e.to_string())
    }
}

fn unexpected(operation: &str, response: Response) -> ServiceError {
    let status = response.status().as_u16();
    ServiceError::UnexpectedStatus {
        operation: operation.to_string(),
        status,
        body: response.text().unwrap_or_default(),
    }
}

/// Client for the management API
#[derive(Debug, Clone)]
pub struct ManagementClient {
    client: Client,
    inference_url: String,
    management_url: String,
}

impl ManagementClient {
    /// `inference_url` is only used for the `/ping` health check.
    pub fn new(inference_url: &str, management_url: &str, timeout: Duration) -> reqwest::Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            inference_url: inference_url.trim_end_matches('/').to_string(),
            management_url: management_url.trim_end_matches('/').to_string(),
        })
    }

    fn health_ok(&self, url: &str) -> Result<bool, ServiceError> {
        let response = self.client.get(url).send().map_err(transport_error)?;
        debug!(%url, status = %response.status(), "health check");
        Ok(response.status() == StatusCode::OK)
    }

    /// Inference API `/ping` answers 200
    pub fn ping(&self) -> Result<bool, ServiceError> {
        self.health_ok(&format!("{}/ping", self.inference_url))
    }

    /// Management API `/models` answers 200
    pub fn management_ok(&self) -> Result<bool, ServiceError> {
        self.health_ok(&format!("{}/models", self.management_url))
    }

    /// Registered models, as returned by the server
    pub fn list_models(&self) -> Result<serde_json::Value, ServiceError> {
        self.get_json("list models", &format!("{}/models", self.management_url))
    }

    /// Details of one registered model
    pub fn describe_model(&self, model_name: &str) -> Result<serde_json::Value, ServiceError> {
        self.get_json(
            "describe model",
            &format!("{}/models/{}", self.management_url, model_name),
        )
    }

    fn get_json(&self, operation: &str, url: &str) -> Result<serde_json::Value, ServiceError> {
        let response = self.client.get(url).send().map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(unexpected(operation, response));
        }
        response
            .json()
            .map_err(|e| ServiceError::Transport(format!("{} returned invalid JSON: {}", operation, e)))
    }
}

impl ServiceManager for ManagementClient {
    fn is_running(&self) -> Result<bool, ServiceError> {
        Ok(self.ping()? && self.management_ok()?)
    }

    fn register(&self, request: &RegistrationRequest) -> Result<Registration, ServiceError> {
        let url = format!("{}/models", self.management_url);
        let params = [
            ("url", request.archive.clone()),
            ("batch_size", request.batch_size.to_string()),
            ("max_batch_delay", request.max_batch_delay_ms.to_string()),
            ("initial_workers", request.initial_workers.to_string()),
        ];
        let response = self
            .client
            .post(&url)
            .query(&params)
            .send()
            .map_err(transport_error)?;

        match response.status() {
            s if s.is_success() => Ok(Registration::Created),
            StatusCode::CONFLICT => Ok(Registration::AlreadyRegistered),
            _ => Err(unexpected("register", response)),
        }
    }

    fn unregister(&self, model_name: &str) -> Result<Unregistration, ServiceError> {
        let url = format!("{}/models/{}", self.management_url, model_name);
        let response = self.client.delete(&url).send().map_err(transport_error)?;

        match response.status() {
            s if s.is_success() => Ok(Unregistration::Removed),
            StatusCode::NOT_FOUND => Ok(Unregistration::NotRegistered),
            _ => Err(unexpected("unregister", response)),
        }
    }
}

/// One named file in a multipart prediction request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePart {
    /// Form field name
    pub name: String,
    /// File name reported to the server
    pub file_name: String,
    /// File contents
    pub bytes: Vec<u8>,
}

/// Successful prediction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prediction {
    /// HTTP status, always 2xx
    pub status: u16,
    /// Raw response body
    pub body: String,
}

/// Client for `/predictions/{model}`
#[derive(Debug, Clone)]
pub struct InferenceClient {
    client: Client,
    url: String,
}

impl InferenceClient {
    /// Client posting to `{inference_url}/predictions/{model_name}`
    pub fn new(inference_url: &str, model_name: &str, timeout: Duration) -> reqwest::Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            url: format!(
                "{}/predictions/{}",
                inference_url.trim_end_matches('/'),
                model_name
            ),
        })
    }

    /// Full prediction URL
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl InferenceEndpoint for InferenceClient {
    type Payload = Vec<FilePart>;
    type Response = Prediction;

    fn predict(&self, payload: Vec<FilePart>) -> Result<Prediction, HitError> {
        let form = payload.into_iter().fold(Form::new(), |form, part| {
            form.part(part.name, Part::bytes(part.bytes).file_name(part.file_name))
        });

        let response = self
            .client
            .post(&self.url)
            .multipart(form)
            .send()
            .map_err(|e| HitError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .map_err(|e| HitError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(HitError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(Prediction {
            status: status.as_u16(),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn manager(server: &mockito::Server) -> ManagementClient {
        ManagementClient::new(&server.url(), &server.url(), Duration::from_secs(5)).unwrap()
    }

    fn request() -> RegistrationRequest {
        RegistrationRequest {
            model_name: "resnet-18".to_string(),
            archive: "resnet-18.mar".to_string(),
            batch_size: 8,
            max_batch_delay_ms: 100,
            initial_workers: 2,
        }
    }

    #[test]
    fn test_is_running_requires_both_apis() {
        let mut server = mockito::Server::new();
        let ping = server.mock("GET", "/ping").with_status(200).create();
        let models = server.mock("GET", "/models").with_status(200).with_body("{}").create();
        assert!(manager(&server).is_running().unwrap());
        ping.assert();
        models.assert();

        let mut server = mockito::Server::new();
        let _ping = server.mock("GET", "/ping").with_status(200).create();
        let _models = server.mock("GET", "/models").with_status(500).create();
        assert!(!manager(&server).is_running().unwrap());

        let mut server = mockito::Server::new();
        let _ping = server.mock("GET", "/ping").with_status(503).create();
        assert!(!manager(&server).is_running().unwrap());
    }

    #[test]
    fn test_unreachable_server() {
        let client = ManagementClient::new(
            "http://127.0.0.1:1",
            "http://127.0.0.1:1",
            Duration::from_secs(2),
        )
        .unwrap();
        assert!(matches!(client.is_running(), Err(ServiceError::Unreachable(_))));
    }

    #[test]
    fn test_register_sends_query_params() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/models")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("url".into(), "resnet-18.mar".into()),
                Matcher::UrlEncoded("batch_size".into(), "8".into()),
                Matcher::UrlEncoded("max_batch_delay".into(), "100".into()),
                Matcher::UrlEncoded("initial_workers".into(), "2".into()),
            ]))
            .with_status(200)
            .create();

        assert_eq!(manager(&server).register(&request()).unwrap(), Registration::Created);
        mock.assert();
    }

    #[test]
    fn test_register_conflict_is_already_registered() {
        let mut server = mockito::Server::new();
        let _register = server
            .mock("POST", "/models")
            .match_query(Matcher::Any)
            .with_status(409)
            .create();
        assert_eq!(
            manager(&server).register(&request()).unwrap(),
            Registration::AlreadyRegistered
        );
    }

    #[test]
    fn test_register_other_status_fails() {
        let mut server = mockito::Server::new();
        let _register = server
            .mock("POST", "/models")
            .match_query(Matcher::Any)
            .with_status(500)
            .with_body("archive not found")
            .create();
        match manager(&server).register(&request()) {
            Err(ServiceError::UnexpectedStatus { status, body, .. }) => {
                assert_eq!(status, 500);
                assert_eq!(body, "archive not found");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_unregister_statuses() {
        let mut server = mockito::Server::new();
        let _a = server.mock("DELETE", "/models/a").with_status(200).create();
        let _b = server.mock("DELETE", "/models/b").with_status(404).create();
        let _c = server.mock("DELETE", "/models/c").with_status(500).create();
        let client = manager(&server);
        assert_eq!(client.unregister("a").unwrap(), Unregistration::Removed);
        assert_eq!(client.unregister("b").unwrap(), Unregistration::NotRegistered);
        assert!(client.unregister("c").is_err());
    }

    #[test]
    fn test_list_and_describe_models() {
        let mut server = mockito::Server::new();
        let _models = server
            .mock("GET", "/models")
            .with_status(200)
            .with_body(r#"{"models":[{"modelName":"resnet-18"}]}"#)
            .create();
        let _details = server
            .mock("GET", "/models/resnet-18")
            .with_status(200)
            .with_body(r#"[{"modelName":"resnet-18","batchSize":8}]"#)
            .create();
        let client = manager(&server);
        let models = client.list_models().unwrap();
        assert_eq!(models["models"][0]["modelName"], "resnet-18");
        let details = client.describe_model("resnet-18").unwrap();
        assert_eq!(details[0]["batchSize"], 8);
    }

    #[test]
    fn test_predict_multipart() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/predictions/resnet-18")
            .match_header("content-type", Matcher::Regex("multipart/form-data".into()))
            .match_body(Matcher::Regex("kitten.jpg".into()))
            .with_status(200)
            .with_body("tabby")
            .create();

        let client = InferenceClient::new(&server.url(), "resnet-18", Duration::from_secs(5)).unwrap();
        let prediction = client
            .predict(vec![FilePart {
                name: "input0".to_string(),
                file_name: "kitten.jpg".to_string(),
                bytes: b"not really a jpeg".to_vec(),
            }])
            .unwrap();
        assert_eq!(prediction.body, "tabby");
        mock.assert();
    }

    #[test]
    fn test_predict_error_status_is_hit_error() {
        let mut server = mockito::Server::new();
        let _predict = server
            .mock("POST", "/predictions/resnet-18")
            .with_status(503)
            .with_body("worker died")
            .create();
        let client = InferenceClient::new(&server.url(), "resnet-18", Duration::from_secs(5)).unwrap();
        assert_eq!(
            client.predict(Vec::new()).unwrap_err(),
            HitError::Status {
                status: 503,
                body: "worker died".to_string()
            }
        );
    }
}
