use std::time::Duration;

use async_trait::async_trait;
use pinwatch_common::{CloudConfig, FetchError, PinSnapshot};
use reqwest::Url;
use tracing::debug;

const MAX_ERROR_BODY_CHARS: usize = 256;

/// Read/write access to the device's values on the cloud API.
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    async fn fetch_snapshot(&self) -> Result<PinSnapshot, FetchError>;

    async fn update_value(&self, pin: &str, value: &str) -> Result<(), FetchError>;
}

/// HTTP client for the Blynk-style external API (`/get` and `/update` with a token query).
#[derive(Debug, Clone)]
pub struct CloudClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
    pins: Vec<String>,
    timeout: Duration,
}

impl CloudClient {
    pub fn new(cloud: &CloudConfig, pins: Vec<String>, timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: cloud.base_url.trim_end_matches('/').to_string(),
            token: cloud.auth_token.clone(),
            pins,
            timeout,
        })
    }

    fn endpoint(&self, action: &str) -> Result<Url, FetchError> {
        let mut url = Url::parse(&format!("{}/{action}", self.base_url))
            .map_err(|err| FetchError::network(format!("invalid cloud url: {err}")))?;
        url.query_pairs_mut().append_pair("token", &self.token);
        Ok(url)
    }

    async fn send(&self, url: Url) -> Result<String, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| self.transport_error(err))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| self.transport_error(err))?;

        if !status.is_success() {
            return Err(FetchError::rejected(status.as_u16(), truncate(&body)));
        }
        debug!(status = status.as_u16(), "cloud api response");
        Ok(body)
    }

    /// The request url carries the auth token, so it never reaches the error text.
    fn transport_error(&self, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::network(format!("timed out after {} ms", self.timeout.as_millis()))
        } else {
            FetchError::network(err.without_url().to_string())
        }
    }
}

#[async_trait]
impl TelemetrySource for CloudClient {
    async fn fetch_snapshot(&self) -> Result<PinSnapshot, FetchError> {
        let mut url = self.endpoint("get")?;
        {
            let mut query = url.query_pairs_mut();
            for pin in &self.pins {
                query.append_key_only(pin);
            }
        }

        let body = self.send(url).await?;
        parse_snapshot(&body, &self.pins)
    }

    async fn update_value(&self, pin: &str, value: &str) -> Result<(), FetchError> {
        let mut url = self.endpoint("update")?;
        url.query_pairs_mut().append_pair(pin, value);
        self.send(url).await.map(|_| ())
    }
}

fn parse_snapshot(body: &str, pins: &[String]) -> Result<PinSnapshot, FetchError> {
    let value: serde_json::Value = serde_json::from_str(body)
        .map_err(|_| FetchError::rejected(200, format!("unparseable body: {}", truncate(body))))?;

    match value {
        serde_json::Value::Object(map) => Ok(map.into_iter().collect()),
        // A single-pin read comes back as the bare value.
        other if pins.len() == 1 => Ok(PinSnapshot::from([(pins[0].clone(), other)])),
        _ => Err(FetchError::rejected(
            200,
            format!("expected an object of pins: {}", truncate(body)),
        )),
    }
}

fn truncate(body: &str) -> String {
    let mut preview = body.chars().take(MAX_ERROR_BODY_CHARS).collect::<String>();
    if body.chars().count() > MAX_ERROR_BODY_CHARS {
        preview.push_str("...");
    }
    preview
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer, pins: &[&str], timeout_ms: u64) -> CloudClient {
        let cloud = CloudConfig {
            base_url: format!("{}/external/api/", server.uri()),
            auth_token: "secret-token".to_string(),
        };
        CloudClient::new(
            &cloud,
            pins.iter().map(|pin| pin.to_string()).collect(),
            Duration::from_millis(timeout_ms),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn fetch_returns_full_pin_map() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/external/api/get"))
            .and(query_param("token", "secret-token"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "V0": 812, "V1": "3.25" })),
            )
            .mount(&server)
            .await;

        let snapshot = client(&server, &["V0", "V1"], 2_000)
            .fetch_snapshot()
            .await
            .unwrap();

        assert_eq!(snapshot.get("V0"), Some(&json!(812)));
        assert_eq!(snapshot.get("V1"), Some(&json!("3.25")));
    }

    #[tokio::test]
    async fn single_pin_bare_value_is_wrapped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/external/api/get"))
            .respond_with(ResponseTemplate::new(200).set_body_string("77"))
            .mount(&server)
            .await;

        let snapshot = client(&server, &["V0"], 2_000)
            .fetch_snapshot()
            .await
            .unwrap();

        assert_eq!(snapshot, PinSnapshot::from([("V0".to_string(), json!(77))]));
    }

    #[tokio::test]
    async fn non_success_status_is_upstream_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/external/api/get"))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_string(r#"{"error":{"message":"Invalid token."}}"#),
            )
            .mount(&server)
            .await;

        let err = client(&server, &["V0"], 2_000)
            .fetch_snapshot()
            .await
            .unwrap_err();

        assert_eq!(
            err,
            FetchError::rejected(400, r#"{"error":{"message":"Invalid token."}}"#)
        );
    }

    #[tokio::test]
    async fn slow_upstream_is_network_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/external/api/get"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "V0": 1 }))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let err = client(&server, &["V0"], 50)
            .fetch_snapshot()
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::NetworkFailure { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn unreachable_host_is_network_failure() {
        let cloud = CloudConfig {
            base_url: "http://127.0.0.1:1".to_string(),
            auth_token: "t".to_string(),
        };
        let client =
            CloudClient::new(&cloud, vec!["V0".to_string()], Duration::from_millis(500)).unwrap();

        let err = client.fetch_snapshot().await.unwrap_err();

        assert!(matches!(err, FetchError::NetworkFailure { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn transport_errors_do_not_expose_the_token() {
        let cloud = CloudConfig {
            base_url: "http://127.0.0.1:1".to_string(),
            auth_token: "SUPERSECRET".to_string(),
        };
        let client =
            CloudClient::new(&cloud, vec!["V0".to_string()], Duration::from_millis(500)).unwrap();

        let fetch_err = client.fetch_snapshot().await.unwrap_err();
        let write_err = client.update_value("V3", "1").await.unwrap_err();

        for err in [fetch_err, write_err] {
            assert!(matches!(err, FetchError::NetworkFailure { .. }), "got {err:?}");
            assert!(!err.to_string().contains("SUPERSECRET"), "leaked: {err}");
            assert!(!format!("{err:?}").contains("SUPERSECRET"), "leaked: {err:?}");
        }
    }

    #[tokio::test]
    async fn update_sends_pin_and_value() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/external/api/update"))
            .and(query_param("token", "secret-token"))
            .and(query_param("V3", "0"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        client(&server, &["V0", "V3"], 2_000)
            .update_value("V3", "0")
            .await
            .unwrap();
    }

    #[test]
    fn rejects_non_object_for_multiple_pins() {
        let pins = vec!["V0".to_string(), "V1".to_string()];

        let err = parse_snapshot("[1,2]", &pins).unwrap_err();

        assert!(err.is_upstream_rejected());
    }
}

#[cfg(test)]
pub mod testing {
    use std::{
        collections::VecDeque,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use pinwatch_common::{FetchError, PinSnapshot};

    use super::TelemetrySource;

    #[derive(Debug, Clone)]
    pub enum Fallback {
        Respond(Result<PinSnapshot, FetchError>),
        /// Heartbeat on `V0` increases by one on every fetch.
        CountingHeartbeat,
        Panic,
    }

    /// Fake cloud API that replays queued responses, then a fallback.
    #[derive(Debug)]
    pub struct ScriptedSource {
        responses: Mutex<VecDeque<Result<PinSnapshot, FetchError>>>,
        fallback: Fallback,
        fetch_delay: Duration,
        write_result: Result<(), FetchError>,
        fetches: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        writes: Mutex<Vec<(String, String)>>,
    }

    impl ScriptedSource {
        pub fn new(fallback: Fallback) -> Self {
            Self {
                responses: Mutex::new(VecDeque::new()),
                fallback,
                fetch_delay: Duration::ZERO,
                write_result: Ok(()),
                fetches: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                writes: Mutex::new(Vec::new()),
            }
        }

        pub fn failing() -> Self {
            Self::new(Fallback::Respond(Err(FetchError::network("connection refused"))))
        }

        pub fn with_responses(
            mut self,
            responses: impl IntoIterator<Item = Result<PinSnapshot, FetchError>>,
        ) -> Self {
            self.responses = Mutex::new(responses.into_iter().collect());
            self
        }

        pub fn with_fetch_delay(mut self, delay: Duration) -> Self {
            self.fetch_delay = delay;
            self
        }

        pub fn with_write_result(mut self, result: Result<(), FetchError>) -> Self {
            self.write_result = result;
            self
        }

        pub fn fetches(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }

        pub fn max_in_flight(&self) -> usize {
            self.max_in_flight.load(Ordering::SeqCst)
        }

        pub fn writes(&self) -> Vec<(String, String)> {
            self.writes.lock().unwrap().clone()
        }
    }

    pub fn heartbeat(value: i64) -> PinSnapshot {
        PinSnapshot::from([("V0".to_string(), serde_json::json!(value))])
    }

    #[async_trait]
    impl TelemetrySource for ScriptedSource {
        async fn fetch_snapshot(&self) -> Result<PinSnapshot, FetchError> {
            let count = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
            let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);

            if !self.fetch_delay.is_zero() {
                tokio::time::sleep(self.fetch_delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if let Some(response) = self.responses.lock().unwrap().pop_front() {
                return response;
            }
            match &self.fallback {
                Fallback::Respond(response) => response.clone(),
                Fallback::CountingHeartbeat => Ok(heartbeat(count as i64)),
                Fallback::Panic => panic!("scripted fetch panic"),
            }
        }

        async fn update_value(&self, pin: &str, value: &str) -> Result<(), FetchError> {
            self.writes
                .lock()
                .unwrap()
                .push((pin.to_string(), value.to_string()));
            self.write_result.clone()
        }
    }
}
