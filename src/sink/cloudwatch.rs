use crate::config::types::AwsConfig;
use crate::sink::credentials::CredentialsProvider;
use crate::sink::sigv4::RequestSigner;
use crate::sink::traits::{InputLogEvent, LogSink, LogTarget, PutOutcome, SinkError};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

const SERVICE: &str = "logs";
const TARGET_PREFIX: &str = "Logs_20140328";
const CONTENT_TYPE: &str = "application/x-amz-json-1.1";

/// CloudWatch Logs client speaking the AWS JSON 1.1 protocol.
#[derive(Debug)]
pub struct CloudWatchLogsClient {
    client: reqwest::Client,
    url: Url,
    host: String,
    region: String,
    credentials: CredentialsProvider,
}

impl CloudWatchLogsClient {
    pub fn new(
        config: &AwsConfig,
        credentials: impl Into<CredentialsProvider>,
    ) -> Result<Self, SinkError> {
        let endpoint = config
            .endpoint
            .clone()
            .unwrap_or_else(|| default_endpoint(&config.region));
        let url = Url::parse(&endpoint).map_err(|_| SinkError::Endpoint(endpoint.clone()))?;
        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => return Err(SinkError::Endpoint(endpoint)),
        };

        let client = reqwest::Client::builder().timeout(config.timeout).build()?;

        Ok(Self {
            client,
            url,
            host,
            region: config.region.clone(),
            credentials: credentials.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        self.url.as_str()
    }

    async fn call<Req, Resp>(&self, operation: &str, request: &Req) -> Result<Resp, SinkError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let body = serde_json::to_vec(request)?;
        let credentials = self.credentials.credentials().await?;
        let signer = RequestSigner::new(credentials, self.region.as_str(), SERVICE);
        let now = Utc::now();
        let amz_date = RequestSigner::amz_date(now);
        let target = format!("{TARGET_PREFIX}.{operation}");

        let mut headers = vec![
            ("content-type", CONTENT_TYPE),
            ("host", self.host.as_str()),
            ("x-amz-date", amz_date.as_str()),
            ("x-amz-target", target.as_str()),
        ];
        if let Some(token) = &signer.credentials().session_token {
            headers.push(("x-amz-security-token", token.as_str()));
        }
        let authorization = signer.authorization("POST", self.url.path(), &headers, &body, now);

        let mut request = self.client.post(self.url.clone());
        for (name, value) in headers.iter().filter(|(name, _)| *name != "host") {
            request = request.header(*name, *value);
        }
        let response = request
            .header("authorization", authorization)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        let bytes = response.bytes().await?;
        if !status.is_success() {
            return Err(service_error(status.as_u16(), &bytes));
        }

        debug!(operation, status = status.as_u16(), "CloudWatch Logs call succeeded");
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(serde_json::from_slice(b"{}")?);
        }
        Ok(serde_json::from_slice(&bytes)?)
    }
}

fn default_endpoint(region: &str) -> String {
    format!("https://logs.{region}.amazonaws.com")
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    #[serde(rename = "__type", default)]
    error_type: Option<String>,
    #[serde(alias = "Message", default)]
    message: Option<String>,
    #[serde(default)]
    expected_sequence_token: Option<String>,
}

/// Map a non-2xx response onto the sink error taxonomy.
fn service_error(status: u16, body: &[u8]) -> SinkError {
    let parsed: ErrorBody = match serde_json::from_slice(body) {
        Ok(parsed) => parsed,
        Err(_) => {
            return SinkError::Service {
                status,
                code: String::new(),
                message: String::from_utf8_lossy(body).into_owned(),
            }
        }
    };

    let code = parsed
        .error_type
        .as_deref()
        .map(|t| t.rsplit('#').next().unwrap_or(t).to_string())
        .unwrap_or_default();
    let message = parsed.message.unwrap_or_default();

    match code.as_str() {
        "ResourceNotFoundException" => SinkError::ResourceNotFound(message),
        "ResourceAlreadyExistsException" => SinkError::ResourceAlreadyExists(message),
        "DataAlreadyAcceptedException" => SinkError::DataAlreadyAccepted {
            message,
            expected_sequence_token: parsed.expected_sequence_token,
        },
        "InvalidSequenceTokenException" => SinkError::InvalidSequenceToken {
            message,
            expected_sequence_token: parsed.expected_sequence_token,
        },
        _ => SinkError::Service {
            status,
            code,
            message,
        },
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PutLogEventsRequest<'a> {
    log_group_name: &'a str,
    log_stream_name: &'a str,
    log_events: &'a [InputLogEvent],
    #[serde(skip_serializing_if = "Option::is_none")]
    sequence_token: Option<&'a str>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PutLogEventsResponse {
    #[serde(default)]
    next_sequence_token: Option<String>,
    #[serde(default)]
    rejected_log_events_info: Option<RejectedLogEventsInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RejectedLogEventsInfo {
    too_new_log_event_start_index: Option<i64>,
    too_old_log_event_end_index: Option<i64>,
    expired_log_event_end_index: Option<i64>,
}

impl std::fmt::Display for RejectedLogEventsInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = [
            ("tooNewLogEventStartIndex", self.too_new_log_event_start_index),
            ("tooOldLogEventEndIndex", self.too_old_log_event_end_index),
            ("expiredLogEventEndIndex", self.expired_log_event_end_index),
        ]
        .iter()
        .filter_map(|(name, index)| index.map(|i| format!("{name}={i}")))
        .collect();
        write!(f, "{}", parts.join(", "))
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateLogGroupRequest<'a> {
    log_group_name: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateLogStreamRequest<'a> {
    log_group_name: &'a str,
    log_stream_name: &'a str,
}

#[derive(Deserialize)]
struct EmptyResponse {}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DescribeLogStreamsRequest<'a> {
    log_group_name: &'a str,
    log_stream_name_prefix: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_token: Option<&'a str>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DescribeLogStreamsResponse {
    #[serde(default)]
    log_streams: Vec<LogStreamDescription>,
    #[serde(default)]
    next_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogStreamDescription {
    log_stream_name: String,
    #[serde(default)]
    upload_sequence_token: Option<String>,
}

#[async_trait]
impl LogSink for CloudWatchLogsClient {
    async fn put_log_events(
        &self,
        target: &LogTarget,
        token: Option<&str>,
        events: &[InputLogEvent],
    ) -> Result<PutOutcome, SinkError> {
        let request = PutLogEventsRequest {
            log_group_name: &target.group,
            log_stream_name: &target.stream,
            log_events: events,
            sequence_token: token,
        };
        let response: PutLogEventsResponse = self.call("PutLogEvents", &request).await?;

        let rejected = response.rejected_log_events_info.map(|info| info.to_string());
        if let Some(rejected) = &rejected {
            warn!(log_target = %target, rejected = %rejected, "CloudWatch Logs rejected some events");
        }

        Ok(PutOutcome {
            next_sequence_token: response.next_sequence_token,
            rejected,
        })
    }

    async fn create_target(&self, target: &LogTarget) -> Result<(), SinkError> {
        let group = CreateLogGroupRequest {
            log_group_name: &target.group,
        };
        match self.call::<_, EmptyResponse>("CreateLogGroup", &group).await {
            Ok(_) => info!(group = %target.group, "Created log group"),
            Err(SinkError::ResourceAlreadyExists(_)) => {
                debug!(group = %target.group, "Log group already exists")
            }
            Err(e) => return Err(e),
        }

        let stream = CreateLogStreamRequest {
            log_group_name: &target.group,
            log_stream_name: &target.stream,
        };
        match self.call::<_, EmptyResponse>("CreateLogStream", &stream).await {
            Ok(_) => info!(log_target = %target, "Created log stream"),
            Err(SinkError::ResourceAlreadyExists(_)) => {
                debug!(log_target = %target, "Log stream already exists")
            }
            Err(e) => return Err(e),
        }

        Ok(())
    }

    async fn describe_sequence_token(
        &self,
        target: &LogTarget,
    ) -> Result<Option<String>, SinkError> {
        let mut next_token: Option<String> = None;
        loop {
            let request = DescribeLogStreamsRequest {
                log_group_name: &target.group,
                log_stream_name_prefix: &target.stream,
                next_token: next_token.as_deref(),
            };
            let response: DescribeLogStreamsResponse =
                self.call("DescribeLogStreams", &request).await?;

            if let Some(stream) = response
                .log_streams
                .into_iter()
                .find(|s| s.log_stream_name == target.stream)
            {
                return Ok(stream.upload_sequence_token);
            }

            match response.next_token {
                Some(token) if next_token.as_deref() != Some(token.as_str()) => {
                    next_token = Some(token)
                }
                _ => return Err(SinkError::ResourceNotFound(format!("log stream {target}"))),
            }
        }
    }
}
