//! Narrow view of the SQS API used by the driver.

use async_trait::async_trait;
use aws_sdk_sqs::Client;
use aws_sdk_sqs::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_sqs::primitives::Blob;
use aws_sdk_sqs::types::{
    MessageAttributeValue, MessageSystemAttributeName, QueueAttributeName,
};
use std::collections::HashMap;
use std::fmt;
use tracing::info;

use crate::config::SqsConfig;
use crate::error::{JobsError, JobsResult};

/// Error code returned when the queue was deleted under us.
pub const NON_EXISTENT_QUEUE: &str = "AWS.SimpleQueueService.NonExistentQueue";

/// System attribute carrying the delivery count.
pub const APPROXIMATE_RECEIVE_COUNT: &str = "ApproximateReceiveCount";

const QUEUE_DOES_NOT_EXIST: &str = "QueueDoesNotExist";
const MAX_SDK_ATTEMPTS: u32 = 60;

/// Typed message attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribute {
    String(String),
    Number(String),
    Binary(Vec<u8>),
}

impl Attribute {
    /// Textual value of a `String` or `Number` attribute.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Attribute::String(s) | Attribute::Number(s) => Some(s),
            Attribute::Binary(_) => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Attribute::Binary(b) => Some(b),
            _ => None,
        }
    }
}

/// A received message.
#[derive(Debug, Clone, Default)]
pub struct SqsMessage {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: String,
    /// System attributes such as `ApproximateReceiveCount`
    pub attributes: HashMap<String, String>,
    pub message_attributes: HashMap<String, Attribute>,
}

/// Options for one long poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveOptions {
    pub max_messages: i32,
    pub wait_time_seconds: i32,
    /// `None` keeps the queue's own visibility timeout
    pub visibility_timeout: Option<i32>,
}

/// The SQS calls the driver makes.
#[async_trait]
pub trait SqsApi: Send + Sync {
    /// Create (or look up) a queue, returning its URL.
    async fn create_queue(
        &self,
        name: &str,
        attributes: &HashMap<String, String>,
        tags: &HashMap<String, String>,
    ) -> JobsResult<String>;

    /// Long poll for messages. A deleted queue yields [`JobsError::QueueNotFound`].
    async fn receive(&self, queue_url: &str, opts: ReceiveOptions) -> JobsResult<Vec<SqsMessage>>;

    async fn send(
        &self,
        queue_url: &str,
        body: &str,
        delay_seconds: i32,
        attributes: HashMap<String, Attribute>,
    ) -> JobsResult<()>;

    async fn delete(&self, queue_url: &str, receipt_handle: &str) -> JobsResult<()>;

    /// Approximate message counts keyed by attribute name.
    async fn queue_attributes(&self, queue_url: &str) -> JobsResult<HashMap<String, String>>;
}

/// [`SqsApi`] backed by the AWS SDK.
#[derive(Clone)]
pub struct AwsSqs {
    client: Client,
}

impl fmt::Debug for AwsSqs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwsSqs").finish_non_exhaustive()
    }
}

impl AwsSqs {
    /// Build a client from the global `sqs` section.
    pub async fn connect(config: &SqsConfig) -> Self {
        info!(region = %config.region, endpoint = %config.endpoint, "connecting to SQS");

        let mut builder = aws_config::defaults(aws_config::BehaviorVersion::latest()).retry_config(
            aws_config::retry::RetryConfig::standard().with_max_attempts(MAX_SDK_ATTEMPTS),
        );
        if !config.region.is_empty() {
            builder = builder.region(aws_sdk_sqs::config::Region::new(config.region.clone()));
        }
        if !config.endpoint.is_empty() {
            builder = builder.endpoint_url(&config.endpoint);
        }
        if !config.key.is_empty() && !config.secret.is_empty() {
            let session_token =
                (!config.session_token.is_empty()).then(|| config.session_token.clone());
            let credentials = aws_sdk_sqs::config::Credentials::new(
                &config.key,
                &config.secret,
                session_token,
                None,
                "armature-jobs",
            );
            builder = builder.credentials_provider(credentials);
        }

        let aws_config = builder.load().await;
        Self {
            client: Client::new(&aws_config),
        }
    }
}

fn sdk_error<E, R>(err: SdkError<E, R>) -> JobsError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: fmt::Debug,
{
    if matches!(
        err.code(),
        Some(NON_EXISTENT_QUEUE) | Some(QUEUE_DOES_NOT_EXIST)
    ) {
        return JobsError::QueueNotFound(err.message().unwrap_or_default().to_string());
    }
    match &err {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) => {
            JobsError::Connection(format!("{err:?}"))
        }
        _ => JobsError::Broker(
            err.message()
                .map(str::to_string)
                .unwrap_or_else(|| format!("{err:?}")),
        ),
    }
}

fn to_sdk_attribute(attr: Attribute) -> JobsResult<MessageAttributeValue> {
    let builder = match attr {
        Attribute::String(s) => MessageAttributeValue::builder()
            .data_type("String")
            .string_value(s),
        Attribute::Number(n) => MessageAttributeValue::builder()
            .data_type("Number")
            .string_value(n),
        Attribute::Binary(b) => MessageAttributeValue::builder()
            .data_type("Binary")
            .binary_value(Blob::new(b)),
    };
    builder
        .build()
        .map_err(|e| JobsError::Broker(e.to_string()))
}

fn from_sdk_attribute(value: &MessageAttributeValue) -> Option<Attribute> {
    let data_type = value.data_type();
    if data_type.starts_with("Binary") {
        return value
            .binary_value()
            .map(|b| Attribute::Binary(b.as_ref().to_vec()));
    }
    let s = value.string_value()?.to_string();
    if data_type.starts_with("Number") {
        Some(Attribute::Number(s))
    } else {
        Some(Attribute::String(s))
    }
}

#[async_trait]
impl SqsApi for AwsSqs {
    async fn create_queue(
        &self,
        name: &str,
        attributes: &HashMap<String, String>,
        tags: &HashMap<String, String>,
    ) -> JobsResult<String> {
        let attributes = attributes
            .iter()
            .map(|(k, v)| (QueueAttributeName::from(k.as_str()), v.clone()))
            .collect::<HashMap<_, _>>();
        let out = self
            .client
            .create_queue()
            .queue_name(name)
            .set_attributes((!attributes.is_empty()).then_some(attributes))
            .set_tags((!tags.is_empty()).then(|| tags.clone()))
            .send()
            .await
            .map_err(sdk_error)?;

        out.queue_url
            .ok_or_else(|| JobsError::Broker(format!("no queue URL returned for `{name}`")))
    }

    async fn receive(&self, queue_url: &str, opts: ReceiveOptions) -> JobsResult<Vec<SqsMessage>> {
        let out = self
            .client
            .receive_message()
            .queue_url(queue_url)
            .max_number_of_messages(opts.max_messages)
            .wait_time_seconds(opts.wait_time_seconds)
            .set_visibility_timeout(opts.visibility_timeout)
            .message_system_attribute_names(MessageSystemAttributeName::ApproximateReceiveCount)
            .message_attribute_names("All")
            .send()
            .await
            .map_err(sdk_error)?;

        let messages = out
            .messages
            .unwrap_or_default()
            .into_iter()
            .map(|m| SqsMessage {
                message_id: m.message_id.unwrap_or_default(),
                receipt_handle: m.receipt_handle.unwrap_or_default(),
                body: m.body.unwrap_or_default(),
                attributes: m
                    .attributes
                    .unwrap_or_default()
                    .into_iter()
                    .map(|(k, v)| (k.as_str().to_string(), v))
                    .collect(),
                message_attributes: m
                    .message_attributes
                    .unwrap_or_default()
                    .iter()
                    .filter_map(|(k, v)| from_sdk_attribute(v).map(|a| (k.clone(), a)))
                    .collect(),
            })
            .collect();
        Ok(messages)
    }

    async fn send(
        &self,
        queue_url: &str,
        body: &str,
        delay_seconds: i32,
        attributes: HashMap<String, Attribute>,
    ) -> JobsResult<()> {
        let mut request = self
            .client
            .send_message()
            .queue_url(queue_url)
            .message_body(body)
            .delay_seconds(delay_seconds);
        for (key, value) in attributes {
            request = request.message_attributes(key, to_sdk_attribute(value)?);
        }
        request.send().await.map_err(sdk_error)?;
        Ok(())
    }

    async fn delete(&self, queue_url: &str, receipt_handle: &str) -> JobsResult<()> {
        self.client
            .delete_message()
            .queue_url(queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    async fn queue_attributes(&self, queue_url: &str) -> JobsResult<HashMap<String, String>> {
        let out = self
            .client
            .get_queue_attributes()
            .queue_url(queue_url)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessagesDelayed)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessagesNotVisible)
            .send()
            .await
            .map_err(sdk_error)?;

        Ok(out
            .attributes
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k.as_str().to_string(), v))
            .collect())
    }
}
