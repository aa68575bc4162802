//! SQS queue connections and queue resources

use crate::context::AwsContext;
use crate::error::{cloud_error, invalid_request, missing_field};
use aws_sdk_sqs::Client;
use aws_sdk_sqs::types::{MessageAttributeValue, QueueAttributeName};
use converge_common::ResourceKind;
use converge_core::cloud::{ResourceApi, ResourceRef, ResourceSpec};
use converge_core::error::CloudError;
use converge_core::queue::{QueueConnection, QueueConnector, QueueHandle, RawMessage, SendOptions};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Opens SQS connections from a shared context.
///
/// Each [`connect`](QueueConnector::connect) builds a fresh client, so a
/// reconnect drops any pooled HTTP connections held by the old one.
#[derive(Debug, Clone)]
pub struct SqsConnector {
    ctx: AwsContext,
}

impl SqsConnector {
    pub fn new(ctx: AwsContext) -> Self {
        Self { ctx }
    }
}

impl QueueConnector for SqsConnector {
    type Connection = SqsConnection;

    async fn connect(&self) -> Result<SqsConnection, CloudError> {
        debug!(region = %self.ctx.region(), "Opening SQS connection");
        Ok(SqsConnection {
            client: self.ctx.sqs_client(),
        })
    }
}

/// One SQS client.
#[derive(Debug, Clone)]
pub struct SqsConnection {
    client: Client,
}

impl SqsConnection {
    pub(crate) fn from_context(ctx: &AwsContext) -> Self {
        Self {
            client: ctx.sqs_client(),
        }
    }

    async fn queue_url(&self, name: &str) -> Result<Option<String>, CloudError> {
        match self.client.get_queue_url().queue_name(name).send().await {
            Ok(response) => Ok(response.queue_url().map(str::to_string)),
            Err(e) => {
                let err = cloud_error(e);
                if err.is_not_found_for(ResourceKind::Queue) {
                    Ok(None)
                } else {
                    Err(err)
                }
            }
        }
    }
}

fn string_attribute(value: &str) -> Result<MessageAttributeValue, CloudError> {
    MessageAttributeValue::builder()
        .data_type("String")
        .string_value(value)
        .build()
        .map_err(invalid_request)
}

fn clamp_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

impl QueueConnection for SqsConnection {
    async fn resolve_queue(&self, name: &str) -> Result<Option<QueueHandle>, CloudError> {
        Ok(self.queue_url(name).await?.map(|url| QueueHandle {
            name: name.to_string(),
            url,
        }))
    }

    async fn set_receive_wait_time(&self, queue: &QueueHandle, seconds: u32) -> Result<(), CloudError> {
        self.client
            .set_queue_attributes()
            .queue_url(&queue.url)
            .attributes(QueueAttributeName::ReceiveMessageWaitTimeSeconds, seconds.to_string())
            .send()
            .await
            .map_err(cloud_error)?;
        Ok(())
    }

    async fn send_message(&self, queue: &QueueHandle, body: &str, options: &SendOptions) -> Result<String, CloudError> {
        let mut request = self
            .client
            .send_message()
            .queue_url(&queue.url)
            .message_body(body)
            .set_delay_seconds(options.delay_seconds.map(clamp_i32));
        for (key, value) in &options.attributes {
            request = request.message_attributes(key, string_attribute(value)?);
        }

        let response = request.send().await.map_err(cloud_error)?;
        response
            .message_id()
            .map(str::to_string)
            .ok_or_else(|| missing_field("MessageId"))
    }

    async fn receive_messages(
        &self,
        queue: &QueueHandle,
        max_messages: u32,
        attribute_names: &[String],
    ) -> Result<Vec<RawMessage>, CloudError> {
        let response = self
            .client
            .receive_message()
            .queue_url(&queue.url)
            .max_number_of_messages(clamp_i32(max_messages))
            .set_message_attribute_names((!attribute_names.is_empty()).then(|| attribute_names.to_vec()))
            .send()
            .await
            .map_err(cloud_error)?;

        Ok(response
            .messages()
            .iter()
            .map(|message| {
                let attributes: BTreeMap<String, String> = message
                    .message_attributes()
                    .into_iter()
                    .flatten()
                    .filter_map(|(k, v)| Some((k.clone(), v.string_value()?.to_string())))
                    .collect();
                RawMessage {
                    message_id: message.message_id().unwrap_or_default().to_string(),
                    receipt_handle: message.receipt_handle().unwrap_or_default().to_string(),
                    body: message.body().unwrap_or_default().to_string(),
                    attributes,
                }
            })
            .collect())
    }

    async fn delete_message(&self, queue: &QueueHandle, receipt_handle: &str) -> Result<(), CloudError> {
        self.client
            .delete_message()
            .queue_url(&queue.url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(cloud_error)?;
        Ok(())
    }

    async fn purge_queue(&self, queue: &QueueHandle) -> Result<(), CloudError> {
        self.client
            .purge_queue()
            .queue_url(&queue.url)
            .send()
            .await
            .map_err(cloud_error)?;
        Ok(())
    }
}

/// Conflict error for a queue name that is already taken.
fn queue_exists(name: &str) -> CloudError {
    CloudError::new("QueueAlreadyExists", format!("queue {name} already exists"))
}

/// Queue create/exists/delete.
///
/// Recognised create params: `visibility_timeout` and
/// `receive_wait_time` (seconds).
impl ResourceApi for SqsConnection {
    /// `CreateQueue` returns the existing queue when the name is taken with
    /// the same attributes, so an existing name is reported as a conflict
    /// before creating.
    async fn create(&self, spec: &ResourceSpec) -> Result<ResourceRef, CloudError> {
        if spec.kind != ResourceKind::Queue {
            return Err(invalid_request(format!("SQS client cannot create {}", spec.kind)));
        }
        if self.queue_url(&spec.name).await?.is_some() {
            return Err(queue_exists(&spec.name));
        }

        info!(queue_name = %spec.name, "Creating queue");
        let mut request = self.client.create_queue().queue_name(&spec.name);
        if let Some(timeout) = spec.params.get("visibility_timeout") {
            request = request.attributes(QueueAttributeName::VisibilityTimeout, timeout);
        }
        if let Some(wait) = spec.params.get("receive_wait_time") {
            request = request.attributes(QueueAttributeName::ReceiveMessageWaitTimeSeconds, wait);
        }

        let response = request.send().await.map_err(cloud_error)?;
        let url = response.queue_url().ok_or_else(|| missing_field("QueueUrl"))?;
        Ok(ResourceRef::new(ResourceKind::Queue, url, &spec.name))
    }

    async fn exists(&self, kind: ResourceKind, name: &str) -> Result<bool, CloudError> {
        if kind != ResourceKind::Queue {
            return Err(invalid_request(format!("SQS client cannot look up {kind}")));
        }
        Ok(self.queue_url(name).await?.is_some())
    }

    async fn delete(&self, resource: &ResourceRef) -> Result<(), CloudError> {
        if resource.kind != ResourceKind::Queue {
            return Err(invalid_request(format!("SQS client cannot delete {}", resource.kind)));
        }

        let url = if resource.id.starts_with("https://") {
            resource.id.clone()
        } else {
            self.queue_url(&resource.name).await?.ok_or_else(|| {
                CloudError::new(
                    "AWS.SimpleQueueService.NonExistentQueue",
                    format!("queue {} does not exist", resource.name),
                )
            })?
        };

        info!(queue_url = %url, "Deleting queue");
        self.client
            .delete_queue()
            .queue_url(url)
            .send()
            .await
            .map_err(cloud_error)?;
        Ok(())
    }
}
