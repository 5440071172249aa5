use async_trait::async_trait;
use error_types::ErrorResponse;
use event_schema::{
    Cursor, MarkReceiptRequest, MessageDto, MessagePage, ReceiptAdvance, ReceiptBatchRequest,
    ReceiptDto, SendMessageRequest,
};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use super::SyncTransport;
use crate::error::TransportError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// REST surface of the DM sync service
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
    token: String,
}

impl HttpTransport {
    pub fn new(base_url: &str, token: impl Into<String>) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| TransportError::Network(format!("client build: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<T, TransportError> {
        let response = request.bearer_auth(&self.token).send().await?;
        decode(response).await
    }

    async fn page(
        &self,
        thread_id: Uuid,
        query: &[(&str, String)],
    ) -> Result<MessagePage, TransportError> {
        let url = self.url(&format!("/threads/{thread_id}/messages"));
        self.execute(self.client.get(&url).query(query)).await
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, TransportError> {
    let status = response.status();
    if status.is_success() {
        return response
            .json::<T>()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()));
    }

    let body = response.text().await.unwrap_or_default();
    debug!(status = status.as_u16(), "request rejected");
    Err(match serde_json::from_str::<ErrorResponse>(&body) {
        Ok(err) => TransportError::Server {
            status: status.as_u16(),
            code: err.code,
            message: err.message,
        },
        Err(_) => TransportError::Server {
            status: status.as_u16(),
            code: String::new(),
            message: body,
        },
    })
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn fetch_latest(
        &self,
        thread_id: Uuid,
        limit: i64,
    ) -> Result<MessagePage, TransportError> {
        self.page(thread_id, &[("limit", limit.to_string())]).await
    }

    async fn fetch_before(
        &self,
        thread_id: Uuid,
        cursor: Cursor,
        limit: i64,
    ) -> Result<MessagePage, TransportError> {
        self.page(
            thread_id,
            &[("before", cursor.encode()), ("limit", limit.to_string())],
        )
        .await
    }

    async fn fetch_after(
        &self,
        thread_id: Uuid,
        cursor: Cursor,
        limit: i64,
    ) -> Result<MessagePage, TransportError> {
        self.page(
            thread_id,
            &[("after", cursor.encode()), ("limit", limit.to_string())],
        )
        .await
    }

    async fn send_message(
        &self,
        thread_id: Uuid,
        client_msg_id: Uuid,
        body: &str,
    ) -> Result<MessageDto, TransportError> {
        let url = self.url(&format!("/threads/{thread_id}/messages"));
        let request = SendMessageRequest {
            client_msg_id,
            body: body.to_string(),
        };
        self.execute(self.client.post(&url).json(&request)).await
    }

    async fn mark_read(
        &self,
        thread_id: Uuid,
        up_to_message_id: i64,
    ) -> Result<ReceiptAdvance, TransportError> {
        let url = self.url(&format!("/threads/{thread_id}/read"));
        self.execute(
            self.client
                .post(&url)
                .json(&MarkReceiptRequest { up_to_message_id }),
        )
        .await
    }

    async fn mark_delivered(
        &self,
        thread_id: Uuid,
        up_to_message_id: i64,
    ) -> Result<ReceiptAdvance, TransportError> {
        let url = self.url(&format!("/threads/{thread_id}/delivered"));
        self.execute(
            self.client
                .post(&url)
                .json(&MarkReceiptRequest { up_to_message_id }),
        )
        .await
    }

    async fn fetch_receipts(
        &self,
        thread_id: Uuid,
        message_ids: &[i64],
    ) -> Result<Vec<ReceiptDto>, TransportError> {
        let url = self.url(&format!("/threads/{thread_id}/receipts"));
        let request = ReceiptBatchRequest {
            message_ids: message_ids.to_vec(),
        };
        self.execute(self.client.post(&url).json(&request)).await
    }
}
