//! Wire shape of the read endpoint.
//!
//! Only a status code and a JSON body; mounting it on an actual HTTP server is up to the embedding application.
use serde::Serialize;
use serde_json::json;
use serde_json::Value;

use crate::error::Error;
use crate::error::Result;
use crate::read_through::ReadThroughService;
use crate::traits::CacheBackend;
use crate::traits::RecordStore;
use crate::types::ReadResponse;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndpointResponse {
    pub status: u16,
    pub body:   Value,
}

impl EndpointResponse {
    fn message(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({ "message": message.into() }),
        }
    }
}

/// Map a read outcome onto the response. Internal faults are logged and reported without details.
pub fn respond(result: Result<ReadResponse>) -> EndpointResponse {
    match result {
        Ok(response) => EndpointResponse {
            status: 200,
            body:   response.to_body(),
        },
        Err(Error::NotFound(_)) => EndpointResponse::message(404, "not found"),
        Err(Error::InvalidRequest(reason)) => EndpointResponse::message(400, reason),
        Err(err) => {
            tracing::error!(%err, "read failed");
            EndpointResponse::message(err.status_code(), "internal error")
        }
    }
}

/// Handle `GET /<collection>/{id}`. A missing path parameter is an invalid request.
pub async fn serve_read<B, S>(service: &ReadThroughService<B, S>, id: Option<&str>) -> EndpointResponse
where
    B: CacheBackend,
    S: RecordStore,
{
    let result = match id {
        Some(id) => service.handle_read(id).await,
        None => Err(Error::InvalidRequest("record identifier is required".to_string())),
    };
    respond(result)
}
