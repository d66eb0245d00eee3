use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};

use crate::error::LinkageError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Ok,
    BadRequest,
    InternalServerError,
}

impl Status {
    pub fn code(&self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::BadRequest => 400,
            Status::InternalServerError => 500,
        }
    }
}

impl Serialize for Status {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u16(self.code())
    }
}

impl TryFrom<u16> for Status {
    type Error = String;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        match code {
            200 => Ok(Status::Ok),
            400 => Ok(Status::BadRequest),
            500 => Ok(Status::InternalServerError),
            other => Err(format!("unsupported status {other}")),
        }
    }
}

impl<'de> Deserialize<'de> for Status {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = u16::deserialize(deserializer)?;
        Status::try_from(code).map_err(de::Error::custom)
    }
}

#[derive(Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponsePayload {
    pub status_code: Status,
    pub headers: Value,
    pub body: Value,
}

/// Wraps a job outcome into the payload returned to the invoker.
pub fn make_response_payload(
    result: Result<Value, LinkageError>,
) -> Result<Value, lambda_runtime::Error> {
    let headers = json!({ "Content-Type": "application/json" });
    let response_payload = match result {
        Err(err) => ResponsePayload {
            status_code: err.status(),
            headers,
            body: Value::String(err.to_string()),
        },
        Ok(body) => ResponsePayload {
            status_code: Status::Ok,
            headers,
            body,
        },
    };
    serde_json::to_value(response_payload).map_err(lambda_runtime::Error::from)
}
