//! JSON wire codec for the profile control link.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{CurrentStatus, SetpointPoint, MAX_TEMPERATURE, TIME_LIMIT_MINUTES};

/// Ceiling for a single message in either direction. Larger messages are
/// dropped, never fragmented.
pub const MAX_MESSAGE_BYTES: usize = 600;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown command `{0}`")]
    UnknownCommand(String),
    #[error("`{command}` requires field `{field}`")]
    MissingField {
        command: &'static str,
        field: &'static str,
    },
    #[error("`{command}` does not take field `{field}`")]
    UnexpectedField {
        command: &'static str,
        field: &'static str,
    },
    #[error("point {index} out of range (time {time}, temperature {temperature})")]
    InvalidPoint {
        index: usize,
        time: u32,
        temperature: u32,
    },
    #[error("payload of {len} bytes exceeds {limit} byte limit")]
    OversizedPayload { len: usize, limit: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    GetTemperaturePoints,
    SetTemperaturePoints(Vec<SetpointPoint>),
    StartRun,
    Interrupt,
}

impl Request {
    pub fn command(&self) -> &'static str {
        match self {
            Self::GetTemperaturePoints => "get_temperature_points",
            Self::SetTemperaturePoints(_) => "set_temperature_points",
            Self::StartRun => "start_run",
            Self::Interrupt => "interrupt",
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRequest {
    command: String,
    #[serde(default)]
    data: Option<Vec<RawPoint>>,
}

// Wider than u16 so out-of-range values surface as InvalidPoint.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPoint {
    time: u32,
    temperature: u32,
}

pub fn guard_payload(bytes: &[u8]) -> Result<(), ProtocolError> {
    if bytes.len() > MAX_MESSAGE_BYTES {
        return Err(ProtocolError::OversizedPayload {
            len: bytes.len(),
            limit: MAX_MESSAGE_BYTES,
        });
    }
    Ok(())
}

pub fn decode_request(bytes: &[u8]) -> Result<Request, ProtocolError> {
    guard_payload(bytes)?;
    let raw: RawRequest = serde_json::from_slice(bytes)?;

    let request = match raw.command.as_str() {
        "get_temperature_points" => Request::GetTemperaturePoints,
        "start_run" => Request::StartRun,
        "interrupt" => Request::Interrupt,
        "set_temperature_points" => {
            let Some(data) = raw.data else {
                return Err(ProtocolError::MissingField {
                    command: "set_temperature_points",
                    field: "data",
                });
            };
            return Ok(Request::SetTemperaturePoints(validate_points(data)?));
        }
        other => return Err(ProtocolError::UnknownCommand(other.to_string())),
    };

    if raw.data.is_some() {
        return Err(ProtocolError::UnexpectedField {
            command: request.command(),
            field: "data",
        });
    }
    Ok(request)
}

fn validate_points(raw: Vec<RawPoint>) -> Result<Vec<SetpointPoint>, ProtocolError> {
    raw.into_iter()
        .enumerate()
        .map(|(index, point)| {
            let time = u16::try_from(point.time)
                .ok()
                .filter(|time| *time < TIME_LIMIT_MINUTES);
            let temperature = u16::try_from(point.temperature)
                .ok()
                .filter(|temperature| *temperature <= MAX_TEMPERATURE);
            match (time, temperature) {
                (Some(time), Some(temperature)) => Ok(SetpointPoint::new(time, temperature)),
                _ => Err(ProtocolError::InvalidPoint {
                    index,
                    time: point.time,
                    temperature: point.temperature,
                }),
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifyStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Started,
    Interrupted,
    Completed,
    Running,
    Idle,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Interrupted => "interrupted",
            Self::Completed => "completed",
            Self::Running => "running",
            Self::Idle => "idle",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Response {
    TemperaturePoints {
        data: Vec<SetpointPoint>,
    },
    VerifyTemperaturePoints {
        status: VerifyStatus,
        message: String,
    },
    RunStatus {
        status: RunStatus,
        message: String,
    },
    CurrentStatus {
        data: CurrentStatus,
    },
}

impl Response {
    pub fn points_saved() -> Self {
        Self::VerifyTemperaturePoints {
            status: VerifyStatus::Success,
            message: "Temperature points saved".to_string(),
        }
    }

    pub fn points_not_saved(reason: &str) -> Self {
        Self::VerifyTemperaturePoints {
            status: VerifyStatus::Error,
            message: format!("Temperature points not saved: {reason}"),
        }
    }

    pub fn run_status(status: RunStatus) -> Self {
        Self::RunStatus {
            status,
            message: format!("Run status: {}", status.as_str()),
        }
    }

    pub fn command(&self) -> &'static str {
        match self {
            Self::TemperaturePoints { .. } => "temperature_points",
            Self::VerifyTemperaturePoints { .. } => "verify_temperature_points",
            Self::RunStatus { .. } => "run_status",
            Self::CurrentStatus { .. } => "current_status",
        }
    }
}

/// Serializes `response`, refusing anything over `MAX_MESSAGE_BYTES`.
pub fn encode_response(response: &Response) -> Result<Vec<u8>, ProtocolError> {
    let bytes = serde_json::to_vec(response)?;
    guard_payload(&bytes)?;
    Ok(bytes)
}
