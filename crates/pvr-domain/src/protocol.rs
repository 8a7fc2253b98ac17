//! Messages exchanged with the algorithm child process.
//!
//! Every frame is a JSON object tagged by its `type` field. Host frames are
//! [`HostMessage`], child frames are [`ChildMessage`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::image::ImageMeta;

/// Upper bound on defect rectangles kept from a single result.
pub const MAX_DEFECT_RECTS: usize = 20;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMessage {
    Hello {
        runner_version: String,
        heartbeat_interval_ms: u64,
        heartbeat_grace_ms: u64,
    },
    Ping,
    Execute(CallRequest),
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChildMessage {
    Hello {
        #[serde(default)]
        sdk_version: Option<String>,
    },
    Pong,
    Result(CallResponse),
    Error {
        #[serde(default)]
        request_id: Option<String>,
        message: String,
        #[serde(default)]
        code: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

impl ChildMessage {
    /// Request id carried by the frame, when it answers a call.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::Result(response) => Some(response.request_id.as_str()),
            Self::Error { request_id, .. } => request_id.as_deref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRequest {
    pub request_id: String,
    pub data: CallPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<String>,
    pub step_index: u32,
    pub step_desc: String,
    #[serde(default)]
    pub guide_info: Value,
    pub cur_image_shm_id: String,
    pub cur_image_meta: ImageMeta,
    pub guide_image_shm_id: String,
    pub guide_image_meta: ImageMeta,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    #[serde(rename = "OK", alias = "ok")]
    Ok,
    #[serde(rename = "ERROR", alias = "error")]
    Error,
}

/// Business verdict of one inspection step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    #[serde(rename = "OK", alias = "ok", alias = "pass", alias = "PASS")]
    Pass,
    #[serde(rename = "NG", alias = "ng", alias = "fail", alias = "FAIL")]
    Fail,
}

impl Verdict {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "OK",
            Self::Fail => "NG",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefectRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultData {
    pub result_status: Verdict,
    #[serde(default)]
    pub defect_rects: Vec<DefectRect>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ng_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<Value>,
}

/// Raw response frame as sent by the child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallResponse {
    pub request_id: String,
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ResultData>,
}

/// A validated, correlated result handed back to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallResult {
    pub request_id: String,
    pub result_status: Verdict,
    pub defect_rects: Vec<DefectRect>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ng_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<Value>,
}

impl CallResult {
    pub fn passed(&self) -> bool {
        self.result_status == Verdict::Pass
    }

    /// Drops rectangles beyond `max`, returning how many were removed.
    pub fn truncate_defects(&mut self, max: usize) -> usize {
        let dropped = self.defect_rects.len().saturating_sub(max);
        self.defect_rects.truncate(max);
        dropped
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseOutcome {
    Success(CallResult),
    Failed { code: String, message: String },
    Malformed(String),
}

impl CallResponse {
    pub fn outcome(self) -> ResponseOutcome {
        match self.status {
            ResponseStatus::Error => ResponseOutcome::Failed {
                code: self.error_code.unwrap_or_else(|| "9999".to_string()),
                message: self
                    .message
                    .unwrap_or_else(|| "algorithm reported an error".to_string()),
            },
            ResponseStatus::Ok => {
                let Some(data) = self.data else {
                    return ResponseOutcome::Malformed(format!(
                        "response {} has status OK but no data",
                        self.request_id
                    ));
                };
                let ng_reason = match data.result_status {
                    Verdict::Pass => None,
                    Verdict::Fail => data.ng_reason,
                };
                ResponseOutcome::Success(CallResult {
                    request_id: self.request_id,
                    result_status: data.result_status,
                    defect_rects: data.defect_rects,
                    ng_reason,
                    debug: data.debug,
                })
            }
        }
    }
}
