//! One `execute` round trip: stage both images, send, correlate, clean up.

use std::time::{Duration, Instant};

use pvr_domain::{
    CallPayload, CallRequest, CallResult, ChildMessage, HostMessage, ImageMeta, ResponseOutcome,
    MAX_DEFECT_RECTS,
};
use serde_json::Value;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::codec::FrameChannel;
use crate::error::{Result, RunnerError};
use crate::shm::{ImageChannel, ShmLease};

#[derive(Debug, Clone)]
pub struct ImageFrame {
    pub bytes: Vec<u8>,
    pub meta: ImageMeta,
}

/// Everything the caller supplies for one inspection step.
#[derive(Debug, Clone)]
pub struct Step {
    pub step_index: u32,
    pub step_desc: String,
    pub guide_info: Value,
    pub current: ImageFrame,
    pub guide: ImageFrame,
    /// Overrides the configured call timeout.
    pub timeout: Option<Duration>,
}

pub struct CallEngine<'a> {
    images: &'a dyn ImageChannel,
}

impl<'a> CallEngine<'a> {
    pub fn new(images: &'a dyn ImageChannel) -> Self {
        Self { images }
    }

    /// Runs one step against `channel`.
    ///
    /// Both image segments are released before this returns, whatever the
    /// outcome. Responses for other request ids are discarded.
    ///
    /// # Errors
    /// `ImageTransfer` when staging fails, `CallTimeout` after `timeout`,
    /// `AlgorithmExecution` for an error reply, `Protocol` for malformed
    /// replies, `ProcessCrashed` when the channel closes.
    pub fn execute(
        &self,
        channel: &mut dyn FrameChannel,
        pid: Option<&str>,
        step: &Step,
        timeout: Duration,
    ) -> Result<CallResult> {
        let current = ShmLease::allocate(self.images, &step.current.bytes, &step.current.meta)?;
        let guide = ShmLease::allocate(self.images, &step.guide.bytes, &step.guide.meta)?;
        let request = CallRequest {
            request_id: Uuid::new_v4().to_string(),
            data: CallPayload {
                pid: pid.map(str::to_string),
                step_index: step.step_index,
                step_desc: step.step_desc.clone(),
                guide_info: step.guide_info.clone(),
                cur_image_shm_id: current.id().to_string(),
                cur_image_meta: step.current.meta,
                guide_image_shm_id: guide.id().to_string(),
                guide_image_meta: step.guide.meta,
            },
        };

        let outcome = exchange(channel, request, timeout);
        for lease in [current, guide] {
            let id = lease.id().to_string();
            if let Err(err) = lease.release() {
                warn!(shm_id = %id, error = %err, "image segment release failed");
            }
        }
        outcome
    }
}

fn exchange(
    channel: &mut dyn FrameChannel,
    request: CallRequest,
    timeout: Duration,
) -> Result<CallResult> {
    let request_id = request.request_id.clone();
    let deadline = Instant::now() + timeout;
    debug!(request_id = %request_id, step = request.data.step_index, "execute");
    channel.send(&HostMessage::Execute(request), timeout)?;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(RunnerError::CallTimeout {
                request_id,
                timeout_ms: timeout.as_millis(),
            });
        }
        let Some(message) = channel.recv_timeout(remaining)? else {
            continue;
        };
        if let Some(other) = message.request_id() {
            if other != request_id {
                warn!(
                    expected = %request_id,
                    received = %other,
                    "discarding reply for another request"
                );
                continue;
            }
        }
        match message {
            ChildMessage::Result(response) => return finish(response.outcome()),
            ChildMessage::Error { message, code, .. } => {
                return Err(RunnerError::AlgorithmExecution {
                    code: code.unwrap_or_else(|| "9999".to_string()),
                    message,
                });
            }
            ChildMessage::Pong => trace!("pong during call"),
            ChildMessage::Hello { .. } => warn!("unexpected hello during call"),
            ChildMessage::Unknown => debug!("ignoring unknown message during call"),
        }
    }
}

fn finish(outcome: ResponseOutcome) -> Result<CallResult> {
    match outcome {
        ResponseOutcome::Success(mut result) => {
            let dropped = result.truncate_defects(MAX_DEFECT_RECTS);
            if dropped > 0 {
                warn!(
                    request_id = %result.request_id,
                    dropped,
                    kept = MAX_DEFECT_RECTS,
                    "truncating defect rectangles"
                );
            }
            Ok(result)
        }
        ResponseOutcome::Failed { code, message } => {
            Err(RunnerError::AlgorithmExecution { code, message })
        }
        ResponseOutcome::Malformed(reason) => Err(RunnerError::Protocol(reason)),
    }
}

#[cfg(test)]
mod tests;
