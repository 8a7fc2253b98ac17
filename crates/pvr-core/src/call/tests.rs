use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

use proptest::collection::vec;
use proptest::prelude::*;
use pvr_domain::{CallResponse, DefectRect, ResponseStatus, ResultData, Verdict};

use super::*;
use crate::test_support::{gray_step, CountingImages};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reply {
    Answer,
    /// Replays the previous request's answer.
    Stale,
    Foreign,
    Fail,
    ErrorFrame,
    Malformed,
    Pong,
    Silence,
}

#[derive(Default)]
struct ScriptedChannel {
    scripts: VecDeque<Vec<Reply>>,
    queue: VecDeque<ChildMessage>,
    sent: Vec<CallRequest>,
    closed: bool,
}

impl ScriptedChannel {
    fn new(scripts: Vec<Vec<Reply>>) -> Self {
        Self {
            scripts: scripts.into(),
            ..Self::default()
        }
    }

    fn last_id(&self) -> &str {
        &self.sent.last().unwrap().request_id
    }
}

fn answer(request_id: &str, defects: usize) -> ChildMessage {
    ChildMessage::Result(CallResponse {
        request_id: request_id.to_string(),
        status: ResponseStatus::Ok,
        message: None,
        error_code: None,
        data: Some(ResultData {
            result_status: Verdict::Fail,
            defect_rects: (0..defects)
                .map(|idx| DefectRect {
                    x: idx as f64,
                    y: 0.0,
                    width: 4.0,
                    height: 4.0,
                    label: Some("scratch".into()),
                    score: None,
                })
                .collect(),
            ng_reason: Some("scratch on housing".into()),
            debug: None,
        }),
    })
}

impl FrameChannel for ScriptedChannel {
    fn send(&mut self, message: &HostMessage, _timeout: Duration) -> Result<()> {
        let HostMessage::Execute(request) = message else {
            return Ok(());
        };
        let id = request.request_id.clone();
        let previous = self
            .sent
            .last()
            .map_or_else(|| "stale-id".to_string(), |req| req.request_id.clone());
        for reply in self.scripts.pop_front().unwrap_or_default() {
            let message = match reply {
                Reply::Answer => answer(&id, 1),
                Reply::Stale => answer(&previous, 1),
                Reply::Foreign => answer(&Uuid::new_v4().to_string(), 0),
                Reply::Fail => ChildMessage::Result(CallResponse {
                    request_id: id.clone(),
                    status: ResponseStatus::Error,
                    message: Some("model not loaded".into()),
                    error_code: Some("1004".into()),
                    data: None,
                }),
                Reply::ErrorFrame => ChildMessage::Error {
                    request_id: Some(id.clone()),
                    message: "adapter exploded".into(),
                    code: None,
                },
                Reply::Malformed => ChildMessage::Result(CallResponse {
                    request_id: id.clone(),
                    status: ResponseStatus::Ok,
                    message: None,
                    error_code: None,
                    data: None,
                }),
                Reply::Pong => ChildMessage::Pong,
                Reply::Silence => continue,
            };
            self.queue.push_back(message);
        }
        self.sent.push(request.clone());
        Ok(())
    }

    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<ChildMessage>> {
        if let Some(message) = self.queue.pop_front() {
            return Ok(Some(message));
        }
        if self.closed {
            return Err(RunnerError::ProcessCrashed("channel closed".into()));
        }
        thread::sleep(timeout.min(Duration::from_millis(5)));
        Ok(None)
    }
}

const TIMEOUT: Duration = Duration::from_millis(200);

#[test]
fn returns_matching_result_with_payload() {
    let images = CountingImages::default();
    let mut channel = ScriptedChannel::new(vec![vec![Reply::Pong, Reply::Foreign, Reply::Answer]]);
    let result = CallEngine::new(&images)
        .execute(&mut channel, Some("P1"), &gray_step(3), TIMEOUT)
        .unwrap();
    assert_eq!(result.request_id, channel.last_id());
    assert!(!result.passed());
    assert_eq!(result.ng_reason.as_deref(), Some("scratch on housing"));

    let sent = &channel.sent[0].data;
    assert_eq!(sent.pid.as_deref(), Some("P1"));
    assert_eq!(sent.step_index, 3);
    assert_ne!(sent.cur_image_shm_id, sent.guide_image_shm_id);
    assert_eq!(sent.cur_image_meta.byte_len, 16);
    assert!(images.balanced());
    assert_eq!(images.allocated.load(Ordering::SeqCst), 2);
}

#[test]
fn duplicate_of_previous_answer_is_discarded() {
    let images = CountingImages::default();
    let mut channel = ScriptedChannel::new(vec![
        vec![Reply::Answer, Reply::Answer],
        vec![Reply::Answer],
    ]);
    let engine = CallEngine::new(&images);
    let first = engine
        .execute(&mut channel, None, &gray_step(0), TIMEOUT)
        .unwrap();
    assert_eq!(first.request_id, channel.sent[0].request_id);
    let second = engine
        .execute(&mut channel, None, &gray_step(1), TIMEOUT)
        .unwrap();
    assert_eq!(second.request_id, channel.sent[1].request_id);
    assert_ne!(first.request_id, second.request_id);
    assert!(channel.queue.is_empty());
    assert!(images.balanced());
}

#[test]
fn silent_child_times_out_promptly() {
    let images = CountingImages::default();
    let mut channel = ScriptedChannel::new(vec![vec![Reply::Silence]]);
    let timeout = Duration::from_millis(10);
    let started = Instant::now();
    let err = CallEngine::new(&images)
        .execute(&mut channel, None, &gray_step(0), timeout)
        .unwrap_err();
    assert!(matches!(err, RunnerError::CallTimeout { timeout_ms: 10, .. }));
    assert_eq!(err.code(), "1005");
    assert!(started.elapsed() < timeout + Duration::from_millis(500));
    assert!(images.balanced());
}

#[test]
fn error_replies_carry_the_child_code() {
    let images = CountingImages::default();
    let mut channel = ScriptedChannel::new(vec![vec![Reply::Fail], vec![Reply::ErrorFrame]]);
    let engine = CallEngine::new(&images);
    let err = engine
        .execute(&mut channel, None, &gray_step(0), TIMEOUT)
        .unwrap_err();
    assert_eq!(err.code(), "1004");
    assert!(err.to_string().contains("model not loaded"));

    let err = engine
        .execute(&mut channel, None, &gray_step(1), TIMEOUT)
        .unwrap_err();
    assert_eq!(err.code(), "9999");
    assert!(matches!(err, RunnerError::AlgorithmExecution { .. }));
    assert!(images.balanced());
}

#[test]
fn malformed_and_closed_channels() {
    let images = CountingImages::default();
    let mut channel = ScriptedChannel::new(vec![vec![Reply::Malformed]]);
    let engine = CallEngine::new(&images);
    let err = engine
        .execute(&mut channel, None, &gray_step(0), TIMEOUT)
        .unwrap_err();
    assert_eq!(err.code(), "3003");

    channel.closed = true;
    let err = engine
        .execute(&mut channel, None, &gray_step(1), TIMEOUT)
        .unwrap_err();
    assert_eq!(err.code(), "3002");
    assert!(images.balanced());
}

#[test]
fn staging_failure_releases_first_segment() {
    let images = CountingImages::failing_at(2);
    let mut channel = ScriptedChannel::new(vec![vec![Reply::Answer]]);
    let err = CallEngine::new(&images)
        .execute(&mut channel, None, &gray_step(0), TIMEOUT)
        .unwrap_err();
    assert_eq!(err.code(), "1002");
    assert!(channel.sent.is_empty());
    assert_eq!(images.released.load(Ordering::SeqCst), 1);
    assert_eq!(images.live(), 0);
}

#[test]
fn defect_list_is_capped() {
    struct Flood(Option<ChildMessage>);
    impl FrameChannel for Flood {
        fn send(&mut self, message: &HostMessage, _timeout: Duration) -> Result<()> {
            if let HostMessage::Execute(request) = message {
                self.0 = Some(answer(&request.request_id, MAX_DEFECT_RECTS + 5));
            }
            Ok(())
        }
        fn recv_timeout(&mut self, _timeout: Duration) -> Result<Option<ChildMessage>> {
            Ok(self.0.take())
        }
    }
    let images = CountingImages::default();
    let result = CallEngine::new(&images)
        .execute(&mut Flood(None), None, &gray_step(0), TIMEOUT)
        .unwrap();
    assert_eq!(result.defect_rects.len(), MAX_DEFECT_RECTS);
}

fn any_reply() -> impl Strategy<Value = Reply> {
    prop_oneof![
        Just(Reply::Answer),
        Just(Reply::Stale),
        Just(Reply::Foreign),
        Just(Reply::Fail),
        Just(Reply::ErrorFrame),
        Just(Reply::Malformed),
        Just(Reply::Pong),
        Just(Reply::Silence),
    ]
}

fn noise() -> impl Strategy<Value = Reply> {
    prop_oneof![Just(Reply::Stale), Just(Reply::Foreign), Just(Reply::Pong)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn segments_never_leak(scripts in vec(vec(any_reply(), 0..4), 1..6)) {
        let images = CountingImages::default();
        let calls = scripts.len();
        let mut channel = ScriptedChannel::new(scripts);
        let engine = CallEngine::new(&images);
        for index in 0..calls {
            let _ = engine.execute(
                &mut channel,
                Some("P1"),
                &gray_step(index as u32),
                Duration::from_millis(5),
            );
            prop_assert!(images.balanced());
        }
        prop_assert_eq!(images.allocated.load(Ordering::SeqCst), calls * 2);
    }

    #[test]
    fn only_the_matching_response_is_returned(
        before in vec(noise(), 0..6),
        after in vec(noise(), 0..3),
    ) {
        let images = CountingImages::default();
        let mut script = before;
        script.push(Reply::Answer);
        script.extend(after);
        let mut channel = ScriptedChannel::new(vec![vec![Reply::Answer], script]);
        let engine = CallEngine::new(&images);
        engine.execute(&mut channel, None, &gray_step(0), TIMEOUT).unwrap();
        let result = engine.execute(&mut channel, None, &gray_step(1), TIMEOUT).unwrap();
        prop_assert_eq!(result.request_id.as_str(), channel.last_id());
        prop_assert!(images.balanced());
    }
}
