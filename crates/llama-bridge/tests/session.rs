mod common;

use common::{BOS, EOS, HistoryGreedy, ScriptedContext, ScriptedSampler};
use llama_bridge::{
    BridgeError, DecodeBatch, FinishReason, GenerationSession, InferenceRuntime, NoticeScope,
    Position, ProbeConfig, SessionConfig, SessionState, StepOutput, Token, TokenSampler,
};

fn runtime() -> InferenceRuntime {
    InferenceRuntime::with_config(ProbeConfig::default())
}

fn batch() -> DecodeBatch {
    DecodeBatch::new(512, 0, 1).unwrap()
}

/// Drive a session to its end, collecting every step output.
fn run_to_end<S: TokenSampler<ScriptedContext>>(
    rt: &InferenceRuntime,
    config: SessionConfig,
    ctx: &mut ScriptedContext,
    sampler: &mut S,
    prompt: &str,
    max_output: i32,
) -> Vec<StepOutput> {
    let mut batch = batch();
    let mut session = GenerationSession::new(rt, config);
    let n = session.init(ctx, &mut batch, prompt, max_output).unwrap();
    let mut cursor = Position(n as i32);
    let mut out = Vec::new();
    for _ in 0..1000 {
        let step = session
            .step(ctx, &mut batch, sampler, max_output, &mut cursor)
            .unwrap();
        let done = matches!(step, StepOutput::Finished { .. } | StepOutput::Cancelled);
        out.push(step);
        if done {
            break;
        }
    }
    out
}

fn text_of(steps: &[StepOutput]) -> String {
    steps
        .iter()
        .filter_map(|s| match s {
            StepOutput::Text(t) => Some(t.as_str()),
            _ => None,
        })
        .collect()
}

//  init

#[test]
fn init_lays_out_prompt_with_logits_on_last_token() {
    let rt = runtime();
    let mut ctx = ScriptedContext::new(64, 64);
    let mut batch = batch();
    let mut session = GenerationSession::new(&rt, SessionConfig::default());

    let n = session.init(&mut ctx, &mut batch, "abc", 8).unwrap();

    assert_eq!(n, 4);
    assert_eq!(session.state(), SessionState::PromptEvaluated);
    assert_eq!(ctx.decode_calls, 1);
    let expected: Vec<(Token, i32, Vec<i32>, bool)> = vec![
        (BOS, 0, vec![0], false),
        (b'a'.into(), 1, vec![0], false),
        (b'b'.into(), 2, vec![0], false),
        (b'c'.into(), 3, vec![0], true),
    ];
    assert_eq!(ctx.last_batch, expected);
}

#[test]
fn init_rejects_output_length_filling_context() {
    let rt = runtime();
    let mut ctx = ScriptedContext::new(32, 32);
    let mut session = GenerationSession::new(&rt, SessionConfig::default());

    let err = session.init(&mut ctx, &mut batch(), "hello", 32).unwrap_err();

    assert!(matches!(
        err,
        BridgeError::NoRoomForInput {
            max_output: 32,
            n_ctx: 32
        }
    ));
    assert_eq!(ctx.decode_calls, 0);
    assert_eq!(session.state(), SessionState::Failed);
}

#[test]
fn init_truncates_long_prompt_instead_of_failing() {
    let rt = runtime();
    let mut ctx = ScriptedContext::new(16, 16);
    let mut batch = batch();
    let mut session = GenerationSession::new(&rt, SessionConfig::default());

    let n = session
        .init(&mut ctx, &mut batch, "abcdefghijklmnopqrstuvwxyz", 6)
        .unwrap();

    assert_eq!(n, 10);
    assert_eq!(batch.len(), 10);
    assert_eq!(batch.tokens()[9], Token::from(b'i'));
}

#[test]
fn init_checks_engine_batch_limit() {
    let rt = runtime();
    let mut ctx = ScriptedContext::new(64, 4);
    let mut session = GenerationSession::new(&rt, SessionConfig::default());

    let err = session.init(&mut ctx, &mut batch(), "abcdef", 8).unwrap_err();

    assert!(matches!(
        err,
        BridgeError::BatchSizeExceeded {
            tokens: 7,
            n_batch: 4
        }
    ));
}

#[test]
fn init_rejects_prompt_larger_than_batch_without_touching_it() {
    let rt = runtime();
    let mut ctx = ScriptedContext::new(64, 64);
    let mut batch = DecodeBatch::new(8, 0, 1).unwrap();
    batch.append(42, 0, &[0], true).unwrap();
    let mut session = GenerationSession::new(&rt, SessionConfig::default());

    let err = session
        .init(&mut ctx, &mut batch, "twenty bytes prompt!", 16)
        .unwrap_err();

    assert!(matches!(
        err,
        BridgeError::BatchCapacityExceeded {
            tokens: 21,
            capacity: 8
        }
    ));
    assert_eq!(batch.len(), 1);
    assert_eq!(batch.tokens()[0], 42);
    assert_eq!(ctx.decode_calls, 0);
    assert_eq!(session.state(), SessionState::Failed);
}

#[test]
fn init_twice_is_rejected() {
    let rt = runtime();
    let mut ctx = ScriptedContext::new(64, 64);
    let mut batch = batch();
    let mut session = GenerationSession::new(&rt, SessionConfig::default());
    session.init(&mut ctx, &mut batch, "hi", 8).unwrap();

    let err = session.init(&mut ctx, &mut batch, "hi", 8).unwrap_err();

    assert!(matches!(err, BridgeError::AlreadyInitialized));
    assert_eq!(session.state(), SessionState::PromptEvaluated);
    assert_eq!(ctx.decode_calls, 1);
}

#[test]
fn init_surfaces_prompt_decode_failure() {
    let rt = runtime();
    let mut ctx = ScriptedContext::new(64, 64);
    ctx.fail_decode_at = Some(1);
    let mut session = GenerationSession::new(&rt, SessionConfig::default());

    let err = session.init(&mut ctx, &mut batch(), "hi", 8).unwrap_err();

    assert!(matches!(err, BridgeError::DecodeFailed(-1)));
    assert_eq!(session.state(), SessionState::Failed);
}

//  step

#[test]
fn greedy_generation_is_deterministic() {
    let rt = runtime();
    let run = || {
        let mut ctx = ScriptedContext::new(128, 128);
        run_to_end(
            &rt,
            SessionConfig::default(),
            &mut ctx,
            &mut HistoryGreedy,
            "Once upon a time",
            40,
        )
    };

    let first = run();
    let second = run();

    assert!(!text_of(&first).is_empty());
    assert_eq!(first, second);
}

#[test]
fn eog_token_ends_without_notice() {
    let rt = runtime();
    let mut ctx = ScriptedContext::new(64, 64);
    let mut sampler = ScriptedSampler::new(&[b'o'.into(), b'k'.into(), EOS]);

    let steps = run_to_end(&rt, SessionConfig::default(), &mut ctx, &mut sampler, "hi", 16);

    assert_eq!(text_of(&steps), "ok");
    assert_eq!(
        steps.last(),
        Some(&StepOutput::Finished {
            reason: FinishReason::EndOfGeneration,
            notice: None
        })
    );
    // prompt + one decode per accepted token, none after EOS
    assert_eq!(ctx.decode_calls, 3);
}

#[test]
fn split_two_byte_character_is_emitted_once_complete() {
    let rt = runtime();
    let e = "é".as_bytes();
    let mut ctx = ScriptedContext::new(64, 64)
        .with_piece(300, &e[..1])
        .with_piece(301, &e[1..]);
    let mut sampler = ScriptedSampler::new(&[300, 301, EOS]);

    let steps = run_to_end(&rt, SessionConfig::default(), &mut ctx, &mut sampler, "x", 16);

    assert_eq!(steps[0], StepOutput::Pending);
    assert_eq!(steps[1], StepOutput::Text("é".into()));
}

#[test]
fn invalid_lead_byte_keeps_accumulating() {
    let rt = runtime();
    let mut ctx = ScriptedContext::new(64, 64).with_piece(300, &[0xFF]);
    let mut script = vec![300];
    script.extend(std::iter::repeat_n(Token::from(b'a'), 10));
    let mut sampler = ScriptedSampler::new(&script);

    let steps = run_to_end(&rt, SessionConfig::default(), &mut ctx, &mut sampler, "x", 32);

    let (last, rest) = steps.split_last().unwrap();
    assert!(rest.iter().all(|s| *s == StepOutput::Pending));
    assert_eq!(rest.len(), 11);
    assert!(matches!(last, StepOutput::Finished { .. }));
}

#[test]
fn pending_cap_fails_the_session() {
    let rt = runtime();
    let mut ctx = ScriptedContext::new(64, 64).with_piece(300, &[0xFF]);
    let mut sampler = ScriptedSampler::new(&[300, 300, 300]);
    let config = SessionConfig {
        max_pending_bytes: Some(2),
        ..Default::default()
    };
    let mut batch = batch();
    let mut session = GenerationSession::new(&rt, config);
    let n = session.init(&mut ctx, &mut batch, "x", 16).unwrap();
    let mut cursor = Position(n as i32);

    for _ in 0..2 {
        let out = session
            .step(&mut ctx, &mut batch, &mut sampler, 16, &mut cursor)
            .unwrap();
        assert_eq!(out, StepOutput::Pending);
    }
    let err = session
        .step(&mut ctx, &mut batch, &mut sampler, 16, &mut cursor)
        .unwrap_err();
    assert!(matches!(err, BridgeError::PendingOverflow(3)));
    assert_eq!(session.state(), SessionState::Failed);
}

#[test]
fn length_limit_emits_notice_once_per_session() {
    let rt = runtime();
    let config = SessionConfig::default();
    let notice = config.truncation_notice.clone();

    for _ in 0..2 {
        let mut ctx = ScriptedContext::new(64, 64);
        // "hi" + BOS = 3 prompt tokens; positions 3..=7 yield text.
        let steps = run_to_end(&rt, config.clone(), &mut ctx, &mut HistoryGreedy, "hi", 8);
        assert_eq!(steps.len(), 6);
        assert_eq!(
            steps.last(),
            Some(&StepOutput::Finished {
                reason: FinishReason::Length,
                notice: Some(notice.clone())
            })
        );
    }
}

#[test]
fn process_scoped_notice_is_sent_once_per_runtime() {
    let rt = runtime();
    let config = SessionConfig {
        notice_scope: NoticeScope::Process,
        ..Default::default()
    };

    let notices: Vec<Option<String>> = (0..3)
        .map(|_| {
            let mut ctx = ScriptedContext::new(64, 64);
            let steps = run_to_end(&rt, config.clone(), &mut ctx, &mut HistoryGreedy, "hi", 8);
            match steps.last() {
                Some(StepOutput::Finished {
                    reason: FinishReason::Length,
                    notice,
                }) => notice.clone(),
                other => panic!("unexpected end: {other:?}"),
            }
        })
        .collect();

    assert!(notices[0].is_some());
    assert_eq!(notices[1], None);
    assert_eq!(notices[2], None);
}

#[test]
fn stepping_after_end_returns_terminal_marker() {
    let rt = runtime();
    let mut ctx = ScriptedContext::new(64, 64);
    let mut sampler = ScriptedSampler::new(&[]);
    let mut batch = batch();
    let mut session = GenerationSession::new(&rt, SessionConfig::default());
    let n = session.init(&mut ctx, &mut batch, "hi", 4).unwrap();
    let mut cursor = Position(n as i32);

    let first = session
        .step(&mut ctx, &mut batch, &mut sampler, 4, &mut cursor)
        .unwrap();
    assert!(matches!(
        first,
        StepOutput::Finished {
            reason: FinishReason::EndOfGeneration,
            ..
        }
    ));
    let again = session
        .step(&mut ctx, &mut batch, &mut sampler, 4, &mut cursor)
        .unwrap();
    assert_eq!(
        again,
        StepOutput::Finished {
            reason: FinishReason::EndOfGeneration,
            notice: None
        }
    );
    assert_eq!(sampler.calls, 1);
}

//  cancellation

#[test]
fn cancelled_before_step_issues_no_decode() {
    let rt = runtime();
    let mut ctx = ScriptedContext::new(64, 64);
    let mut sampler = ScriptedSampler::new(&[b'a'.into()]);
    let mut batch = batch();
    let mut session = GenerationSession::new(&rt, SessionConfig::default());
    let n = session.init(&mut ctx, &mut batch, "hi", 8).unwrap();
    let mut cursor = Position(n as i32);
    let decodes_after_init = ctx.decode_calls;

    rt.cancellation().cancel();
    let out = session
        .step(&mut ctx, &mut batch, &mut sampler, 8, &mut cursor)
        .unwrap();

    assert_eq!(out, StepOutput::Cancelled);
    assert_eq!(ctx.decode_calls, decodes_after_init);
    assert_eq!(sampler.calls, 0);
    assert_eq!(cursor, Position(n as i32));
}

#[test]
fn cancellation_between_sample_and_decode_skips_decode() {
    let rt = runtime();
    let mut ctx = ScriptedContext::new(64, 64);
    let mut sampler = ScriptedSampler::new(&[b'a'.into(), b'b'.into()]);
    sampler.cancel_on_sample = Some((1, rt.cancellation().clone()));
    let mut batch = batch();
    let mut session = GenerationSession::new(&rt, SessionConfig::default());
    let n = session.init(&mut ctx, &mut batch, "hi", 8).unwrap();
    let mut cursor = Position(n as i32);

    let out = session
        .step(&mut ctx, &mut batch, &mut sampler, 8, &mut cursor)
        .unwrap();

    assert_eq!(out, StepOutput::Cancelled);
    assert_eq!(ctx.decode_calls, 1, "only the prompt decode ran");
    assert_eq!(cursor, Position(n as i32 + 1));
    assert_eq!(session.state(), SessionState::Cancelled);
}

#[test]
fn cancellation_during_decode_is_seen_after_it() {
    let rt = runtime();
    let mut ctx = ScriptedContext::new(64, 64);
    ctx.cancel_during_decode = Some((2, rt.cancellation().clone()));
    let mut sampler = ScriptedSampler::new(&[b'a'.into(), b'b'.into()]);

    let steps = run_to_end(&rt, SessionConfig::default(), &mut ctx, &mut sampler, "hi", 8);

    assert_eq!(steps, [StepOutput::Cancelled]);
    assert_eq!(ctx.decode_calls, 2);
}

//  failure

#[test]
fn decode_failure_is_fatal_to_the_session() {
    let rt = runtime();
    let mut ctx = ScriptedContext::new(64, 64);
    ctx.fail_decode_at = Some(2);
    let mut sampler = ScriptedSampler::new(&[b'a'.into(), b'b'.into()]);
    let mut batch = batch();
    let mut session = GenerationSession::new(&rt, SessionConfig::default());
    let n = session.init(&mut ctx, &mut batch, "hi", 8).unwrap();
    let mut cursor = Position(n as i32);

    let err = session
        .step(&mut ctx, &mut batch, &mut sampler, 8, &mut cursor)
        .unwrap_err();
    assert!(matches!(err, BridgeError::DecodeFailed(-1)));
    assert_eq!(session.state(), SessionState::Failed);

    let again = session
        .step(&mut ctx, &mut batch, &mut sampler, 8, &mut cursor)
        .unwrap_err();
    assert!(matches!(again, BridgeError::SessionFailed));
    assert_eq!(ctx.decode_calls, 2);

    // A fresh session on the same context still works.
    let mut fresh = GenerationSession::new(&rt, SessionConfig::default());
    ctx.fail_decode_at = None;
    assert!(fresh.init(&mut ctx, &mut batch, "hi", 8).is_ok());
}

#[test]
fn step_before_init_is_rejected() {
    let rt = runtime();
    let mut ctx = ScriptedContext::new(64, 64);
    let mut session = GenerationSession::new(&rt, SessionConfig::default());

    let err = session
        .step(
            &mut ctx,
            &mut batch(),
            &mut ScriptedSampler::new(&[]),
            8,
            &mut Position(0),
        )
        .unwrap_err();

    assert!(matches!(err, BridgeError::SessionFailed));
    assert_eq!(ctx.decode_calls, 0);
}
