//! Decoder session tests against a scripted engine

mod common;

use common::{heap, nv12_stream_info, Call, ScriptedDecodeBackend, ScriptedFrame};
use lamco_vpu::config::DecoderConfig;
use lamco_vpu::engine::{DecOpenFlag, DecOutputCode, FrameContext, SkipReason, SkippedFrameInfo};
use lamco_vpu::error::{EngineCode, ErrorKind};
use lamco_vpu::image::PixelFormat;
use lamco_vpu::{DecoderSession, VpuError};

fn config() -> DecoderConfig {
    DecoderConfig {
        width: 4,
        height: 4,
        max_steps_per_call: 64,
        ..Default::default()
    }
}

/// 4x4 luma ramp with a 2x2 interleaved chroma pattern
fn test_pattern(pts: u64, context: u64) -> ScriptedFrame {
    ScriptedFrame {
        luma: (0..16).collect(),
        chroma: vec![0x80, 0x81, 0x82, 0x83, 0x90, 0x91, 0x92, 0x93],
        pts,
        context: FrameContext::from_raw(context),
        fb_context: None,
    }
}

fn count(calls: &[Call], wanted: impl Fn(&Call) -> bool) -> usize {
    calls.iter().filter(|call| wanted(call)).count()
}

#[test]
fn test_first_frame_negotiates_and_decodes() {
    let (heap, allocator) = heap();
    let backend = ScriptedDecodeBackend::new(allocator.clone(), true);
    {
        let mut state = backend.state.lock();
        state.stream_infos.push_back(nv12_stream_info(4, 4, 16, 3));
        state.frames.push_back(test_pattern(7, 0));
    }
    backend.script([
        DecOutputCode::NewStreamInfoAvailable,
        DecOutputCode::DecodedFrameAvailable,
        DecOutputCode::MoreInputDataNeeded,
    ]);

    let mut session = DecoderSession::open(&backend, allocator, &config()).unwrap();
    let frame = session
        .decode(&[0x00, 0x00, 0x01], 7, 7)
        .unwrap()
        .expect("one decoded frame");

    assert_eq!(frame.image.luma, (0..16).collect::<Vec<u8>>());
    assert_eq!(
        frame.image.chroma,
        vec![0x80, 0x81, 0x82, 0x83, 0x90, 0x91, 0x92, 0x93]
    );
    assert_eq!(frame.pts, 7);
    assert_eq!(frame.context, FrameContext::for_slot(0));
    assert!(session.receive_frame().is_none());

    assert_eq!(session.pool().len(), 3);
    assert_eq!(session.stats().frames_out, 1);
    assert_eq!(heap.live_buffers(), 1 + 3);

    let calls = backend.calls();
    assert!(calls.contains(&Call::AddPool(vec![
        FrameContext::for_slot(0),
        FrameContext::for_slot(1),
        FrameContext::for_slot(2),
    ])));
    assert_eq!(count(&calls, |c| matches!(c, Call::Return(_))), 1);
    assert_eq!(count(&calls, |c| *c == Call::Step), 3);
}

#[test]
fn test_open_flags_request_semi_planar_output() {
    let (_heap, allocator) = heap();
    let backend = ScriptedDecodeBackend::new(allocator.clone(), true);
    let _session = DecoderSession::open(&backend, allocator, &config()).unwrap();

    let params = backend.state.lock().open_params.clone().unwrap();
    assert!(params.flags.contains(DecOpenFlag::UseSemiPlanarColorFormat));
    assert!(params.flags.contains(DecOpenFlag::EnableFrameReordering));
    assert_eq!((params.frame_width, params.frame_height), (4, 4));
}

#[test]
fn test_renegotiation_replaces_pool() {
    let (heap, allocator) = heap();
    let backend = ScriptedDecodeBackend::new(allocator.clone(), true);
    {
        let mut state = backend.state.lock();
        state.stream_infos.push_back(nv12_stream_info(4, 4, 16, 2));
        state.stream_infos.push_back(nv12_stream_info(8, 8, 32, 4));
    }
    let mut session = DecoderSession::open(&backend, allocator, &config()).unwrap();

    backend.script([DecOutputCode::NewStreamInfoAvailable]);
    assert!(session.decode(&[1], 0, 0).unwrap().is_none());
    let old_handles = session.pool().handles();
    assert_eq!(old_handles.len(), 2);

    backend.script([DecOutputCode::NewStreamInfoAvailable]);
    assert!(session.decode(&[2], 1, 1).unwrap().is_none());

    let new_handles = session.pool().handles();
    assert_eq!(new_handles.len(), 4);
    assert!(old_handles.iter().all(|h| !new_handles.contains(h)));
    assert!(new_handles
        .iter()
        .all(|h| h.size() == nv12_stream_info(8, 8, 32, 4).framebuffer_size));

    let registered: Vec<_> = backend.state.lock().pool.iter().map(|(h, _)| *h).collect();
    assert_eq!(registered, new_handles);

    assert_eq!(session.stats().renegotiations, 2);
    assert_eq!(session.stream_info().unwrap().metrics.actual_width, 8);
    assert_eq!(heap.live_buffers(), 1 + 4);
}

#[test]
fn test_unknown_output_code_is_protocol_violation() {
    let (heap, allocator) = heap();
    let backend = ScriptedDecodeBackend::new(allocator.clone(), true);
    backend.script([DecOutputCode::NoOutputYetAvailable, DecOutputCode::Other(99)]);

    let mut session = DecoderSession::open(&backend, allocator, &config()).unwrap();
    let err = session.decode(&[1], 0, 0).unwrap_err();

    assert!(matches!(
        err,
        VpuError::ProtocolViolation {
            direction: "decoder",
            code: 99
        }
    ));
    assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
    assert!(!err.is_recoverable());

    drop(session);
    assert_eq!(heap.live_buffers(), 0);
    assert_eq!(backend.calls().last(), Some(&Call::Close));
}

#[test]
fn test_skipped_frame_is_reported_not_fatal() {
    let (_heap, allocator) = heap();
    let backend = ScriptedDecodeBackend::new(allocator.clone(), true);
    backend.state.lock().skips.push_back(SkippedFrameInfo {
        reason: SkipReason::CorruptFrame,
        context: FrameContext::from_raw(0),
        pts: 5,
        dts: 5,
    });
    backend.script([DecOutputCode::FrameSkipped, DecOutputCode::MoreInputDataNeeded]);

    let mut session = DecoderSession::open(&backend, allocator, &config()).unwrap();
    assert!(session.decode(&[1], 5, 5).unwrap().is_none());
    assert_eq!(session.stats().frames_skipped, 1);
    assert!(backend.calls().contains(&Call::SkipInfo));
}

#[test]
fn test_invalid_call_push_is_retried_once_after_flush() {
    let (_heap, allocator) = heap();
    let backend = ScriptedDecodeBackend::new(allocator.clone(), true);
    backend
        .state
        .lock()
        .push_results
        .push_back(Err(EngineCode::InvalidCall));

    let mut session = DecoderSession::open(&backend, allocator, &config()).unwrap();
    assert!(session.decode(&[1], 3, 3).unwrap().is_none());

    assert_eq!(
        backend.calls(),
        vec![
            Call::Open,
            Call::Push { pts: 3 },
            Call::Flush,
            Call::Push { pts: 3 },
            Call::Step,
        ]
    );
}

#[test]
fn test_push_retry_is_bounded() {
    let (_heap, allocator) = heap();
    let backend = ScriptedDecodeBackend::new(allocator.clone(), true);
    backend
        .state
        .lock()
        .push_results
        .extend([Err(EngineCode::InvalidCall), Err(EngineCode::InvalidCall)]);

    let mut session = DecoderSession::open(&backend, allocator, &config()).unwrap();
    let err = session.decode(&[1], 0, 0).unwrap_err();
    assert!(matches!(
        err,
        VpuError::EngineRejected {
            operation: "push encoded frame",
            code: EngineCode::InvalidCall
        }
    ));

    let calls = backend.calls();
    assert_eq!(count(&calls, |c| matches!(c, Call::Push { .. })), 2);
    assert_eq!(count(&calls, |c| *c == Call::Step), 0);
}

#[test]
fn test_other_push_errors_are_not_retried() {
    let (_heap, allocator) = heap();
    let backend = ScriptedDecodeBackend::new(allocator.clone(), true);
    backend
        .state
        .lock()
        .push_results
        .push_back(Err(EngineCode::InvalidParams));

    let mut session = DecoderSession::open(&backend, allocator, &config()).unwrap();
    assert!(session.decode(&[1], 0, 0).is_err());
    assert!(!backend.calls().contains(&Call::Flush));
}

#[test]
fn test_dedicated_output_is_rearmed_with_framebuffer_context() {
    let (heap, allocator) = heap();
    let backend = ScriptedDecodeBackend::new(allocator.clone(), false);
    {
        let mut state = backend.state.lock();
        state.stream_infos.push_back(nv12_stream_info(4, 4, 16, 3));
        state.frames.push_back(ScriptedFrame {
            fb_context: Some(FrameContext::for_slot(7)),
            ..test_pattern(0, 42)
        });
    }
    backend.script([
        DecOutputCode::NewStreamInfoAvailable,
        DecOutputCode::DecodedFrameAvailable,
        DecOutputCode::MoreInputDataNeeded,
    ]);

    let mut session = DecoderSession::open(&backend, allocator, &config()).unwrap();
    assert_eq!(session.last_context(), FrameContext::UNSET);

    let frame = session.decode(&[1], 0, 0).unwrap().expect("one decoded frame");
    assert_eq!(frame.image.luma, (0..16).collect::<Vec<u8>>());
    assert_eq!(frame.context, FrameContext::for_slot(7));
    // The caller's input tag (42) never reaches the engine as a framebuffer context
    assert_eq!(session.last_context(), FrameContext::for_slot(7));

    let output = session.output_framebuffer().expect("dedicated output buffer");
    assert!(!session.pool().contains(output));

    assert!(session.decode(&[2], 1, 1).unwrap().is_none());

    let armed: Vec<_> = backend
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            Call::SetOutput(handle, context) => Some((handle, context)),
            _ => None,
        })
        .collect();
    assert_eq!(
        armed,
        vec![
            (output, FrameContext::UNSET),
            (output, FrameContext::for_slot(7)),
            (output, FrameContext::for_slot(7)),
        ]
    );
    assert_eq!(heap.live_buffers(), 1 + 3 + 1);
}

#[test]
fn test_failed_open_releases_staging_buffer() {
    let (heap, allocator) = heap();
    let backend = ScriptedDecodeBackend::new(allocator.clone(), true);
    backend.state.lock().open_result = Err(EngineCode::InvalidParams);

    let err = DecoderSession::open(&backend, allocator, &config())
        .err()
        .expect("open fails");
    assert!(matches!(
        err,
        VpuError::EngineRejected {
            operation: "open decoder",
            code: EngineCode::InvalidParams
        }
    ));
    assert_eq!(heap.stats().allocations, 1);
    assert_eq!(heap.live_buffers(), 0);
}

#[test]
fn test_unsupported_format_fails_before_any_allocation() {
    let (heap, allocator) = heap();
    let backend = ScriptedDecodeBackend::new(allocator.clone(), true);
    let config = DecoderConfig {
        pixel_format: PixelFormat::Yuv444p,
        ..config()
    };

    let err = DecoderSession::open(&backend, allocator, &config)
        .err()
        .expect("open fails");
    assert!(matches!(err, VpuError::UnsupportedFormat(_)));
    assert_eq!(heap.stats().allocations, 0);
    assert!(backend.calls().is_empty());
}

#[test]
fn test_partial_pool_allocation_stays_registered() {
    let (heap, allocator) = heap();
    let backend = ScriptedDecodeBackend::new(allocator.clone(), true);
    backend
        .state
        .lock()
        .stream_infos
        .push_back(nv12_stream_info(4, 4, 16, 3));
    backend.script([DecOutputCode::NewStreamInfoAvailable]);

    let mut session = DecoderSession::open(&backend, allocator, &config()).unwrap();
    heap.limit_allocations(2);

    let err = session.decode(&[1], 0, 0).unwrap_err();
    assert!(matches!(
        err,
        VpuError::AllocationFailure {
            what: "pool framebuffer",
            ..
        }
    ));
    assert_eq!(session.pool().len(), 2);
    assert_eq!(backend.state.lock().pool.len(), 2);

    heap.clear_allocation_limit();
    session.close();
    assert_eq!(heap.live_buffers(), 0);
}

#[test]
fn test_engine_refusing_pool_leaves_pool_empty() {
    let (heap, allocator) = heap();
    let backend = ScriptedDecodeBackend::new(allocator.clone(), true);
    {
        let mut state = backend.state.lock();
        state.stream_infos.push_back(nv12_stream_info(4, 4, 16, 3));
        state.add_results.push_back(Err(EngineCode::ContextMismatch));
    }
    backend.script([DecOutputCode::NewStreamInfoAvailable]);

    let mut session = DecoderSession::open(&backend, allocator, &config()).unwrap();
    let err = session.decode(&[1], 0, 0).unwrap_err();
    assert!(matches!(
        err,
        VpuError::EngineRejected {
            operation: "add framebuffers to pool",
            code: EngineCode::ContextMismatch
        }
    ));
    assert!(session.pool().is_empty());
    assert_eq!(heap.live_buffers(), 1);
}

#[test]
fn test_additional_framebuffer_grows_pool_by_one() {
    let (_heap, allocator) = heap();
    let backend = ScriptedDecodeBackend::new(allocator.clone(), true);
    backend
        .state
        .lock()
        .stream_infos
        .push_back(nv12_stream_info(4, 4, 16, 2));
    backend.script([
        DecOutputCode::NewStreamInfoAvailable,
        DecOutputCode::NeedAdditionalFramebuffer,
        DecOutputCode::MoreInputDataNeeded,
    ]);

    let mut session = DecoderSession::open(&backend, allocator, &config()).unwrap();
    session.decode(&[1], 0, 0).unwrap();

    assert_eq!(session.pool().len(), 3);
    let calls = backend.calls();
    assert!(calls.contains(&Call::AddPool(vec![FrameContext::for_slot(2)])));
}

#[test]
fn test_framebuffer_request_before_stream_info_is_violation() {
    let (_heap, allocator) = heap();
    let backend = ScriptedDecodeBackend::new(allocator.clone(), true);
    backend.script([DecOutputCode::NeedAdditionalFramebuffer]);

    let mut session = DecoderSession::open(&backend, allocator, &config()).unwrap();
    let err = session.decode(&[1], 0, 0).unwrap_err();
    assert!(matches!(
        err,
        VpuError::ProtocolViolation {
            direction: "decoder",
            code: 3
        }
    ));
}

#[test]
fn test_dispatcher_gives_up_after_step_budget() {
    let (_heap, allocator) = heap();
    let backend = ScriptedDecodeBackend::new(allocator.clone(), true);
    backend.state.lock().idle_code = DecOutputCode::NoOutputYetAvailable;
    let config = DecoderConfig {
        max_steps_per_call: 8,
        ..config()
    };

    let mut session = DecoderSession::open(&backend, allocator, &config).unwrap();
    let err = session.decode(&[1], 0, 0).unwrap_err();
    assert!(matches!(
        err,
        VpuError::EngineRejected {
            operation: "decode",
            code: EngineCode::Timeout
        }
    ));
    assert_eq!(count(&backend.calls(), |c| *c == Call::Step), 8);
}

#[test]
fn test_empty_packet_drains() {
    let (_heap, allocator) = heap();
    let backend = ScriptedDecodeBackend::new(allocator.clone(), true);
    backend.script([DecOutputCode::Eos]);

    let mut session = DecoderSession::open(&backend, allocator, &config()).unwrap();
    assert!(session.decode(&[], 0, 0).unwrap().is_none());
    assert!(session.at_end_of_stream());

    let calls = backend.calls();
    assert!(calls.contains(&Call::Drain));
    assert_eq!(count(&calls, |c| matches!(c, Call::Push { .. })), 0);
}

#[test]
fn test_close_is_idempotent_and_releases_everything() {
    let (heap, allocator) = heap();
    let backend = ScriptedDecodeBackend::new(allocator.clone(), true);
    {
        let mut state = backend.state.lock();
        state.stream_infos.push_back(nv12_stream_info(4, 4, 16, 3));
        state.close_result = Err(EngineCode::Error);
    }
    backend.script([DecOutputCode::NewStreamInfoAvailable]);

    let mut session = DecoderSession::open(&backend, allocator, &config()).unwrap();
    session.decode(&[1], 0, 0).unwrap();
    assert_eq!(heap.live_buffers(), 4);

    session.close();
    session.close();
    assert!(session.is_closed());
    assert_eq!(heap.live_buffers(), 0);
    assert_eq!(count(&backend.calls(), |c| *c == Call::Close), 1);

    assert!(matches!(
        session.decode(&[1], 0, 0),
        Err(VpuError::SessionClosed)
    ));
}
