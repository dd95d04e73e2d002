//! Decoding must fail cleanly on truncated, extended or corrupted datagrams.

use nagent_proto::{
    KillTasksRequest, LaunchTasksRequest, Message, ProtocolError, ReturnCode, StepId,
    StepStatusResponse, TaskExitMsg, TaskState, TaskStatusEntry,
};

fn sample_messages() -> Vec<Message> {
    vec![
        Message::Ping,
        Message::LaunchTasks(LaunchTasksRequest {
            job_id: 1000,
            step_id: 2000,
            uid: 0,
            gid: 0,
            credential: b"opaque-credential".to_vec(),
            argv: vec!["/bin/true".into()],
            env: vec!["PATH=/bin".into(), "EMPTY=".into()],
            cwd: None,
            global_task_ids: vec![4, 5, 6],
            io_addr: Some("[::1]:5000".parse().unwrap()),
            resp_addr: Some("127.0.0.1:5001".parse().unwrap()),
        }),
        Message::KillTasks(KillTasksRequest {
            job_id: 1,
            step_id: 2,
            signal: 9,
        }),
        Message::ReleaseJobStep(StepId {
            job_id: 1,
            step_id: 2,
        }),
        Message::StepStatus(StepId {
            job_id: 3,
            step_id: 4,
        }),
        Message::ReturnCode(ReturnCode::StepBusy),
        Message::StepStatusResponse(StepStatusResponse {
            node_name: "n1".into(),
            job_id: 3,
            step_id: 4,
            capacity: 8,
            tasks: vec![TaskStatusEntry {
                task_id: 0,
                pid: 99,
                state: TaskState::Forked,
                exit_code: 0,
            }],
        }),
        Message::TaskExit(TaskExitMsg {
            job_id: 1000,
            step_id: 2000,
            task_id: 0,
            state: TaskState::Exited,
            exit_code: 127,
            signal: 0,
            errno: 2,
        }),
    ]
}

#[test]
fn every_message_round_trips() {
    for msg in sample_messages() {
        let bytes = msg.encode().unwrap();
        assert_eq!(Message::decode(&bytes).unwrap(), msg);
    }
}

#[test]
fn every_truncation_is_rejected() {
    for msg in sample_messages() {
        let bytes = msg.encode().unwrap();
        for cut in 0..bytes.len() {
            let result = Message::decode(&bytes[..cut]);
            assert!(
                matches!(
                    result,
                    Err(ProtocolError::ShortHeader(_)) | Err(ProtocolError::LengthMismatch { .. })
                ),
                "{:?} cut at {cut}: {result:?}",
                msg.msg_type()
            );
        }
    }
}

#[test]
fn extension_is_rejected() {
    for msg in sample_messages() {
        let mut bytes = msg.encode().unwrap();
        bytes.extend_from_slice(&[0, 0, 0, 0]);
        assert!(matches!(
            Message::decode(&bytes),
            Err(ProtocolError::LengthMismatch { .. })
        ));
    }
}

/// Declared length patched to match a truncated body: the body decoder must
/// notice the missing fields itself.
#[test]
fn consistent_header_with_short_body_is_rejected() {
    for msg in sample_messages() {
        let bytes = msg.encode().unwrap();
        for cut in 10..bytes.len() {
            let mut short = bytes[..cut].to_vec();
            let body_len = (cut - 10) as u32;
            short[6..10].copy_from_slice(&body_len.to_be_bytes());
            assert!(
                Message::decode(&short).is_err(),
                "{:?} body cut at {cut} decoded",
                msg.msg_type()
            );
        }
    }
}

/// Random byte flips never panic or read out of bounds.
#[test]
fn corrupted_bytes_never_panic() {
    let mut seed: u64 = 0x9e37_79b9_7f4a_7c15;
    let mut next = move || {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        seed
    };

    for msg in sample_messages() {
        let bytes = msg.encode().unwrap();
        for _ in 0..500 {
            let mut corrupted = bytes.clone();
            let flips = 1 + (next() % 4) as usize;
            for _ in 0..flips {
                let idx = (next() as usize) % corrupted.len();
                corrupted[idx] ^= (next() & 0xff) as u8;
            }
            let _ = Message::decode(&corrupted);
        }
    }
}
