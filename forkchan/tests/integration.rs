//! Integration tests for forkchan
//!
//! These tests fork real child processes and check what the parent observes.

use forkchan::prelude::*;
use forkchan::{Duplex, FailureKind, ProcessState, Side};
use std::time::Duration;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
struct Record {
    i: i32,
    c: u8,
    _pad: [u8; 3],
}

/// The parent receives exactly what the child computed
#[test]
fn test_integer_round_trip() {
    let mut handle = ProcessHandle::<i32>::new().unwrap();
    let child = handle.run(|| 42).unwrap();
    assert!(child.as_raw() > 0);
    assert_eq!(handle.state(), ProcessState::ParentSide);
    assert_eq!(handle.role(), Role::Consumer);

    assert_eq!(handle.receive_result().unwrap(), 42);
    assert_eq!(handle.wait().unwrap(), ChildExit::Exited(0));
}

/// Aggregates arrive field by field
#[test]
fn test_record_round_trip() {
    let mut handle = ProcessHandle::<Record>::new().unwrap();
    handle
        .run(|| Record {
            i: 10,
            c: b'f',
            _pad: [0; 3],
        })
        .unwrap();

    let record = handle.receive_result().unwrap();
    assert_eq!(record.i, 10);
    assert_eq!(record.c, b'f');
    handle.wait().unwrap();
}

/// Each handle duplicates its own child
#[test]
fn test_children_are_distinct() {
    let mut first = ProcessHandle::<u32>::new().unwrap();
    let mut second = ProcessHandle::<u32>::new().unwrap();
    let a = first.run(|| 1).unwrap();
    let b = second.run(|| 2).unwrap();
    assert_ne!(a, b);
    assert_eq!(first.child_id(), Some(a));
    assert_eq!(second.child_id(), Some(b));

    assert_eq!(second.receive_result().unwrap(), 2);
    assert_eq!(first.receive_result().unwrap(), 1);
    first.wait().unwrap();
    second.wait().unwrap();
}

/// Payloads larger than the pipe buffer arrive whole
#[test]
fn test_large_payload_round_trip() {
    const WORDS: usize = 16 * 1024;
    let mut handle = ProcessHandle::<[u64; WORDS]>::new().unwrap();
    handle
        .run(|| {
            let mut words = [0u64; WORDS];
            for (i, word) in words.iter_mut().enumerate() {
                *word = (i as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15);
            }
            words
        })
        .unwrap();

    let words = handle.receive_result().unwrap();
    for (i, word) in words.iter().enumerate() {
        assert_eq!(*word, (i as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15));
    }
    assert!(handle.wait().unwrap().success());
}

/// Large payloads also cross a socket pair
#[test]
fn test_socket_pair_transport() {
    let mut handle = ProcessHandle::<[u8; 300_000]>::with_transport(Transport::SocketPair)
        .unwrap()
        .timeout(Duration::from_secs(10));
    handle.run(|| [0xa5; 300_000]).unwrap();
    let bytes = handle.receive_boxed().unwrap();
    assert!(bytes.iter().all(|&b| b == 0xa5));
    handle.wait().unwrap();
}

/// The result waits in the channel until the parent asks for it
#[test]
fn test_result_collected_after_deadline_span() {
    const WORDS: usize = 16 * 1024;
    let mut handle = ProcessHandle::<[u64; WORDS]>::new()
        .unwrap()
        .timeout(Duration::from_millis(300));
    handle.run(|| [0x5a5a_5a5a_5a5a_5a5a; WORDS]).unwrap();

    std::thread::sleep(Duration::from_secs(1));
    let words = handle.receive_boxed().unwrap();
    assert!(words.iter().all(|&w| w == 0x5a5a_5a5a_5a5a_5a5a));
    assert_eq!(handle.wait().unwrap(), ChildExit::Exited(forkchan::EXIT_SUCCESS));
}

/// A unit of work may hand the child over to another program
#[test]
fn test_program_replaced_from_unit_of_work() {
    let mut handle = ProcessHandle::<u64>::new().unwrap();
    handle
        .try_run_with(|child| {
            child
                .replace_program_image("/bin/sh", &["-c", "exit 0"])
                .map(|never| match never {})
        })
        .unwrap();

    assert!(handle.receive_result().unwrap_err().is_short_transfer());
    assert!(handle.wait().unwrap().success());
}

/// A writer that closes after part of the value yields a short transfer
#[test]
fn test_partial_write_is_short_transfer() {
    let mut channel = StreamChannel::pipe().unwrap();

    match unsafe { libc::fork() } {
        -1 => panic!("fork failed: {}", std::io::Error::last_os_error()),
        0 => {
            let status = match channel
                .initialize(Role::Producer)
                .and_then(|_| channel.send_bytes(&[1, 2, 3], None))
                .and_then(|_| channel.finalize())
            {
                Ok(()) => 0,
                Err(_) => 1,
            };
            unsafe { libc::_exit(status) }
        }
        pid => {
            channel.initialize(Role::Consumer).unwrap();
            let result = channel.receive_timeout::<u64>(Duration::from_secs(5));
            assert!(matches!(
                result,
                Err(ChannelError::ShortTransfer {
                    received: 3,
                    expected: 8
                })
            ));
            channel.finalize().unwrap();

            let mut status = 0;
            assert_eq!(unsafe { libc::waitpid(pid, &mut status, 0) }, pid);
        }
    }
}

/// A child that dies without sending leaves the parent with a short transfer
#[test]
fn test_child_exit_without_result() {
    let mut handle = ProcessHandle::<u64>::new().unwrap();
    handle.run_program("/bin/sh", &["-c", "exit 0"]).unwrap();
    let err = handle.receive_result().unwrap_err();
    assert!(err.is_short_transfer());
    assert_eq!(handle.wait().unwrap(), ChildExit::Exited(0));
}

/// Child-side failures surface as errors in the parent
#[test]
fn test_child_failure_reported() {
    let mut handle = ProcessHandle::<u8>::new().unwrap();
    handle.try_run(|| Err::<u8, _>("no value")).unwrap();
    match handle.receive_result() {
        Err(ProcessError::ChildFailed { kind, .. }) => assert_eq!(kind, FailureKind::Error),
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(handle.wait().unwrap().code(), Some(forkchan::EXIT_WORK_FAILED));
}

/// Teardown after a completed exchange is harmless
#[test]
fn test_teardown_is_idempotent() {
    let mut handle = ProcessHandle::<u16>::new().unwrap();
    handle.run(|| 7).unwrap();
    assert_eq!(handle.receive_result().unwrap(), 7);
    assert!(handle.receive_result().unwrap_err().is_invalid_state());
    handle.wait().unwrap();
    handle.wait().unwrap();
    drop(handle);

    let (mut producer, mut consumer) = StreamChannel::pipe().unwrap().split().unwrap();
    producer.finalize().unwrap();
    producer.finalize().unwrap();
    consumer.finalize().unwrap();
    consumer.finalize().unwrap();
}

/// Each side may only move data in its own direction
#[test]
fn test_role_exclusivity() {
    let (mut producer, mut consumer) = StreamChannel::pipe().unwrap().split().unwrap();
    assert!(matches!(
        producer.receive::<u32>(),
        Err(ChannelError::InvalidState(_))
    ));
    assert!(matches!(
        consumer.send(&1u32),
        Err(ChannelError::InvalidState(_))
    ));
    assert!(matches!(
        producer.initialize(Role::Consumer),
        Err(ChannelError::InvalidState(_))
    ));

    producer.send(&9u32).unwrap();
    assert_eq!(consumer.receive::<u32>().unwrap(), 9);
}

/// A duplex exchange with a forked responder
#[test]
fn test_duplex_with_child() {
    let mut duplex = Duplex::open(Transport::Pipe).unwrap();

    match unsafe { libc::fork() } {
        -1 => panic!("fork failed: {}", std::io::Error::last_os_error()),
        0 => {
            let result = (|| -> Result<(), ChannelError> {
                duplex.initialize(Side::Responder)?;
                let request: u32 = duplex.inbound()?.receive()?;
                duplex.outbound()?.send(&(request + 1))?;
                duplex.finalize()
            })();
            unsafe { libc::_exit(if result.is_ok() { 0 } else { 1 }) }
        }
        pid => {
            duplex.initialize(Side::Requester).unwrap();
            duplex.outbound().unwrap().send(&41u32).unwrap();
            let response: u32 = duplex
                .inbound()
                .unwrap()
                .receive_timeout(Duration::from_secs(5))
                .unwrap();
            assert_eq!(response, 42);
            duplex.finalize().unwrap();

            let mut status = 0;
            assert_eq!(unsafe { libc::waitpid(pid, &mut status, 0) }, pid);
            assert!(libc::WIFEXITED(status));
            assert_eq!(libc::WEXITSTATUS(status), 0);
        }
    }
}
