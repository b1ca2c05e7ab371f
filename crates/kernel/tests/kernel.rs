mod utils;

use std::{collections::HashMap, time::Duration};

use cellrun_kernel::{
    kernel, message, transport, ClientError, EngineState, KernelConfig, OutputEvent, Request,
    RequestId, WorkerMessage,
};
use googletest::prelude::*;
use mock_repl::{start_mock, start_mock_with, MockRepl};
use tokio::time::timeout;
use utils::{enames, run, stdout, wait_for_execution};

#[googletest::test]
#[tokio::test]
async fn assignment_produces_no_output() {
    let (client, _handle, _probe) = start_mock();

    expect_that!(run(&client, "a = 5").await, empty());
}

#[googletest::test]
#[tokio::test]
async fn print_streams_to_stdout() {
    let (client, _handle, _probe) = start_mock();

    expect_that!(run(&client, "print(1)").await, elements_are![eq(stdout("1\n"))]);
}

#[googletest::test]
#[tokio::test]
async fn raised_exception_is_reported_as_error_event() {
    let (client, _handle, _probe) = start_mock();

    let outputs = run(&client, "raise NameError('b')").await;

    expect_that!(
        outputs,
        elements_are![eq(OutputEvent::Error {
            ename: "NameError".to_string(),
            evalue: "b".to_string(),
            traceback: vec![
                "Traceback (most recent call last):".to_string(),
                "NameError: b".to_string(),
            ],
        })]
    );
}

#[googletest::test]
#[tokio::test]
async fn undefined_name_does_not_break_the_kernel() {
    let (client, _handle, _probe) = start_mock();

    let failed = run(&client, "print(b)").await;
    let recovered = run(&client, "b = 2; print(b)").await;

    expect_that!(enames(&failed), elements_are![eq("NameError")]);
    expect_that!(recovered, elements_are![eq(stdout("2\n"))]);
}

#[googletest::test]
#[tokio::test]
async fn back_to_back_requests_run_one_after_another() {
    let (client, _handle, probe) = start_mock();

    let first = client.submit("sleep(30)\na = 1").await.unwrap();
    let second = client.submit("print(a)").await.unwrap();

    let second_outputs = second.collect().await.unwrap();
    let first_outputs = first.collect().await.unwrap();

    expect_that!(first_outputs, empty());
    expect_that!(second_outputs, elements_are![eq(stdout("1\n"))]);
    expect_that!(probe.max_active(), eq(1));
}

#[googletest::test]
#[tokio::test]
async fn concurrent_submissions_never_overlap_and_keep_submission_order() {
    let (client, _handle, probe) = start_mock();

    let mut executions = Vec::new();
    for n in 0..8 {
        let execution = client.submit(format!("sleep(2); print({n})")).await.unwrap();
        executions.push(execution);
    }

    for (n, execution) in executions.into_iter().enumerate() {
        expect_that!(
            execution.collect().await.unwrap(),
            elements_are![eq(stdout(&format!("{n}\n")))]
        );
    }

    let expected: Vec<String> = (0..8).map(|n| format!("sleep(2); print({n})")).collect();
    expect_that!(probe.max_active(), eq(1));
    expect_that!(probe.executed(), eq(expected));
}

#[googletest::test]
#[tokio::test]
async fn every_request_ends_with_exactly_one_done_on_the_wire() {
    let (mut caller, worker) = transport::channel(8);
    let (repl, _probe) = MockRepl::new();
    let _handle = kernel::launch(repl, KernelConfig::default(), worker);

    let codes = [
        "a = 5",
        "print(1); warn(2)",
        "raise ValueError('x')",
        "a",
        "echo_twice(7)",
    ];
    for (n, code) in codes.iter().enumerate() {
        let request = Request::Execute {
            id: RequestId(n as u64 + 1),
            python: code.to_string(),
        };
        caller.send(message::encode(&request).unwrap()).await.unwrap();
    }

    let mut events: HashMap<RequestId, Vec<OutputEvent>> = HashMap::new();
    let mut finished = 0;
    while finished < codes.len() {
        let frame = timeout(Duration::from_secs(5), caller.recv())
            .await
            .unwrap()
            .unwrap();
        if let WorkerMessage::Output { id, event } = message::decode(&frame).unwrap() {
            if event.is_done() {
                finished += 1;
            }
            events.entry(id).or_default().push(event);
        }
    }

    expect_that!(events.len(), eq(codes.len()));
    for sequence in events.values() {
        let count =
            |pred: fn(&OutputEvent) -> bool| sequence.iter().filter(|e| pred(e)).count();

        expect_that!(sequence.last(), some(eq(&OutputEvent::Done)));
        expect_that!(count(|e| e.is_done()), eq(1));
        expect_that!(count(|e| matches!(e, OutputEvent::ExecuteResult { .. })), le(1));
        expect_that!(count(|e| matches!(e, OutputEvent::Error { .. })), le(1));
    }
}

#[googletest::test]
#[tokio::test]
async fn requests_sent_during_initialization_are_queued() {
    let (repl, _probe) = MockRepl::new();
    let (client, handle) = cellrun_kernel::start(
        repl.with_boot_delay(Duration::from_millis(50)),
        KernelConfig::default(),
    );

    let execution = client.submit("print(1)").await.unwrap();
    expect_that!(handle.state(), not(eq(EngineState::Ready)));

    expect_that!(execution.collect().await.unwrap(), elements_are![eq(stdout("1\n"))]);
    expect_that!(client.is_ready(), eq(true));
}

#[googletest::test]
#[tokio::test]
async fn failed_initialization_is_reported_and_requests_are_answered() {
    let (repl, _probe) = MockRepl::new();
    let (client, mut handle) =
        cellrun_kernel::start(repl.failing_install("comm"), KernelConfig::default());

    let ready = client.ready().await;
    let outputs = run(&client, "print(1)").await;

    expect_that!(
        ready,
        err(pat!(ClientError::EngineFailed(contains_substring("comm"))))
    );
    expect_that!(handle.settled().await, pat!(EngineState::Failed(_)));
    expect_that!(enames(&outputs), elements_are![eq("KernelInitError")]);
}

#[googletest::test]
#[tokio::test]
async fn boot_failure_is_reported() {
    let (repl, probe) = MockRepl::new();
    let (client, _handle) =
        cellrun_kernel::start(repl.failing_boot(), KernelConfig::default());

    expect_that!(client.ready().await, err(anything()));
    expect_that!(probe.setup(), elements_are![eq("boot")]);
}

#[googletest::test]
#[tokio::test]
async fn running_request_can_be_interrupted() {
    let (client, handle, _probe) = start_mock();

    let execution = client.submit("sleep(10000)").await.unwrap();
    wait_for_execution(&handle).await;
    client.interrupt(execution.id()).await.unwrap();

    let outputs = timeout(Duration::from_secs(5), execution.collect())
        .await
        .unwrap()
        .unwrap();
    expect_that!(enames(&outputs), elements_are![eq("KeyboardInterrupt")]);

    // The lock was released, so the kernel keeps serving.
    expect_that!(run(&client, "print(3)").await, elements_are![eq(stdout("3\n"))]);
}

#[googletest::test]
#[tokio::test]
async fn queued_request_can_be_interrupted_before_it_runs() {
    let (client, handle, probe) = start_mock();

    let running = client.submit("sleep(100)").await.unwrap();
    let queued = client.submit("print(1)").await.unwrap();
    wait_for_execution(&handle).await;
    client.interrupt(queued.id()).await.unwrap();

    let queued_outputs = queued.collect().await.unwrap();
    let running_outputs = running.collect().await.unwrap();

    expect_that!(enames(&queued_outputs), elements_are![eq("KeyboardInterrupt")]);
    expect_that!(running_outputs, empty());
    expect_that!(probe.executed(), elements_are![eq("sleep(100)")]);
}

#[googletest::test]
#[tokio::test]
async fn execution_timeout_stops_a_runaway_request() {
    let config = KernelConfig {
        execution_timeout_ms: Some(20),
        ..KernelConfig::default()
    };
    let (client, _handle, _probe) = start_mock_with(config);

    let outputs = run(&client, "sleep(10000)").await;

    expect_that!(enames(&outputs), elements_are![eq("TimeoutError")]);
    expect_that!(run(&client, "print(2)").await, elements_are![eq(stdout("2\n"))]);
}

#[googletest::test]
#[tokio::test]
async fn caller_timeout_interrupts_the_request() {
    let (client, _handle, _probe) = start_mock();

    let result = client
        .execute_with_timeout("sleep(10000)", Duration::from_millis(20), |_| {})
        .await;

    expect_that!(result, err(pat!(ClientError::TimedOut(_))));
    expect_that!(run(&client, "print(4)").await, elements_are![eq(stdout("4\n"))]);
}

#[googletest::test]
#[tokio::test]
async fn interpreter_fault_is_reported_as_error_event() {
    let (client, _handle, _probe) = start_mock();

    let outputs = run(&client, "fault").await;

    expect_that!(enames(&outputs), elements_are![eq("InterpreterError")]);
    expect_that!(run(&client, "print(5)").await, elements_are![eq(stdout("5\n"))]);
}

#[googletest::test]
#[tokio::test]
async fn panicking_interpreter_still_finishes_the_request() {
    let (client, handle, _probe) = start_mock();

    let outputs = run(&client, "print(1); panic").await;

    expect_that!(outputs.first(), some(eq(&stdout("1\n"))));
    expect_that!(enames(&outputs), elements_are![eq("InterpreterError")]);
    let mut state = handle.watch_state();
    let ready = timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == EngineState::Ready),
    )
    .await
    .is_ok();
    expect_that!(ready, eq(true));
    expect_that!(run(&client, "print(6)").await, elements_are![eq(stdout("6\n"))]);
}

#[googletest::test]
#[tokio::test]
async fn execute_forwards_outputs_to_the_callback() {
    let (client, _handle, _probe) = start_mock();
    let mut seen = Vec::new();

    let id = client
        .execute("print(1); warn(2)", |event| seen.push(event))
        .await
        .unwrap();

    expect_that!(id, eq(RequestId(1)));
    expect_that!(seen.len(), eq(2));
    expect_that!(seen[0], eq(stdout("1\n")));
}

#[googletest::test]
#[tokio::test]
async fn engine_returns_to_ready_after_each_request() {
    let (client, handle, _probe) = start_mock();

    run(&client, "print(1)").await;

    // `done` is posted just before the lock is released.
    let mut state = handle.watch_state();
    let settled = timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == EngineState::Ready),
    )
    .await
    .is_ok();
    expect_that!(settled, eq(true));
    expect_that!(handle.state(), eq(EngineState::Ready));
}
