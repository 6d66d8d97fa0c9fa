//! Integration tests for the asynchronous kernel loop.

use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::timeout;

use tessera_core::execute::{CellError, RunStatus};
use tessera_core::graph::{CellId, CellStatus};
use tessera_core::runtime::Value;
use tessera_kernel::{Kernel, KernelConfig, KernelMessage, Request, RequestId};

const WAIT: Duration = Duration::from_secs(10);

/// Collect messages until `request_id` completes or is rejected.
async fn messages_until(
    rx: &mut broadcast::Receiver<KernelMessage>,
    request_id: RequestId,
) -> Vec<KernelMessage> {
    let mut messages = Vec::new();
    loop {
        let message = timeout(WAIT, rx.recv())
            .await
            .expect("Timed out waiting for kernel")
            .expect("Kernel channel closed");
        let done = message.completes(request_id);
        messages.push(message);
        if done {
            return messages;
        }
    }
}

fn edit(cell_id: &str, source: &str) -> Request {
    Request::SubmitEdit {
        cell_id: CellId::from(cell_id),
        source: source.to_string(),
        disabled: None,
    }
}

fn result_of(
    messages: &[KernelMessage],
    cell_id: &str,
) -> Option<(RunStatus, Option<Value>)> {
    messages.iter().rev().find_map(|m| match m {
        KernelMessage::CellResult(r) if r.cell_id.as_str() == cell_id => {
            Some((r.status, r.output.clone()))
        }
        _ => None,
    })
}

#[tokio::test]
async fn test_results_stream_in_execution_order() {
    let kernel = Kernel::spawn(KernelConfig::default());
    let mut rx = kernel.subscribe();

    kernel.submit(edit("a", "let x = 1;")).unwrap();
    kernel.submit(edit("b", "let y = x + 1;")).unwrap();
    let last = kernel.submit(edit("c", "y * 10")).unwrap();
    messages_until(&mut rx, last).await;

    let request = kernel.submit(edit("a", "let x = 4;")).unwrap();
    let messages = messages_until(&mut rx, request).await;

    let finished: Vec<&str> = messages
        .iter()
        .filter_map(|m| match m {
            KernelMessage::CellResult(r) => Some(r.cell_id.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(finished, vec!["a", "b", "c"]);
    assert_eq!(
        result_of(&messages, "c"),
        Some((RunStatus::Ok, Some(Value::Int(50))))
    );

    // Every cell is queued before the first one starts.
    let first_start = messages
        .iter()
        .position(|m| matches!(m, KernelMessage::CellStarted { .. }))
        .unwrap();
    let queued = messages[..first_start]
        .iter()
        .filter(|m| matches!(m, KernelMessage::CellQueued { .. }))
        .count();
    assert_eq!(queued, 3);

    kernel.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_interrupt_reaches_running_cell() {
    let kernel = Kernel::spawn(KernelConfig::default());
    let mut rx = kernel.subscribe();

    kernel.submit(edit("a", "let x = 1;")).unwrap();
    kernel.submit(edit("c", "let z = n;")).unwrap();
    let spin = kernel
        .submit(edit("b", "let mut n = x;\nloop { n += 1; }"))
        .unwrap();
    let after = kernel.submit(Request::GetState).unwrap();

    loop {
        let message = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        if matches!(&message, KernelMessage::CellStarted { cell_id } if cell_id.as_str() == "b") {
            break;
        }
    }
    // The cell may not have entered the slot yet.
    while !kernel.interrupt() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let messages = messages_until(&mut rx, spin).await;
    assert_eq!(
        result_of(&messages, "b").map(|(status, _)| status),
        Some(RunStatus::Interrupted)
    );
    assert_eq!(
        result_of(&messages, "c").map(|(status, _)| status),
        Some(RunStatus::Cancelled)
    );

    // Requests queued behind the interrupted plan still run.
    let messages = messages_until(&mut rx, after).await;
    let (cells, namespace) = messages
        .iter()
        .find_map(|m| match m {
            KernelMessage::State { cells, namespace } => Some((cells, namespace)),
            _ => None,
        })
        .expect("No state message");
    let b = cells.iter().find(|c| c.cell_id.as_str() == "b").unwrap();
    assert_eq!(b.status, CellStatus::Errored);
    assert_eq!(b.error, Some(CellError::Interrupted));
    assert_eq!(namespace.get("x"), Some(&Value::Int(1)));
    assert!(!namespace.contains_key("n"));

    kernel.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_idle_interrupt_is_acknowledged() {
    let kernel = Kernel::spawn(KernelConfig::default());
    let mut rx = kernel.subscribe();

    let request = kernel.submit(Request::Interrupt).unwrap();
    let messages = messages_until(&mut rx, request).await;

    assert_eq!(
        messages,
        vec![KernelMessage::RequestCompleted {
            request_id: request
        }]
    );
    kernel.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_rejected_request_leaves_session_running() {
    let kernel = Kernel::spawn(KernelConfig::default());
    let mut rx = kernel.subscribe();

    let bad = kernel
        .submit(Request::RunCells {
            cell_ids: vec![CellId::from("missing")],
        })
        .unwrap();
    let messages = messages_until(&mut rx, bad).await;
    match messages.as_slice() {
        [KernelMessage::RequestRejected { request_id, error }] => {
            assert_eq!(*request_id, bad);
            assert!(error.contains("missing"));
        }
        other => panic!("expected a rejection, got {:?}", other),
    }

    let good = kernel.submit(edit("a", "1 + 1")).unwrap();
    let messages = messages_until(&mut rx, good).await;
    assert_eq!(
        result_of(&messages, "a"),
        Some((RunStatus::Ok, Some(Value::Int(2))))
    );

    kernel.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_later_run_sees_intervening_edit() {
    let kernel = Kernel::spawn(KernelConfig::default());
    let mut rx = kernel.subscribe();

    kernel.submit(edit("a", "let x = 1;")).unwrap();
    kernel.submit(edit("b", "x + 1")).unwrap();
    kernel.submit(edit("b", "x + 100")).unwrap();
    let run = kernel
        .submit(Request::RunCells {
            cell_ids: vec![CellId::from("a")],
        })
        .unwrap();

    let messages = messages_until(&mut rx, run).await;
    assert_eq!(
        result_of(&messages, "b"),
        Some((RunStatus::Ok, Some(Value::Int(101))))
    );
    kernel.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_drains_queue() {
    let kernel = Kernel::spawn(KernelConfig::default());
    let mut rx = kernel.subscribe();

    let ids: Vec<RequestId> = (0..5)
        .map(|i| {
            let request = edit(&format!("c{i}"), &format!("let v{i} = {i};"));
            kernel.submit(request).unwrap()
        })
        .collect();
    kernel.shutdown().await.unwrap();

    let mut completed = Vec::new();
    while let Ok(message) = rx.try_recv() {
        if let KernelMessage::RequestCompleted { request_id } = message {
            completed.push(request_id);
        }
    }
    assert_eq!(completed, ids);
}

#[tokio::test]
async fn test_stream_survives_slow_reader() {
    const CELLS: usize = 200;
    let kernel = Kernel::spawn(KernelConfig {
        channel_capacity: 4,
        ..KernelConfig::default()
    });
    let mut stream = kernel.stream();

    kernel.submit(edit("c0", "let v0 = 0;")).unwrap();
    for i in 1..CELLS {
        let source = format!("let v{i} = v{} + 1;", i - 1);
        kernel.submit(edit(&format!("c{i}"), &source)).unwrap();
    }
    kernel.submit(edit("c0", "let v0 = 1;")).unwrap();
    kernel.shutdown().await.unwrap();

    let mut messages = Vec::new();
    while let Some(message) = timeout(WAIT, stream.recv()).await.unwrap() {
        messages.push(message);
    }

    let queued = messages
        .iter()
        .filter(|m| matches!(m, KernelMessage::CellQueued { .. }))
        .count();
    let results = messages
        .iter()
        .filter(|m| matches!(m, KernelMessage::CellResult(_)))
        .count();
    let completed = messages
        .iter()
        .filter(|m| matches!(m, KernelMessage::RequestCompleted { .. }))
        .count();
    assert_eq!(queued, 2 * CELLS);
    assert_eq!(results, 2 * CELLS);
    assert_eq!(completed, CELLS + 1);
    assert_eq!(
        result_of(&messages, &format!("c{}", CELLS - 1)),
        Some((RunStatus::Ok, Some(Value::Int(CELLS as i64))))
    );
}
