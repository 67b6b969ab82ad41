//! Stream failure cascade: a failure on the head of a claimed stream
//! releases the later rows untouched, and redelivery replays the stream in
//! order starting from the failed message.

mod common;

use common::{descriptor, new_outbox_message};
use rly_adapters::InMemoryWorkStore;
use rly_domain::{
    MessageCompletion, MessageFailure, MessageId, StatusFlags, WorkBatchRequest,
};
use rly_ports::WorkCoordinator;

fn id(s: &str) -> MessageId {
    MessageId::from_string(s.to_string())
}

#[tokio::test]
async fn failure_on_stream_head_releases_later_rows_and_replays_in_order() {
    let store = InMemoryWorkStore::new();

    // store and claim three messages of one stream
    let mut insert = WorkBatchRequest::heartbeat(descriptor("inst_a"));
    insert.new_outbox_messages = vec![
        new_outbox_message("msg_01", "stream_s", "orders"),
        new_outbox_message("msg_02", "stream_s", "orders"),
        new_outbox_message("msg_03", "stream_s", "orders"),
    ];
    let reply = store.process_work_batch(insert).await.unwrap();
    let claimed: Vec<&str> = reply.outbox.iter().map(|w| w.message_id.as_str()).collect();
    assert_eq!(claimed, vec!["msg_01", "msg_02", "msg_03"]);

    // report only the head as failed; claim nothing so the intermediate
    // state is observable
    let mut report = WorkBatchRequest::heartbeat(descriptor("inst_a"));
    report.options.batch_size = 0;
    report.outbox_failures = vec![MessageFailure::new(
        id("msg_01"),
        StatusFlags::STORED,
        "err",
    )];
    store.process_work_batch(report).await.unwrap();

    let head = store.outbox_row(&id("msg_01")).await.unwrap();
    assert!(head.status_flags.contains(StatusFlags::FAILED));
    assert_eq!(head.attempts, 1);
    assert_eq!(head.error.as_deref(), Some("err"));
    assert!(head.instance_id.is_none());

    for later in ["msg_02", "msg_03"] {
        let row = store.outbox_row(&id(later)).await.unwrap();
        assert_eq!(
            row.status_flags,
            StatusFlags::STORED,
            "cascade must not touch flags"
        );
        assert!(row.instance_id.is_none(), "cascade clears the lease");
        assert!(row.lease_expiry.is_none());
        assert_eq!(row.attempts, 0);
    }

    // redelivery replays the whole stream, failed head first
    let reply = store
        .process_work_batch(WorkBatchRequest::heartbeat(descriptor("inst_a")))
        .await
        .unwrap();
    let replay: Vec<&str> = reply.outbox.iter().map(|w| w.message_id.as_str()).collect();
    assert_eq!(replay, vec!["msg_01", "msg_02", "msg_03"]);

    // resolving the head clears the failure bits
    let mut resolve = WorkBatchRequest::heartbeat(descriptor("inst_a"));
    resolve.options.batch_size = 0;
    resolve.outbox_completions = vec![MessageCompletion::new(id("msg_01"), StatusFlags::PUBLISHED)];
    store.process_work_batch(resolve).await.unwrap();

    let head = store.outbox_row(&id("msg_01")).await.unwrap();
    assert!(head.status_flags.contains(StatusFlags::PUBLISHED));
    assert!(!head.status_flags.contains(StatusFlags::FAILED));
    assert!(!head.status_flags.contains(StatusFlags::RETRY));
}

#[tokio::test]
async fn terminal_failure_parks_the_stream_until_resolved() {
    let store = InMemoryWorkStore::new();

    let mut insert = WorkBatchRequest::heartbeat(descriptor("inst_a"));
    insert.options.batch_size = 0;
    insert.options.max_attempts = 1;
    insert.new_outbox_messages = vec![
        new_outbox_message("msg_01", "stream_s", "orders"),
        new_outbox_message("msg_02", "stream_s", "orders"),
    ];
    store.process_work_batch(insert).await.unwrap();

    // one failure at max_attempts == 1 is terminal
    let mut report = WorkBatchRequest::heartbeat(descriptor("inst_a"));
    report.options.batch_size = 0;
    report.options.max_attempts = 1;
    report.outbox_failures = vec![MessageFailure::new(
        id("msg_01"),
        StatusFlags::STORED,
        "poison",
    )];
    store.process_work_batch(report).await.unwrap();

    let head = store.outbox_row(&id("msg_01")).await.unwrap();
    assert!(head.status_flags.contains(StatusFlags::FAILED));
    assert!(!head.status_flags.contains(StatusFlags::RETRY));

    // neither the parked head nor anything behind it is claimable
    let reply = store
        .process_work_batch(WorkBatchRequest::heartbeat(descriptor("inst_a")))
        .await
        .unwrap();
    assert!(reply.outbox.is_empty());

    // an operator completion resolves the head and frees the stream
    let mut resolve = WorkBatchRequest::heartbeat(descriptor("inst_a"));
    resolve.options.batch_size = 0;
    resolve.outbox_completions = vec![MessageCompletion::new(id("msg_01"), StatusFlags::PUBLISHED)];
    store.process_work_batch(resolve).await.unwrap();

    let reply = store
        .process_work_batch(WorkBatchRequest::heartbeat(descriptor("inst_a")))
        .await
        .unwrap();
    let ids: Vec<&str> = reply.outbox.iter().map(|w| w.message_id.as_str()).collect();
    assert_eq!(ids, vec!["msg_02"]);
}
