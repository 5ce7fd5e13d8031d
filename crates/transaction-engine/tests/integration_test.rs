// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod common;

use std::collections::HashMap;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use common::helpers::{call, dt_config, harness};
use transaction_engine::config::Config;
use transaction_engine::context::in_async_flow;
use transaction_engine::health::{SupportabilityMetric, TRANSACTION_GARBAGE_COLLECTED};
use transaction_engine::name::{FreezeReason, TransactionName, TransactionNamePriority};
use transaction_engine::propagation::carrier::{extract, inject};
use transaction_engine::propagation::distributed_trace::TransportType;
use transaction_engine::segment::data::{ConnectionInfo, ParsedStatement};
use transaction_engine::snapshot::combine_siblings;
use transaction_engine::transform::ChannelTransformer;
use transaction_engine::{ExecutionContext, TransactionService};

fn web_name() -> TransactionName {
    TransactionName::web("MVC", "Orders/Show")
}

#[test]
fn test_abandoned_transaction_is_estimated_and_reported_once() {
    let h = harness(Config::default());
    let ctx = ExecutionContext::detached();

    let tx = h.service.get_or_create(&ctx, web_name(), |_| {}, true);
    let root = tx
        .start_custom_segment(&ctx, call("OrdersController", "Show"), "root")
        .unwrap();
    h.clock.advance(Duration::from_millis(100));
    let child = tx
        .start_custom_segment(&ctx, call("OrderRepository", "Load"), "child")
        .unwrap();
    h.clock.advance(Duration::from_millis(400));
    root.end(&ctx);

    h.service.remove_outstanding_internal_transactions(&ctx, true, true);
    drop(child);
    drop(root);
    drop(tx);

    let finished = h.transformer.take();
    assert_eq!(finished.len(), 1);
    let abandoned = &finished[0];
    assert!(abandoned.abandoned);
    assert!(abandoned.duration >= Duration::from_millis(500));
    assert!(abandoned
        .find_segment("Custom/child")
        .is_some_and(|segment| segment.unfinished));

    assert_eq!(h.health.counters.count(TRANSACTION_GARBAGE_COLLECTED), 1);
    let events = h.health.garbage_collected();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].transaction_name, "WebTransaction/MVC/Orders/Show");
    assert_eq!(events[0].last_started_segment, "Custom/child");
    assert_eq!(events[0].last_finished_segment, "Custom/root");
}

#[test]
fn test_finish_exactly_once_across_threads() {
    let h = harness(Config::default());
    let ctx = ExecutionContext::detached();
    let tx = h.service.get_or_create(&ctx, web_name(), |_| {}, true);

    let barrier = Arc::new(Barrier::new(8));
    let workers: Vec<_> = (0..8)
        .map(|_| {
            let tx = tx.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                tx.end(&ExecutionContext::current());
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert!(tx.is_finished());
    assert_eq!(h.transformer.take().len(), 1);
    drop(tx);
    assert_eq!(h.health.counters.count(TRANSACTION_GARBAGE_COLLECTED), 0);
}

#[test]
fn test_thread_exit_abandons_unended_transaction() {
    let h = Arc::new(harness(Config::default()));
    let worker = {
        let h = Arc::clone(&h);
        thread::spawn(move || {
            let ctx = ExecutionContext::current();
            let tx = h.service.get_or_create(&ctx, web_name(), |_| {}, true);
            let segment = tx
                .start_custom_segment(&ctx, call("Worker", "Run"), "work")
                .unwrap();
            h.clock.advance(Duration::from_millis(20));
            segment.end(&ctx);
            tx.guid().to_string()
        })
    };
    let guid = worker.join().unwrap();

    let finished = h.transformer.take();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].guid, guid);
    assert!(finished[0].abandoned);
    assert_eq!(finished[0].duration, Duration::from_millis(20));
    assert_eq!(h.health.garbage_collected().len(), 1);
}

#[tokio::test]
async fn test_finished_flows_abandon_attached_transactions() {
    let h = harness(Config::default());
    for _ in 0..50 {
        in_async_flow(async {
            let ctx = ExecutionContext::current();
            let tx = h.service.get_or_create(&ctx, web_name(), |_| {}, true);
            assert!(tx.attach_to_async(&ctx));
            tx.detach_from_primary(&ctx);
            tokio::task::yield_now().await;
            assert!(h.service.current(&ExecutionContext::current()).is_some());
        })
        .await;
    }

    assert_eq!(h.health.garbage_collected().len(), 50);
    assert_eq!(h.transformer.take().len(), 50);
    assert!(h.service.current(&ExecutionContext::current()).is_none());
}

#[test]
fn test_unit_of_work_gating() {
    let h = harness(Config::default());
    let ctx = ExecutionContext::detached();
    let tx = h.service.get_or_create(&ctx, web_name(), |_| {}, true);

    tx.notice_unit_of_work_begins();
    tx.end(&ctx);
    assert!(!tx.is_finished());
    assert!(h.transformer.take().is_empty());

    tx.notice_unit_of_work_ends();
    tx.end(&ctx);
    assert!(tx.is_finished());
    assert_eq!(h.transformer.take().len(), 1);
}

#[test]
fn test_finished_transactions_leave_every_context() {
    let h = harness(Config::default());
    let ctx = ExecutionContext::detached();
    let flow = ctx.with_new_flow();
    let tx = h.service.get_or_create(&ctx, web_name(), |_| {}, true);
    assert!(h.service.set_transaction_on_async_context(&flow, &tx));

    tx.end(&ExecutionContext::detached());
    assert!(h.service.current(&ctx).is_none());
    assert!(h.service.current(&flow.on_other_thread()).is_none());
}

#[test]
fn test_cat_loop_guard_keeps_first_referrer() {
    let first_caller = harness(Config {
        cross_process_id: Some("1#100".to_string()),
        ..Config::default()
    });
    let second_caller = harness(Config {
        cross_process_id: Some("1#200".to_string()),
        ..Config::default()
    });
    let callee = harness(Config {
        cross_process_id: Some("1#300".to_string()),
        trusted_account_ids: vec![1],
        ..Config::default()
    });

    let outbound = |h: &common::helpers::Harness| {
        let tx = h
            .service
            .get_or_create(&ExecutionContext::detached(), web_name(), |_| {}, true);
        let mut headers: HashMap<String, String> = HashMap::new();
        for (key, value) in tx.request_metadata() {
            inject(&mut headers, key, value);
        }
        (tx, headers)
    };
    let (first_tx, first_headers) = outbound(&first_caller);
    let (_, second_headers) = outbound(&second_caller);

    let ctx = ExecutionContext::detached();
    let tx = callee.service.get_or_create(&ctx, web_name(), |_| {}, true);
    assert!(tx.accept_cross_application_request(&first_headers, extract));
    assert!(!tx.accept_cross_application_request(&second_headers, extract));

    let metadata = tx.metadata();
    assert_eq!(
        metadata.cross_application_referrer_process_id.as_deref(),
        Some("1#100")
    );
    assert_eq!(
        metadata.cross_application_referrer_transaction_guid.as_deref(),
        Some(first_tx.guid())
    );
    assert_eq!(
        callee
            .health
            .count(SupportabilityMetric::CatRequestAcceptMultipleAttempts),
        1
    );
    assert_eq!(
        callee
            .health
            .count(SupportabilityMetric::CatRequestAcceptSuccess),
        1
    );
}

#[test]
fn test_untrusted_cat_request_is_ignored() {
    let caller = harness(Config {
        cross_process_id: Some("7#100".to_string()),
        ..Config::default()
    });
    let callee = harness(Config {
        trusted_account_ids: vec![1],
        ..Config::default()
    });

    let caller_tx = caller
        .service
        .get_or_create(&ExecutionContext::detached(), web_name(), |_| {}, true);
    let mut headers: HashMap<String, String> = HashMap::new();
    for (key, value) in caller_tx.request_metadata() {
        inject(&mut headers, key, value);
    }

    let tx = callee
        .service
        .get_or_create(&ExecutionContext::detached(), web_name(), |_| {}, true);
    assert!(!tx.accept_cross_application_request(&headers, extract));
    assert!(tx.metadata().cross_application_referrer_process_id.is_none());
    assert_eq!(
        callee
            .health
            .count(SupportabilityMetric::CatRequestAcceptNotTrusted),
        1
    );
}

#[test]
fn test_name_precedence() {
    let h = harness(Config::default());
    let ctx = ExecutionContext::detached();
    let tx = h.service.get_or_create(&ctx, TransactionName::uri("/orders/42?x=1"), |_| {}, true);
    assert_eq!(tx.metric_name(), "WebTransaction/Uri/orders/42");

    assert!(tx.try_set_name(
        TransactionName::web("Route", "orders/{id}"),
        TransactionNamePriority::Route
    ));
    assert!(!tx.try_set_name(
        TransactionName::web("Handler", "OrdersHandler"),
        TransactionNamePriority::Handler
    ));
    assert!(tx.try_set_name(
        TransactionName::web("Route", "orders/{id}/show"),
        TransactionNamePriority::Route
    ));

    tx.freeze_name(FreezeReason::ManualBrowserScriptInjection);
    assert!(!tx.try_set_name(
        TransactionName::custom(true, "Checkout"),
        TransactionNamePriority::UserTransactionName
    ));

    tx.end(&ctx);
    let finished = h.transformer.take();
    assert_eq!(finished[0].metric_name, "WebTransaction/Route/orders/{id}/show");
}

#[test]
fn test_combinable_siblings_are_merged_once() {
    let h = harness(Config::default());
    let ctx = ExecutionContext::detached();
    let tx = h.service.get_or_create(&ctx, web_name(), |_| {}, true);
    let root = tx
        .start_custom_segment(&ctx, call("OrdersController", "Show"), "root")
        .unwrap();

    for row in 0..3u64 {
        let query = tx
            .start_datastore_segment(
                &ctx,
                call("DbCommand", "ExecuteReader"),
                ParsedStatement {
                    vendor: "MySQL".to_string(),
                    operation: "select".to_string(),
                    model: Some("orders".to_string()),
                },
                Some("SELECT * FROM orders WHERE id = ?"),
                ConnectionInfo::default(),
            )
            .unwrap();
        query.make_combinable();
        query.add_custom_attribute("row", i64::try_from(row).unwrap());
        h.clock.advance(Duration::from_millis(10 * (row + 1)));
        query.end(&ctx);
    }
    root.end(&ctx);
    tx.end(&ctx);

    let finished = h.transformer.take();
    let root = &finished[0].segments[0];
    assert_eq!(root.children.len(), 1);
    let combined = &root.children[0];
    assert_eq!(combined.name, "Datastore/statement/MySQL/orders/select");
    assert_eq!(combined.call_count, 3);
    assert_eq!(combined.duration, Some(Duration::from_millis(60)));
    assert_eq!(combined.id, 1);
    assert_eq!(
        combined.attributes["row"],
        transaction_engine::metadata::AttributeValue::Int(0)
    );
    assert_eq!(root.exclusive_duration, Some(Duration::ZERO));

    assert_eq!(combine_siblings(root.children.clone()), root.children);
}

#[test]
fn test_parent_ids_survive_snapshot() {
    let h = harness(Config::default());
    let ctx = ExecutionContext::detached();
    let tx = h.service.get_or_create(&ctx, web_name(), |_| {}, true);

    let root = tx.start_method_segment(&ctx, call("A", "root")).unwrap();
    let left = tx.start_method_segment(&ctx, call("A", "left")).unwrap();
    let leaf = tx.start_method_segment(&ctx, call("A", "leaf")).unwrap();
    leaf.end(&ctx);
    left.end(&ctx);
    let right = tx.start_method_segment(&ctx, call("A", "right")).unwrap();
    right.end(&ctx);
    root.end(&ctx);
    tx.end(&ctx);

    let finished = h.transformer.take();
    let expected = [
        (root.id(), None),
        (left.id(), root.id()),
        (leaf.id(), left.id()),
        (right.id(), root.id()),
    ];
    for (id, parent_id) in expected {
        let segment = finished[0]
            .all_segments()
            .into_iter()
            .find(|segment| Some(segment.id) == id)
            .unwrap();
        assert_eq!(segment.parent_id, parent_id);
    }
}

#[tokio::test]
async fn test_channel_transformer_delivers_finished_transactions() {
    let (transformer, mut rx) = ChannelTransformer::new();
    let service = TransactionService::builder(Config::default())
        .transformer(Arc::new(transformer))
        .build();
    let ctx = ExecutionContext::detached();
    let tx = service.get_or_create(&ctx, web_name(), |_| {}, true);
    let guid = tx.guid().to_string();
    tx.end(&ctx);

    let received = rx.recv().await.unwrap();
    assert_eq!(received.guid, guid);
    assert!(!received.abandoned);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_off_thread_transform_runs_on_runtime() {
    let (transformer, mut rx) = ChannelTransformer::new();
    let service = TransactionService::builder(Config {
        complete_transactions_on_thread: false,
        ..Config::default()
    })
    .transformer(Arc::new(transformer))
    .build();
    let ctx = ExecutionContext::detached();
    let tx = service.get_or_create(&ctx, web_name(), |_| {}, true);
    tx.end(&ctx);

    let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.guid, tx.guid());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_transaction_follows_async_flow() {
    let h = harness(Config::default());

    let (root_id, child_parent) = in_async_flow(async {
        let ctx = ExecutionContext::current();
        let tx = h.service.get_or_create(&ctx, web_name(), |_| {}, true);
        let root = tx
            .start_custom_segment(&ctx, call("OrdersController", "ShowAsync"), "root")
            .unwrap();
        assert!(tx.attach_to_async(&ctx));
        tx.detach_from_primary(&ctx);

        tokio::task::yield_now().await;

        let resumed = ExecutionContext::current();
        let found = h.service.current(&resumed).unwrap();
        assert!(found.ptr_eq(&tx));
        let child = found
            .start_custom_segment(&resumed, call("OrderRepository", "LoadAsync"), "child")
            .unwrap();
        child.end(&resumed);
        root.end(&resumed);
        let child_parent = found
            .to_snapshot()
            .find_segment("Custom/child")
            .and_then(|segment| segment.parent_id);
        tx.end(&resumed);
        (root.id(), child_parent)
    })
    .await;

    assert_eq!(child_parent, root_id);
    assert_eq!(h.transformer.take().len(), 1);
}

#[test]
fn test_distributed_trace_round_trip() {
    let upstream = harness(dt_config("33", "5043"));
    let downstream = harness(dt_config("33", "6100"));

    let ctx = ExecutionContext::detached();
    let caller = upstream.service.get_or_create(&ctx, web_name(), |_| {}, true);
    let external = caller
        .start_external_segment(&ctx, call("HttpClient", "SendAsync"), "https://api.local/orders", "GET")
        .unwrap();
    let mut headers: HashMap<String, String> = HashMap::new();
    caller.insert_distributed_trace_headers(&ctx, &mut headers, inject);
    assert!(headers.contains_key("newrelic"));
    assert!(headers["tracestate"].starts_with("33@nr=0-0-33-5043-"));

    let callee_ctx = ExecutionContext::detached();
    let callee = downstream.service.get_or_create(
        &callee_ctx,
        TransactionName::web("MVC", "Api/Orders"),
        |_| {},
        true,
    );
    assert!(callee.accept_distributed_trace_headers(&headers, extract, TransportType::Https));

    let state = callee.tracing_state().unwrap();
    assert!(state.from_trace_context);
    assert_eq!(state.transport_type, TransportType::Https);
    assert_eq!(state.parent_id, external.span_id());
    assert_eq!(state.transaction_id.as_deref(), Some(caller.guid()));
    assert_eq!(state.parent_app_id.as_deref(), Some("5043"));
    assert_eq!(callee.trace_id(), caller.trace_id());
    assert_eq!(callee.sampled(), caller.sampled());

    callee.end(&callee_ctx);
    let finished = downstream.transformer.take();
    assert_eq!(finished[0].trace_id, caller.trace_id());
    assert_eq!(
        downstream
            .health
            .count(SupportabilityMetric::TraceContextAcceptSuccess),
        1
    );
}

#[test]
fn test_newrelic_payload_only_round_trip() {
    let upstream = harness(dt_config("33", "5043"));
    let downstream = harness(dt_config("33", "6100"));

    let ctx = ExecutionContext::detached();
    let caller = upstream.service.get_or_create(&ctx, web_name(), |_| {}, true);
    let mut headers: HashMap<String, String> = HashMap::new();
    caller.insert_distributed_trace_headers(&ctx, &mut headers, inject);
    headers.remove("traceparent");
    headers.remove("tracestate");

    let callee = downstream.service.get_or_create(
        &ExecutionContext::detached(),
        TransactionName::other("Kafka", "orders"),
        |_| {},
        true,
    );
    assert!(callee.accept_distributed_trace_headers(&headers, extract, TransportType::Kafka));
    let state = callee.tracing_state().unwrap();
    assert!(!state.from_trace_context);
    assert_eq!(state.trace_id, caller.trace_id());
    assert_eq!(
        downstream
            .health
            .count(SupportabilityMetric::DistributedTraceAcceptSuccess),
        1
    );
}
