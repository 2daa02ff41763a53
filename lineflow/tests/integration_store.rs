//! Integration tests for the store side: stream provisioning, continuous
//! query workers, and line-atomic output shared between workers.

mod common;

use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use common::MockStore;
use lineflow::error::{LineflowError, QueryError, StoreError};
use lineflow::provision::recreate_streams;
use lineflow::{ContinuousQuery, QueryWorker, StoreClient, StreamConfig, SyncOutput};

#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SharedBuffer {
    fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

fn query(name: &str, sql: &str) -> ContinuousQuery {
    ContinuousQuery {
        name: name.to_string(),
        sql: sql.to_string(),
    }
}

fn rate_rows(direction: &str, count: usize) -> String {
    (0..count)
        .map(|i| {
            format!(
                "{{\"measurement\":\"network_throughput\",\"tags\":{{\"direction\":\"{direction}\",\"host\":\"a\"}},\"fields\":{{\"bytes_per_second\":\"{i}.5\"}},\"timestamp\":\"{}\"}}\n",
                (i + 1) * 1_000_000_000
            )
        })
        .collect()
}

#[test]
fn test_provision_sends_ddl_in_order() {
    let store = MockStore::answering(200, "");
    let control = StoreClient::for_control(store.url("/"), Duration::from_secs(2)).unwrap();
    let streams = StreamConfig::new([("cpu", vec!["host", "cpu"])]).unwrap();

    assert_eq!(recreate_streams(&control, &streams).unwrap(), 1);

    let requests = store.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests.iter().all(|r| r.method == "POST" && r.path == "/"));
    assert_eq!(requests[0].body, "DROP STREAM IF EXISTS `cpu`");
    assert!(requests[1].body.starts_with("CREATE STREAM `cpu` (`host` string, `cpu` string,"));
    assert!(requests[1].body.contains("PRIMARY KEY (`host`, `cpu`)"));
    assert!(requests[1].body.contains("mode = 'versioned_kv'"));
}

#[test]
fn test_provision_rejection_aborts() {
    let store = MockStore::answering(400, "Code: 62. Syntax error");
    let control = StoreClient::for_control(store.url("/"), Duration::from_secs(2)).unwrap();

    let err = recreate_streams(&control, &StreamConfig::default()).unwrap_err();
    assert!(matches!(
        err,
        LineflowError::Store(StoreError::Rejected { status: 400, .. })
    ));
    assert_eq!(store.requests().len(), 1);
}

#[test]
fn test_worker_forwards_rows_until_stream_ends() {
    let store = MockStore::answering(200, &rate_rows("receive", 3));
    let buffer = SharedBuffer::default();
    let worker = QueryWorker::new(
        query("network_throughput.receive", "SELECT 1"),
        store.url("/"),
        SyncOutput::new(buffer.clone()),
    );

    let err = worker.run().unwrap_err();
    assert!(matches!(
        err,
        LineflowError::Query(QueryError::StreamEnded { rows: 3 })
    ));

    let output = buffer.contents();
    let lines: Vec<&str> = output.lines().collect();
    assert_eq!(
        lines,
        vec![
            "network_throughput,direction=receive,host=a bytes_per_second=0.5 1000000000",
            "network_throughput,direction=receive,host=a bytes_per_second=1.5 2000000000",
            "network_throughput,direction=receive,host=a bytes_per_second=2.5 3000000000",
        ]
    );

    let requests = store.requests();
    assert_eq!(requests[0].body, "SELECT 1 FORMAT JSONEachRow");
}

#[test]
fn test_worker_refused_query() {
    let store = MockStore::answering(500, "Code: 60. Unknown stream 'net'");
    let worker = QueryWorker::new(
        query("network_throughput.receive", "SELECT 1"),
        store.url("/"),
        SyncOutput::new(io::sink()),
    );

    let err = worker.run().unwrap_err();
    assert!(matches!(
        err,
        LineflowError::Query(QueryError::Refused { status: 500, ref body }) if body.contains("Unknown stream")
    ));
}

#[test]
fn test_worker_bad_row_is_fatal() {
    let store = MockStore::answering(200, "{\"measurement\":\"m\"}\n");
    let buffer = SharedBuffer::default();
    let worker = QueryWorker::new(
        query("power.total", "SELECT 1"),
        store.url("/"),
        SyncOutput::new(buffer.clone()),
    );

    let err = worker.run().unwrap_err();
    assert!(matches!(err, LineflowError::Query(QueryError::BadRow { .. })));
    assert!(buffer.contents().is_empty());
}

#[test]
fn test_concurrent_workers_write_whole_lines() {
    let store = MockStore::start(|request| {
        let direction = if request.body.contains("transmit") {
            "transmit"
        } else {
            "receive"
        };
        (200, rate_rows(direction, 500))
    });

    let buffer = SharedBuffer::default();
    let output = SyncOutput::new(buffer.clone());

    let handles: Vec<_> = ["receive", "transmit"]
        .into_iter()
        .map(|direction| {
            let worker = QueryWorker::new(
                query(
                    &format!("network_throughput.{direction}"),
                    &format!("SELECT '{direction}'"),
                ),
                store.url("/"),
                output.clone(),
            );
            thread::spawn(move || worker.run())
        })
        .collect();

    for handle in handles {
        let err = handle.join().unwrap().unwrap_err();
        assert!(matches!(
            err,
            LineflowError::Query(QueryError::StreamEnded { rows: 500 })
        ));
    }

    let output = buffer.contents();
    let lines: Vec<&str> = output.lines().collect();
    assert_eq!(lines.len(), 1000);
    for line in lines {
        let decoded: lineflow::MetricRecord = line.parse().unwrap();
        assert_eq!(decoded.measurement, "network_throughput");
        assert_eq!(decoded.tags.len(), 2);
        assert_eq!(decoded.fields.len(), 1);
    }
}
