mod common;

use common::{
    eventually, init_tracing, node, options, registration, Call, MockConnector, MockSession,
    RecordingListener,
};
use ng_driver_opcua::{
    session::Endpoint,
    types::{AttributeKind, CertificateOptions, OpcUaOptions, SecurityPolicy},
    ConnectionContext, ConnectionManager, FailureHandler, FileCertificates, ListenerRegistry,
    NoCertificates, NodeListenParams, ReadParams, Request, WriteParams,
};
use ng_gateway_sdk::{
    ChannelConfig, ChannelFlag, ChannelListener, ChannelRecord, DataType, DriverError, NGValue,
};
use opcua::types::{MessageSecurityMode, StatusCode, Variant};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

struct Fixture {
    connector: Arc<MockConnector>,
    ctx: ConnectionContext,
    failures: Arc<Mutex<Vec<DriverError>>>,
}

impl Fixture {
    fn new(options: OpcUaOptions) -> Self {
        Self::with_connector(options, MockConnector::plain())
    }

    fn with_connector(options: OpcUaOptions, connector: Arc<MockConnector>) -> Self {
        let ctx = ConnectionContext {
            connector: connector.clone(),
            options: Arc::new(options),
            certificates: Arc::new(NoCertificates),
            node_registry: ListenerRegistry::new(),
            subtree_registry: ListenerRegistry::new(),
        };
        Self {
            connector,
            ctx,
            failures: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn handler(&self) -> FailureHandler {
        let failures = Arc::clone(&self.failures);
        Arc::new(move |e| failures.lock().unwrap().push(e))
    }

    async fn connect(&self) -> Arc<ConnectionManager> {
        ConnectionManager::connect(&self.ctx, self.handler()).await.unwrap()
    }

    fn session(&self) -> Arc<MockSession> {
        self.connector.last_session().unwrap()
    }

    fn failures(&self) -> Vec<DriverError> {
        self.failures.lock().unwrap().clone()
    }
}

fn batched(batch: usize) -> OpcUaOptions {
    let mut options = options();
    options.max_request_items = batch;
    options
}

fn records(count: u32, value_type: DataType) -> Vec<ChannelRecord> {
    (0..count)
        .map(|i| ChannelRecord::new(format!("ch{i}"), value_type, ChannelConfig::new()))
        .collect()
}

fn read_requests(records: &mut [ChannelRecord]) -> Vec<Request<'_, ReadParams>> {
    records
        .iter_mut()
        .enumerate()
        .map(|(i, record)| {
            Request::new(
                ReadParams {
                    node_id: node(i as u32),
                    attribute: AttributeKind::Value,
                },
                record,
            )
        })
        .collect()
}

fn write_requests(records: &mut [ChannelRecord]) -> Vec<Request<'_, WriteParams>> {
    records
        .iter_mut()
        .enumerate()
        .map(|(i, record)| {
            Request::new(
                WriteParams {
                    node_id: node(i as u32),
                    attribute: AttributeKind::Value,
                },
                record,
            )
        })
        .collect()
}

fn int_writes(count: u32) -> Vec<ChannelRecord> {
    records(count, DataType::Int32)
        .into_iter()
        .enumerate()
        .map(|(i, record)| record.with_value(NGValue::Int32(i as i32)))
        .collect()
}

#[tokio::test]
async fn test_read_is_split_into_batches() {
    init_tracing();
    let fx = Fixture::new(batched(4));
    let session = MockSession::new();
    for i in 0..10u32 {
        session.set_value(node(i), Variant::Int32(i as i32 * 10));
    }
    fx.connector.queue_session(session.clone());
    let connection = fx.connect().await;

    let mut records = records(10, DataType::Int32);
    connection.read(&mut read_requests(&mut records)).await.unwrap();

    let sizes: Vec<usize> = session
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            Call::Read(nodes) => Some(nodes.len()),
            _ => None,
        })
        .collect();
    assert_eq!(sizes, vec![4, 4, 2]);
    for (i, record) in records.iter().enumerate() {
        assert!(record.status.is_success(), "{:?}", record.status);
        assert_eq!(record.value, Some(NGValue::Int32(i as i32 * 10)));
        assert!(record.timestamp > 0);
    }
}

#[tokio::test]
async fn test_bad_read_status_fails_single_record() {
    init_tracing();
    let fx = Fixture::new(options());
    let session = MockSession::new();
    session.set_value(node(0), Variant::Double(1.5));
    fx.connector.queue_session(session);
    let connection = fx.connect().await;

    let mut records = records(2, DataType::Float64);
    connection.read(&mut read_requests(&mut records)).await.unwrap();
    assert_eq!(records[0].value, Some(NGValue::Float64(1.5)));
    assert_eq!(records[1].status.flag, ChannelFlag::Failure);
    assert!(fx.failures().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_read_timeout_fails_only_the_slow_batch() {
    init_tracing();
    let mut options = batched(2);
    options.request_timeout_ms = 1_000;
    let fx = Fixture::new(options);
    let session = MockSession::new();
    for i in 0..4u32 {
        session.set_value(node(i), Variant::Int32(1));
    }
    session.delay_reads([Duration::ZERO, Duration::from_secs(5)]);
    fx.connector.queue_session(session);
    let connection = fx.connect().await;

    let mut records = records(4, DataType::Int32);
    let result = connection.read(&mut read_requests(&mut records)).await;
    assert_eq!(result, Err(DriverError::Timeout(Duration::from_secs(1))));
    assert!(records[..2].iter().all(|r| r.status.is_success() && r.value.is_some()));
    assert!(records[2..]
        .iter()
        .all(|r| r.status.flag == ChannelFlag::Failure && r.value.is_none()));
    assert_eq!(fx.failures(), vec![DriverError::Timeout(Duration::from_secs(1))]);
}

#[tokio::test]
async fn test_rejected_read_is_protocol_error() {
    init_tracing();
    let fx = Fixture::new(options());
    let session = MockSession::new();
    session.fail_reads(true);
    fx.connector.queue_session(session);
    let connection = fx.connect().await;

    let mut records = records(3, DataType::Int32);
    let result = connection.read(&mut read_requests(&mut records)).await;
    assert!(matches!(result, Err(DriverError::ProtocolError(_))));
    assert!(records.iter().all(|r| r.status.flag == ChannelFlag::Failure));
    assert_eq!(fx.failures().len(), 1);
}

#[tokio::test]
async fn test_unconvertible_write_value_is_not_sent() {
    init_tracing();
    let fx = Fixture::new(options());
    let session = MockSession::new();
    session.set_write_status(node(3), StatusCode::BadNotWritable);
    fx.connector.queue_session(session.clone());
    let connection = fx.connect().await;

    let mut records = vec![
        ChannelRecord::new("ok", DataType::Int32, ChannelConfig::new()).with_value(NGValue::Int32(5)),
        ChannelRecord::new("text", DataType::Int32, ChannelConfig::new())
            .with_value(NGValue::String(Arc::from("abc"))),
        ChannelRecord::new("empty", DataType::Int32, ChannelConfig::new()),
        ChannelRecord::new("locked", DataType::Int32, ChannelConfig::new()).with_value(NGValue::Int32(1)),
    ];
    let mut requests: Vec<Request<'_, WriteParams>> = records
        .iter_mut()
        .enumerate()
        .map(|(i, record)| {
            Request::new(
                WriteParams {
                    node_id: node(i as u32),
                    attribute: AttributeKind::Value,
                },
                record,
            )
        })
        .collect();
    connection.write(&mut requests).await.unwrap();
    drop(requests);

    assert_eq!(session.calls().last(), Some(&Call::Write(vec![node(0), node(3)])));
    assert!(records[0].status.is_success());
    assert!(records[1].status.message.as_deref().unwrap().contains("Codec error"));
    assert!(records[2].status.message.as_deref().unwrap().contains("no value"));
    assert_eq!(records[3].status.flag, ChannelFlag::Failure);
    assert!(records.iter().all(|r| r.timestamp > 0));
    assert!(fx.failures().is_empty());
}

#[tokio::test]
async fn test_write_is_split_into_batches() {
    init_tracing();
    let fx = Fixture::new(batched(4));
    let session = MockSession::new();
    session.set_write_status(node(6), StatusCode::BadNotWritable);
    fx.connector.queue_session(session.clone());
    let connection = fx.connect().await;

    let mut records = int_writes(10);
    connection.write(&mut write_requests(&mut records)).await.unwrap();

    let sizes: Vec<usize> = session
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            Call::Write(nodes) => Some(nodes.len()),
            _ => None,
        })
        .collect();
    assert_eq!(sizes, vec![4, 4, 2]);
    for (i, record) in records.iter().enumerate() {
        if i == 6 {
            assert_eq!(record.status.flag, ChannelFlag::Failure);
        } else {
            assert!(record.status.is_success(), "record {i}: {:?}", record.status);
        }
        assert!(record.timestamp > 0);
    }
    assert!(fx.failures().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_write_timeout_fails_only_the_slow_batch() {
    init_tracing();
    let mut options = batched(2);
    options.request_timeout_ms = 1_000;
    let fx = Fixture::new(options);
    let session = MockSession::new();
    session.delay_writes([Duration::ZERO, Duration::from_secs(5)]);
    fx.connector.queue_session(session.clone());
    let connection = fx.connect().await;

    let mut records = int_writes(6);
    let result = connection.write(&mut write_requests(&mut records)).await;
    assert_eq!(result, Err(DriverError::Timeout(Duration::from_secs(1))));
    assert!(records[..2].iter().all(|r| r.status.is_success() && r.timestamp > 0));
    assert!(records[2..4].iter().all(|r| r.status.flag == ChannelFlag::Failure));
    // The batch after the slow one is never sent.
    assert!(records[4..].iter().all(|r| r.timestamp == 0));
    assert_eq!(session.count(|c| matches!(c, Call::Write(_))), 2);
    assert_eq!(fx.failures(), vec![DriverError::Timeout(Duration::from_secs(1))]);
}

#[tokio::test]
async fn test_failover_tries_candidates_in_order() {
    init_tracing();
    let fx = Fixture::new(options());
    fx.connector.refuse("opc.tcp://plc-host:4840");
    fx.connect().await;
    assert_eq!(
        fx.connector.attempted_urls(),
        vec!["opc.tcp://plc-host:4840", "opc.tcp://10.0.0.5:4840"]
    );
}

#[tokio::test]
async fn test_forced_endpoint_url_is_the_only_candidate() {
    init_tracing();
    let mut options = options();
    options.force_endpoint_url = true;
    let fx = Fixture::new(options);
    fx.connect().await;
    assert_eq!(fx.connector.attempted_urls(), vec!["opc.tcp://10.0.0.5:4840"]);
}

#[tokio::test]
async fn test_connect_errors() {
    init_tracing();
    let fx = Fixture::new(options());
    fx.connector.refuse_all(true);
    let err = ConnectionManager::connect(&fx.ctx, fx.handler()).await.err().unwrap();
    assert!(matches!(err, DriverError::ConnectionError(_)));

    let mut secure = options();
    secure.security_policy = SecurityPolicy::Basic256Sha256;
    let fx = Fixture::new(secure.clone());
    let err = ConnectionManager::connect(&fx.ctx, fx.handler()).await.err().unwrap();
    assert!(matches!(err, DriverError::ConnectionError(_)));
    assert!(fx.connector.attempted_urls().is_empty());

    // Secure endpoint but the configured certificate does not exist.
    let connector = MockConnector::new(vec![Endpoint::new(
        "opc.tcp://plc-host:4840",
        SecurityPolicy::Basic256Sha256.uri(),
        MessageSecurityMode::SignAndEncrypt,
    )]);
    let mut fx = Fixture::with_connector(secure, connector);
    fx.ctx.certificates = Arc::new(FileCertificates::new(&CertificateOptions {
        certificate_path: "/nonexistent/client.der".into(),
        private_key_path: "/nonexistent/client.pem".into(),
        trust_server_certs: false,
    }));
    let err = ConnectionManager::connect(&fx.ctx, fx.handler()).await.err().unwrap();
    assert!(matches!(err, DriverError::ConfigurationError(_)));
    assert!(fx.connector.attempted_urls().is_empty());
}

#[tokio::test]
async fn test_session_config_carries_options() {
    init_tracing();
    let mut options = options();
    options.request_timeout_ms = 2_500;
    options.application_name = "line-3".into();
    let fx = Fixture::new(options);
    fx.connect().await;
    let config = fx.connector.last_config().unwrap();
    assert_eq!(config.request_timeout, Duration::from_millis(2_500));
    assert_eq!(config.application_name, "line-3");
    assert!(config.certificate.is_none());
    assert!(config.on_connection_lost.is_some());
}

#[tokio::test]
async fn test_connect_subscribes_existing_registrations() {
    init_tracing();
    let fx = Fixture::new(options());
    let listener = RecordingListener::new();
    let dyn_listener: Arc<dyn ChannelListener> = listener.clone();
    fx.ctx.node_registry.register(
        NodeListenParams {
            node_id: node(1),
            attribute: AttributeKind::Value,
            sampling_interval: Duration::from_secs(1),
            queue_size: 10,
            discard_oldest: true,
        },
        registration(&dyn_listener, "temp", DataType::Int32),
    );

    let connection = fx.connect().await;
    let session = fx.session();
    assert!(eventually(|| session.live_items().len() == 1).await);
    assert!(eventually(|| connection.queue().is_idle()).await);
    session.publish(&node(1), Variant::Int32(3));
    assert_eq!(listener.records()[0].value, Some(NGValue::Int32(3)));
}

#[tokio::test]
async fn test_connection_loss_reaches_failure_handler() {
    init_tracing();
    let fx = Fixture::new(options());
    let _connection = fx.connect().await;
    fx.connector.drop_connection();
    assert!(matches!(fx.failures().as_slice(), [DriverError::SessionError(_)]));
}

#[tokio::test]
async fn test_close_disconnects_last_and_only_once() {
    init_tracing();
    let fx = Fixture::new(options());
    let listener: Arc<dyn ChannelListener> = RecordingListener::new();
    fx.ctx.node_registry.register(
        NodeListenParams {
            node_id: node(1),
            attribute: AttributeKind::Value,
            sampling_interval: Duration::from_secs(1),
            queue_size: 10,
            discard_oldest: true,
        },
        registration(&listener, "temp", DataType::Int32),
    );
    let connection = fx.connect().await;
    let session = fx.session();
    assert!(eventually(|| session.live_items().len() == 1).await);

    connection.close().await.unwrap();
    let calls = session.calls();
    assert_eq!(calls.last(), Some(&Call::Disconnect));
    assert_eq!(session.count(|c| matches!(c, Call::DeleteSubscription(_))), 1);
    assert!(connection.is_closed());
    assert!(connection.queue().is_shut_down());

    connection.close().await.unwrap();
    assert_eq!(session.count(|c| *c == Call::Disconnect), 1);

    // Failures of a closed connection are not reported.
    let mut records = records(1, DataType::Int32);
    session.fail_reads(true);
    let _ = connection.read(&mut read_requests(&mut records)).await;
    assert!(fx.failures().is_empty());
}
