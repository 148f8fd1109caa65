//! Integration tests for armature-jobs

use armature_jobs::drivers::ephemeral::EphemeralConsumer;
use armature_jobs::*;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const CONFIG: &str = r#"
    [jobs]
    num_pollers = 2
    timeout = 5
    consume = ["local"]

    [jobs.pipelines.local]
    driver = "memory"
    priority = 5

    [jobs.pipelines.reports]
    driver = "ephemeral"
    prefetch = 10

    [jobs.dispatch."mail.*"]
    pipeline = "local"

    [jobs.dispatch."report.*"]
    pipeline = "reports"
    attempts = 3
"#;

fn collector() -> (Arc<dyn JobHandler>, mpsc::UnboundedReceiver<(ItemContext, String)>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = handler_fn(move |ctx, body| {
        let tx = tx.clone();
        async move {
            let ctx = ItemContext::from_bytes(&ctx)?;
            let _ = tx.send((ctx, String::from_utf8_lossy(&body).into_owned()));
            Ok::<(), JobsError>(())
        }
    });
    (handler, rx)
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<(ItemContext, String)>) -> (ItemContext, String) {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("job was not handled in time")
        .expect("handler channel closed")
}

#[tokio::test]
async fn test_priority_order_across_pushes() {
    let pq = Arc::new(JobQueue::new());
    let ctx = DriverContext::new(
        pq.clone(),
        Arc::new(EventBus::default()),
        Arc::new(Config::default()),
    );
    let pipe = Arc::new(Pipeline::new("ordered", "ephemeral"));
    let consumer = EphemeralConsumer::from_pipeline(&pipe, &ctx);
    consumer.register(pipe.clone()).await.unwrap();

    for (name, priority) in [("low", 50), ("urgent", 1), ("normal", 10), ("high", 5)] {
        consumer
            .push(Job::new(name, name).with_pipeline("ordered").with_priority(priority))
            .await
            .unwrap();
    }
    consumer.run(pipe).await.unwrap();

    for _ in 0..200 {
        if pq.len() == 4 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let order: Vec<String> = (0..4)
        .map(|_| String::from_utf8(pq.extract_min().body().to_vec()).unwrap())
        .collect();
    assert_eq!(order, vec!["urgent", "high", "normal", "low"]);

    consumer.stop().await.unwrap();
}

#[tokio::test]
async fn test_registry_end_to_end() {
    let bus = EventBus::default();
    let mut events = bus.subscribe();
    let registry = Registry::new(Config::from_toml_str(CONFIG).unwrap(), Arc::new(bus)).unwrap();

    let (handler, mut rx) = collector();
    registry.serve(handler).await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.kind, EventKind::PipeActive);
    assert_eq!(event.pipeline, "local");

    registry
        .push(Job::new("mail.welcome", "hi").with_header("lang", "en"))
        .await
        .unwrap();
    let (ctx, body) = recv(&mut rx).await;
    assert_eq!(body, "hi");
    assert_eq!(ctx.job, "mail.welcome");
    assert_eq!(ctx.pipeline, "local");
    assert_eq!(ctx.headers["lang"], vec!["en"]);

    // reports is not consumed: jobs wait in its buffer until resumed
    registry.push(Job::new("report.daily", "r1")).await.unwrap();
    let states = registry.states().await.unwrap();
    let reports = states.iter().find(|s| s.pipeline == "reports").unwrap();
    assert_eq!(reports.active, 1);
    assert!(!reports.ready);

    registry.resume(&["reports"]).await;
    let (ctx, body) = recv(&mut rx).await;
    assert_eq!((ctx.pipeline.as_str(), body.as_str()), ("reports", "r1"));

    registry.stop().await.unwrap();
    let mut stopped = 0;
    while let Ok(event) = events.try_recv() {
        if event.kind == EventKind::PipeStopped {
            stopped += 1;
        }
    }
    assert_eq!(stopped, 2);
}

#[tokio::test]
async fn test_registry_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(CONFIG.as_bytes()).unwrap();

    let config = Config::from_file(file.path()).unwrap();
    let registry = Registry::new(config, Arc::new(EventBus::default())).unwrap();
    assert_eq!(registry.list(), vec!["local", "reports"]);

    let mut job = Job::new("report.weekly", "{}");
    let pipe = registry.route(&mut job).unwrap();
    assert_eq!(pipe.name(), "reports");
    assert_eq!(job.options.attempts, 3);
    assert_eq!(job.options.priority, 10);
}

#[tokio::test]
async fn test_unroutable_job() {
    let registry = Registry::new(
        Config::from_toml_str(CONFIG).unwrap(),
        Arc::new(EventBus::default()),
    )
    .unwrap();
    let (handler, _rx) = collector();
    registry.serve(handler).await.unwrap();

    let err = registry.push(Job::new("billing.charge", "{}")).await.unwrap_err();
    assert!(matches!(err.root(), JobsError::NoRoute(name) if name == "billing.charge"));

    registry.stop().await.unwrap();
}

#[test]
fn test_disabled_or_unknown_driver() {
    let err = "kafka".parse::<DriverKind>().unwrap_err();
    assert!(err.to_string().contains("kafka"));
}

// These tests need live brokers and are ignored by default:
// cargo test -- --ignored

fn live_registry(driver_section: &str) -> Registry {
    let config = Config::from_toml_str(&format!(
        r#"
        [jobs]
        num_pollers = 1
        consume = ["live"]

        {driver_section}
        "#
    ))
    .unwrap();
    Registry::new(config, Arc::new(EventBus::default())).unwrap()
}

async fn round_trip(registry: Registry) {
    let (handler, mut rx) = collector();
    registry.serve(handler).await.unwrap();

    registry
        .push(Job::new("live.job", "payload").with_pipeline("live"))
        .await
        .unwrap();
    let (ctx, body) = recv(&mut rx).await;
    assert_eq!(body, "payload");
    assert_eq!(ctx.pipeline, "live");

    registry.stop().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_amqp_round_trip() {
    round_trip(live_registry(
        r#"
        [jobs.pipelines.live]
        driver = "amqp"
        queue = "armature-jobs-test"
        "#,
    ))
    .await;
}

#[tokio::test]
#[ignore]
async fn test_beanstalk_round_trip() {
    round_trip(live_registry(
        r#"
        [jobs.pipelines.live]
        driver = "beanstalk"
        tube = "armature-jobs-test"
        reserve_timeout = 1
        "#,
    ))
    .await;
}

#[tokio::test]
#[ignore]
async fn test_sqs_round_trip() {
    round_trip(live_registry(
        r#"
        [jobs.pipelines.live]
        driver = "sqs"
        queue = "armature-jobs-test"
        wait_time_seconds = 1

        [sqs]
        key = "test"
        secret = "test"
        region = "us-east-1"
        "#,
    ))
    .await;
}
