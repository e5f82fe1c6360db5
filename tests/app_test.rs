use std::sync::Arc;
use std::time::Duration;

use gpujob::app::Application;
use gpujob::shutdown::ShutdownManager;
use gpujob_core::config::AppConfig;
use gpujob_core::{DevicePool, ResultStore};
use gpujob_infrastructure::{InMemoryBroker, InMemoryDevicePool, InMemoryResultStore};
use serde_json::json;
use tempfile::TempDir;
use tokio::time::{sleep, timeout};

fn config() -> AppConfig {
    let mut config = AppConfig::default();
    config.worker.interpreter = "sh".to_string();
    config.worker.device_count = Some(2);
    config.worker.termination_grace_seconds = 1;
    config.message_queue.max_retries = 2;
    config.message_queue.retry_delay_seconds = 0;
    config
}

#[tokio::test]
async fn test_application_runs_job_and_shuts_down() {
    let scripts = TempDir::new().unwrap();
    let script = scripts.path().join("train.sh");
    std::fs::write(
        &script,
        "echo 'Epoch 1/1'\necho 'Val Loss: 0.2, Val Metric: 0.95'\n",
    )
    .unwrap();

    let broker = InMemoryBroker::new();
    let pool = Arc::new(InMemoryDevicePool::with_free_devices([9]));
    let store = Arc::new(InMemoryResultStore::new());

    let app = Application::from_parts(
        config(),
        Arc::new(broker.clone()),
        pool.clone(),
        store.clone(),
    )
    .await
    .unwrap();
    assert_eq!(pool.free_devices().await.unwrap(), vec![0, 1]);

    let shutdown = ShutdownManager::new();
    let token = shutdown.token();
    let handle = tokio::spawn(async move { app.run(token).await });

    broker
        .publish(
            serde_json::to_vec(&json!({
                "user": "alice",
                "script_path": script.to_string_lossy(),
                "config_path": "config.yaml",
                "model_name": "resnet",
                "learning_rate": "1e-3",
            }))
            .unwrap(),
        )
        .await;

    timeout(Duration::from_secs(10), async {
        while broker.acked().await.is_empty() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(
        store
            .get_field("job_result:alice:resnet", "epoch_1_val_metric")
            .await
            .unwrap()
            .as_deref(),
        Some("0.9500")
    );

    shutdown.shutdown();
    let result = timeout(Duration::from_secs(10), handle).await.unwrap().unwrap();
    assert!(result.is_ok());

    let mut free = pool.free_devices().await.unwrap();
    free.sort_unstable();
    assert_eq!(free, vec![0, 1]);
}

#[tokio::test]
async fn test_unreachable_queue_is_fatal() {
    let broker = InMemoryBroker::new();
    broker.fail_next_connects(5);

    let app = Application::from_parts(
        config(),
        Arc::new(broker.clone()),
        Arc::new(InMemoryDevicePool::new()),
        Arc::new(InMemoryResultStore::new()),
    )
    .await
    .unwrap();

    let result = timeout(
        Duration::from_secs(10),
        app.run(ShutdownManager::new().token()),
    )
    .await
    .unwrap();

    assert!(result.is_err());
    assert_eq!(broker.connect_attempts(), 2);
}
