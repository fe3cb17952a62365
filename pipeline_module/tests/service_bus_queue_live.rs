//! Round-trip against a real Service Bus namespace. Runs only when
//! SERVICE_BUS_CONNECTION_STRING is present in the environment.

mod test_support;

use std::time::{Duration, Instant};

use pipeline_module::service_bus_queue::ServiceBusWorkQueue;
use pipeline_module::task::EmailTask;
use pipeline_module::work_queue::WorkQueue;

#[test]
fn publish_receive_complete_round_trip() -> Result<(), Box<dyn std::error::Error>> {
    if test_support::require_service_bus_connection("publish_receive_complete_round_trip")
        .is_none()
    {
        return Ok(());
    }

    let queue = ServiceBusWorkQueue::from_env()?;
    let marker = uuid::Uuid::new_v4().to_string();
    let task = EmailTask {
        email_id: format!("live-test-{}", marker),
        subject: Some("Service Bus round trip".to_string()),
        body: Some("round-trip payload".to_string()),
        sender: Some("sender@test.local".to_string()),
        recipient: Some("recipient@test.local".to_string()),
    };
    queue.publish(&task)?;

    // The queue may hold unrelated messages; leave those unsettled so
    // their locks lapse and they become visible again.
    let deadline = Instant::now() + Duration::from_secs(120);
    while Instant::now() < deadline {
        let Some(delivery) = queue.receive()? else {
            std::thread::sleep(Duration::from_millis(500));
            continue;
        };
        let Ok(received) = serde_json::from_str::<EmailTask>(&delivery.raw) else {
            continue;
        };
        if received.email_id == task.email_id {
            assert_eq!(received, task);
            queue.complete(&delivery.id)?;
            return Ok(());
        }
    }
    Err("timed out waiting for the published task".into())
}
