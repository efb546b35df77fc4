//! Metric publisher
//!
//! Connects to the broker, listens on the target topic and publishes a
//! random metric value every `publisher.send_delay_secs` until Ctrl-C.

use std::time::Duration;

use brokerlink::client::{BrokerClient, Listener, PublishStatus};
use brokerlink::config::{PublisherSettings, load_config};
use brokerlink::message::{Headers, Message};
use brokerlink::transport::WebSocketTransport;
use serde_json::json;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    if let Err(e) = run().await {
        // no-op when run() already installed the subscriber
        brokerlink::utils::logging::init("info");
        error!("Publisher failed: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config()?;
    brokerlink::utils::logging::init(&config.log.level);

    let client = BrokerClient::builder(config.broker.endpoint(), WebSocketTransport::new())
        .retry_policy(config.retry.policy())
        .queue_policy(config.queue.policy())
        .stop_wait_timeout(config.broker.stop_wait_timeout())
        .build();

    let status = client.connect().await?;
    info!("Connect to {} settled: {:?}", client.endpoint(), status);

    let destination = config.publisher.destination();
    client
        .subscribe(
            &destination,
            Listener::new(|m: &Message| info!("Received message: {}", m.payload_text())),
        )
        .await?;

    let mut ticker = tokio::time::interval(Duration::from_secs(config.publisher.send_delay_secs.max(1)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match client.publish(&destination, metric(&config.publisher), metric_headers()).await {
                    Ok(PublishStatus::Delivered) => info!("Published metric to {}", destination),
                    Ok(PublishStatus::Queued) => warn!("Broker unavailable, metric queued"),
                    Err(e) => error!("Error sending message: {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received. Exiting gracefully.");
                break;
            }
        }
    }

    client.close().await;
    Ok(())
}

fn metric(settings: &PublisherSettings) -> Message {
    let (low, high) = if settings.value_min <= settings.value_max {
        (settings.value_min, settings.value_max)
    } else {
        (settings.value_max, settings.value_min)
    };
    let body = json!({
        "metricValue": rand::random_range(low..=high),
        "level": 1,
        "timestamp": chrono::Utc::now().timestamp(),
    });
    Message::text(body.to_string())
}

fn metric_headers() -> Headers {
    Headers::from([
        ("type".to_string(), "textMessage".to_string()),
        ("amq-msg-type".to_string(), "text".to_string()),
    ])
}
