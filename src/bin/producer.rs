use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use samsa_delivery::prelude::{ClientConfig, InMemoryBroker, ProducerBuilder, ProducerConfig};

const DEFAULT_BROKER: &str = "127.0.0.1:9092";
const TOPIC: &str = "purchases";

#[tokio::main]
async fn main() -> Result<(), ()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let client = ClientConfig::from_env().or_else(|_| {
        DEFAULT_BROKER
            .parse()
            .map(|addr| ClientConfig::new(vec![addr]))
    });
    let client = client.map_err(|err| tracing::error!("{:?}", err))?;
    let producer_config = ProducerConfig::from_env().map_err(|err| tracing::error!("{:?}", err))?;

    let broker = InMemoryBroker::new()
        .with_advertised(client.bootstrap_servers.clone())
        .with_default_partitions(3);

    tracing::info!("Connecting to cluster");
    let conn = broker
        .connect(&client)
        .await
        .map_err(|err| tracing::error!("{:?}", err))?;
    let mut producer = ProducerBuilder::new(conn, vec![TOPIC.to_string()])
        .await
        .map_err(|err| tracing::error!("{:?}", err))?
        .config(producer_config)
        .clone()
        .build()
        .map_err(|err| tracing::error!("{:?}", err))?;

    let delivered = Arc::new(AtomicUsize::new(0));
    for i in 0..10 {
        // serve delivery reports of earlier sends
        producer
            .poll(0)
            .await
            .map_err(|err| tracing::error!("{:?}", err))?;

        let delivered = delivered.clone();
        producer
            .send(
                TOPIC,
                Some(Bytes::from(format!("customer-{}", i % 3))),
                format!("purchase {}", i),
                move |report| match report {
                    Ok(report) => {
                        delivered.fetch_add(1, Ordering::Relaxed);
                        tracing::info!(
                            "Delivered {} to {} [{}] at offset {}",
                            String::from_utf8_lossy(&report.message.payload),
                            report.message.topic,
                            report.partition,
                            report.offset
                        );
                    }
                    Err(failure) => tracing::error!(
                        "Failed to deliver {} after {} attempts: {}",
                        String::from_utf8_lossy(&failure.message.payload),
                        failure.attempt,
                        failure.error
                    ),
                },
            )
            .map_err(|err| tracing::error!("{:?}", err))?;
    }

    producer
        .flush(10_000)
        .await
        .map_err(|err| tracing::error!("{:?}", err))?;
    tracing::info!("{} messages delivered", delivered.load(Ordering::Relaxed));

    producer
        .close(1_000)
        .await
        .map_err(|err| tracing::error!("{:?}", err))
}
