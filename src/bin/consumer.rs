use samsa_delivery::prelude::{
    ClientConfig, CommitMode, ConsumerBuilder, ConsumerConfig, ConsumerEvent, InMemoryBroker,
    Message, OffsetReset, ProducerBuilder,
};

const DEFAULT_BROKER: &str = "127.0.0.1:9092";
const DEFAULT_GROUP: &str = "purchase-readers";
const TOPIC: &str = "purchases";
const MAX_EMPTY_POLLS: usize = 3;

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
    let mut config = ConsumerConfig::from_env().unwrap_or_else(|_| {
        let mut config = ConsumerConfig::new(DEFAULT_GROUP);
        config.offset_reset = OffsetReset::Earliest;
        config
    });
    if config.topics.is_empty() {
        config.topics = vec![TOPIC.to_string()];
    }

    let broker = InMemoryBroker::new()
        .with_advertised(client.bootstrap_servers.clone())
        .with_default_partitions(3);

    // the broker lives in this process, so fill it first
    let conn = broker
        .connect(&client)
        .await
        .map_err(|err| tracing::error!("{:?}", err))?;
    let mut producer = ProducerBuilder::new(conn, config.topics.clone())
        .await
        .map_err(|err| tracing::error!("{:?}", err))?
        .build()
        .map_err(|err| tracing::error!("{:?}", err))?;
    for i in 0..10 {
        let message = Message::new(config.topics[0].as_str(), None, format!("purchase {}", i));
        producer
            .produce(message, |_| {})
            .map_err(|err| tracing::error!("{:?}", err))?;
    }
    producer
        .close(5_000)
        .await
        .map_err(|err| tracing::error!("{:?}", err))?;

    tracing::info!("Subscribing to {:?}", config.topics);
    let conn = broker
        .connect(&client)
        .await
        .map_err(|err| tracing::error!("{:?}", err))?;
    let mut consumer = ConsumerBuilder::from_config(conn, config)
        .enable_auto_commit(false)
        .clone()
        .build()
        .await
        .map_err(|err| tracing::error!("{:?}", err))?;

    let mut empty_polls = 0;
    while empty_polls < MAX_EMPTY_POLLS {
        match consumer.poll(500).await {
            Ok(Some(ConsumerEvent::Record(record))) => {
                empty_polls = 0;
                tracing::info!(
                    "Read {} from {} [{}] at offset {}",
                    String::from_utf8_lossy(&record.payload),
                    record.topic,
                    record.partition,
                    record.offset
                );
                consumer
                    .mark_processed(&record)
                    .map_err(|err| tracing::error!("{:?}", err))?;
            }
            Ok(Some(ConsumerEvent::Error(err))) => tracing::warn!("Transport error {}", err),
            Ok(None) => empty_polls += 1,
            Err(err) => {
                tracing::error!("{:?}", err);
                break;
            }
        }
    }

    consumer
        .commit(CommitMode::Sync)
        .await
        .map_err(|err| tracing::error!("{:?}", err))?;
    for (topic_partition, offsets) in consumer.offsets() {
        tracing::info!("{:?} committed through {}", topic_partition, offsets.committed);
    }

    consumer
        .close(5_000)
        .await
        .map_err(|err| tracing::error!("{:?}", err))
}
