use std::collections::VecDeque;
use std::env;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use random_word::Lang;
use samsa_delivery::prelude::{
    parse_brokers, BrokerTransport, ClientConfig, ConsumedRecord, DeliveryResult, Error,
    InMemoryBroker, MemoryConnection, Message, OffsetReset, RecordMetadata, Result,
    TopicPartition, TransportError,
};

const KAFKA_BROKERS: &str = "KAFKA_BROKERS";
const DEFAULT_BROKERS: &str = "127.0.0.1:9092";

/// Client settings for the in-process cluster, honoring `KAFKA_BROKERS`.
pub fn client_config() -> Result<ClientConfig> {
    let brokers = env::var(KAFKA_BROKERS).unwrap_or_else(|_| DEFAULT_BROKERS.to_owned());
    Ok(ClientConfig::new(parse_brokers(&brokers)?).client_id("integration test"))
}

/// A fresh broker advertising the test brokers, with `partitions` per topic.
pub fn broker(partitions: i32) -> Result<(InMemoryBroker, ClientConfig)> {
    let config = client_config()?;
    let broker = InMemoryBroker::new()
        .with_advertised(config.bootstrap_servers.clone())
        .with_default_partitions(partitions);
    Ok((broker, config))
}

#[allow(dead_code)]
pub fn random_topic() -> String {
    format!("{}-{}", random_word::gen(Lang::En), random_word::gen(Lang::En))
}

/// Outcomes collected from delivery callbacks, in the order they fired.
#[allow(dead_code)]
#[derive(Clone, Default)]
pub struct Reports {
    inner: Arc<Mutex<Vec<DeliveryResult>>>,
}

#[allow(dead_code)]
impl Reports {
    pub fn callback(&self) -> impl FnOnce(DeliveryResult) + Send + 'static {
        let inner = self.inner.clone();
        move |result| inner.lock().unwrap().push(result)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn take(&self) -> Vec<DeliveryResult> {
        std::mem::take(&mut *self.inner.lock().unwrap())
    }
}

/// What the next scripted call through a [`ScriptedTransport`] does.
#[allow(dead_code)]
#[derive(Clone, Debug)]
pub enum Step {
    Fail(TransportError),
    /// Never complete.
    Stall,
}

/// Transport over an in-memory connection whose sends and commits follow
/// a script.
///
/// Once a script runs out, calls go through to the broker.
#[derive(Clone, Debug)]
pub struct ScriptedTransport {
    inner: MemoryConnection,
    script: Arc<Mutex<VecDeque<Step>>>,
    commit_script: Arc<Mutex<VecDeque<Step>>>,
    sent: Arc<Mutex<Vec<Message>>>,
    commit_calls: Arc<Mutex<usize>>,
}

#[allow(dead_code)]
impl ScriptedTransport {
    pub fn new(inner: MemoryConnection, script: Vec<Step>) -> Self {
        Self {
            inner,
            script: Arc::new(Mutex::new(script.into())),
            commit_script: Arc::new(Mutex::new(VecDeque::new())),
            sent: Arc::new(Mutex::new(vec![])),
            commit_calls: Arc::new(Mutex::new(0)),
        }
    }

    /// Replace the commit script. Clones share it.
    pub fn script_commits(&self, script: Vec<Step>) {
        *self.commit_script.lock().unwrap() = script.into();
    }

    /// Every message handed to `send`, attempts included.
    pub fn sent(&self) -> Vec<Message> {
        self.sent.lock().unwrap().clone()
    }

    /// How many times `commit` was called, retries included.
    pub fn commit_calls(&self) -> usize {
        *self.commit_calls.lock().unwrap()
    }
}

#[async_trait]
impl BrokerTransport for ScriptedTransport {
    async fn send(&mut self, message: &Message) -> Result<RecordMetadata> {
        self.sent.lock().unwrap().push(message.clone());
        let step = self.script.lock().unwrap().pop_front();
        match step {
            Some(Step::Fail(err)) => Err(Error::Transport(err)),
            Some(Step::Stall) => futures::future::pending().await,
            None => self.inner.send(message).await,
        }
    }

    async fn poll(&mut self, timeout_ms: u64) -> Result<Option<ConsumedRecord>> {
        self.inner.poll(timeout_ms).await
    }

    async fn commit(&mut self, offsets: &[(TopicPartition, i64)]) -> Result<()> {
        *self.commit_calls.lock().unwrap() += 1;
        let step = self.commit_script.lock().unwrap().pop_front();
        match step {
            Some(Step::Fail(err)) => Err(Error::Transport(err)),
            Some(Step::Stall) => futures::future::pending().await,
            None => self.inner.commit(offsets).await,
        }
    }

    async fn subscribe(
        &mut self,
        group_id: &str,
        topics: &[String],
        offset_reset: OffsetReset,
    ) -> Result<()> {
        self.inner.subscribe(group_id, topics, offset_reset).await
    }

    async fn partitions(&mut self, topic: &str) -> Result<i32> {
        self.inner.partitions(topic).await
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.close().await
    }
}
