//! Kafka 基础设施封装
//!
//! 将 rdkafka 的底层 API 封装为业务友好的 Producer/Consumer 抽象，
//! 统一消息序列化、错误映射和优雅关闭语义。
//!
//! 消费端关闭了自动提交：handler 成功返回后才提交 offset，
//! 失败时回退到该消息的 offset 以便重新投递。

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::Offset;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::KafkaConfig;
use crate::error::{Result, ShopError};

// ---------------------------------------------------------------------------
// Topic 常量
// ---------------------------------------------------------------------------

/// 集中管理所有 Kafka topic 名称
pub mod topics {
    pub const ORDERS_CREATED: &str = "orders.created";
    pub const PAYMENTS_COMPLETED: &str = "payments.completed";

    /// 每个被消费的 topic 都有对应的死信 topic
    pub fn dead_letter_topic(source_topic: &str) -> String {
        format!("{source_topic}.dlq")
    }
}

// ---------------------------------------------------------------------------
// MessagePublisher
// ---------------------------------------------------------------------------

/// 消息发布能力
///
/// Outbox 投递器和死信生产者只依赖这个 trait，测试中可替换为内存实现。
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    /// 发布一条消息，`key` 决定分区，保证同一聚合的消息有序
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<()>;
}

// ---------------------------------------------------------------------------
// ConsumerMessage
// ---------------------------------------------------------------------------

/// 消费到的 Kafka 消息的统一表示
///
/// 将 rdkafka 的 `BorrowedMessage`（带生命周期约束）转换为拥有所有权的结构体，
/// 使消息可以安全地跨 await 点传递给异步处理函数。
#[derive(Debug, Clone)]
pub struct ConsumerMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub timestamp: Option<i64>,
    pub headers: HashMap<String, String>,
}

impl ConsumerMessage {
    /// 从 rdkafka 的借用消息构造，提取并拥有所有字段
    fn from_borrowed(msg: &BorrowedMessage<'_>) -> Self {
        let key = msg
            .key()
            .and_then(|k| std::str::from_utf8(k).ok())
            .map(String::from);

        let payload = msg.payload().map(|p| p.to_vec()).unwrap_or_default();

        let mut headers = HashMap::new();
        if let Some(h) = msg.headers() {
            for idx in 0..h.count() {
                let header = h.get(idx);
                if let Some(raw) = header.value
                    && let Ok(value) = std::str::from_utf8(raw)
                {
                    headers.insert(header.key.to_string(), value.to_string());
                }
            }
        }

        Self {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key,
            payload,
            timestamp: msg.timestamp().to_millis(),
            headers,
        }
    }

    /// 构造一条内存消息，用于进程内投递和测试
    pub fn new(topic: impl Into<String>, key: Option<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            partition: 0,
            offset: 0,
            key,
            payload,
            timestamp: Some(chrono::Utc::now().timestamp_millis()),
            headers: HashMap::new(),
        }
    }

    /// 将负载视为 UTF-8 字符串返回
    pub fn payload_str(&self) -> Result<&str> {
        std::str::from_utf8(&self.payload)
            .map_err(|e| ShopError::Validation(format!("负载非 UTF-8 编码: {e}")))
    }

    /// 将 JSON 格式负载反序列化为目标类型
    pub fn deserialize_payload<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| ShopError::Validation(format!("负载反序列化失败: {e}")))
    }
}

// ---------------------------------------------------------------------------
// KafkaProducer
// ---------------------------------------------------------------------------

/// 面向业务的 Kafka 生产者
///
/// 开启幂等生产与 `acks=all`，配合 Outbox 实现至少一次投递。
#[derive(Clone)]
pub struct KafkaProducer {
    producer: FutureProducer,
}

impl KafkaProducer {
    /// 根据配置创建生产者
    ///
    /// `message.timeout.ms` 为 5 秒，超时后由 Outbox 按退避策略重试。
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("message.timeout.ms", "5000")
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .create()
            .map_err(|e| ShopError::Kafka(format!("创建生产者失败: {e}")))?;

        info!(brokers = %config.brokers, "Kafka 生产者已初始化");
        Ok(Self { producer })
    }

    /// 发送原始字节消息，返回 (partition, offset)
    pub async fn send(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(i32, i64)> {
        let record = FutureRecord::to(topic).key(key).payload(payload);

        let delivery = self
            .producer
            .send(record, Duration::from_secs(5))
            .await
            .map_err(|(e, _)| ShopError::Kafka(format!("发送消息失败: {e}")))?;

        debug!(
            topic,
            key,
            partition = delivery.partition,
            offset = delivery.offset,
            "消息已发送"
        );
        Ok((delivery.partition, delivery.offset))
    }
}

#[async_trait]
impl MessagePublisher for KafkaProducer {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<()> {
        self.send(topic, key, payload).await.map(|_| ())
    }
}

// ---------------------------------------------------------------------------
// KafkaConsumer
// ---------------------------------------------------------------------------

/// 面向业务的 Kafka 消费者
///
/// 封装 `StreamConsumer` 并提供基于 `watch` channel 的优雅关闭语义。
pub struct KafkaConsumer {
    consumer: StreamConsumer,
    redelivery_delay: Duration,
}

impl KafkaConsumer {
    /// 创建消费者
    ///
    /// `group_id_suffix` 允许同一服务内不同消费逻辑使用独立的消费组。
    pub fn new(config: &KafkaConfig, group_id_suffix: Option<&str>) -> Result<Self> {
        let group_id = match group_id_suffix {
            Some(suffix) => format!("{}.{}", config.consumer_group, suffix),
            None => config.consumer_group.clone(),
        };

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &group_id)
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("enable.auto.commit", "false")
            .create()
            .map_err(|e| ShopError::Kafka(format!("创建消费者失败: {e}")))?;

        info!(brokers = %config.brokers, group_id, "Kafka 消费者已初始化");
        Ok(Self {
            consumer,
            redelivery_delay: Duration::from_secs(1),
        })
    }

    /// 订阅指定的 topic 列表
    pub fn subscribe(&self, topics: &[&str]) -> Result<()> {
        self.consumer
            .subscribe(topics)
            .map_err(|e| ShopError::Kafka(format!("订阅 topic 失败: {e}")))?;

        info!(?topics, "已订阅 Kafka topics");
        Ok(())
    }

    /// 启动消费循环
    ///
    /// - handler 成功后同步提交该消息的 offset。
    /// - handler 失败时不提交，并把分区位置回退到该消息，等待 `redelivery_delay`
    ///   后重新拉取，保证未处理完的消息不会被后续提交跳过。
    /// - 关闭信号变为 `true` 时退出循环，正在执行的 handler 会自然完成。
    pub async fn start<F, Fut>(self, mut shutdown: watch::Receiver<bool>, handler: F)
    where
        F: Fn(ConsumerMessage) -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        use futures::StreamExt;

        let stream = self.consumer.stream();
        futures::pin_mut!(stream);

        info!("Kafka 消费循环已启动");

        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("收到关闭信号，Kafka 消费循环退出");
                        break;
                    }
                }

                msg_result = stream.next() => {
                    let Some(msg_result) = msg_result else {
                        warn!("Kafka 消息流意外结束");
                        break;
                    };

                    let borrowed_msg = match msg_result {
                        Ok(m) => m,
                        Err(e) => {
                            error!(error = %e, "接收 Kafka 消息出错");
                            continue;
                        }
                    };

                    let msg = ConsumerMessage::from_borrowed(&borrowed_msg);
                    debug!(
                        topic = %msg.topic,
                        partition = msg.partition,
                        offset = msg.offset,
                        "收到 Kafka 消息"
                    );

                    match handler(msg.clone()).await {
                        Ok(()) => {
                            if let Err(e) = self.consumer.commit_message(&borrowed_msg, CommitMode::Sync) {
                                error!(
                                    topic = %msg.topic,
                                    partition = msg.partition,
                                    offset = msg.offset,
                                    error = %e,
                                    "提交 offset 失败，消息可能被重复投递"
                                );
                            }
                        }
                        Err(e) => {
                            error!(
                                topic = %msg.topic,
                                partition = msg.partition,
                                offset = msg.offset,
                                error = %e,
                                "处理 Kafka 消息失败，offset 未提交，稍后重新投递"
                            );
                            if let Err(seek_err) = self.consumer.seek(
                                &msg.topic,
                                msg.partition,
                                Offset::Offset(msg.offset),
                                Duration::from_secs(5),
                            ) {
                                error!(error = %seek_err, "回退分区位置失败");
                            }
                            tokio::time::sleep(self.redelivery_delay).await;
                        }
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// 测试
// ---------------------------------------------------------------------------
