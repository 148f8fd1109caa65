//! Publish channel ownership and delayed-queue declaration.

use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::MappedMutexGuard;
use tracing::debug;

use super::item::pack;
use crate::error::{JobsError, JobsResult};
use crate::job::Job;

/// Subset of an AMQP channel used to publish jobs.
#[async_trait]
pub trait PublishChannel: Send + Sync {
    /// Declare a durable queue with arguments.
    async fn declare_queue(&self, name: &str, args: FieldTable) -> JobsResult<()>;

    /// Bind `queue` to `exchange` under `routing_key`.
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> JobsResult<()>;

    /// Publish a persistent message.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        headers: FieldTable,
    ) -> JobsResult<()>;
}

#[async_trait]
impl PublishChannel for Channel {
    async fn declare_queue(&self, name: &str, args: FieldTable) -> JobsResult<()> {
        self.queue_declare(
            name,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            args,
        )
        .await?;
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> JobsResult<()> {
        self.queue_bind(
            queue,
            exchange,
            routing_key,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await?;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        headers: FieldTable,
    ) -> JobsResult<()> {
        let props = BasicProperties::default()
            .with_headers(headers)
            .with_delivery_mode(2);
        self.basic_publish(
            exchange,
            routing_key,
            BasicPublishOptions::default(),
            payload,
            props,
        )
        .await?;
        Ok(())
    }
}

/// Single-slot pool holding the publish channel.
///
/// A checkout holds the slot until dropped, so only one publisher uses the
/// channel at a time and the slot is released on every exit path. Redial
/// drains the slot and checks a fresh channel in.
pub struct ChannelPool<C> {
    slot: tokio::sync::Mutex<Option<C>>,
}

impl<C> ChannelPool<C> {
    pub fn new(channel: Option<C>) -> Self {
        Self {
            slot: tokio::sync::Mutex::new(channel),
        }
    }

    /// Take the channel for exclusive use.
    pub async fn checkout(&self) -> JobsResult<MappedMutexGuard<'_, C>> {
        let guard = self.slot.lock().await;
        tokio::sync::MutexGuard::try_map(guard, |slot| slot.as_mut()).map_err(|_| {
            JobsError::Connection("publish channel is not available, redial in progress".into())
        })
    }

    /// Put a channel into the slot, replacing any previous one.
    pub async fn checkin(&self, channel: C) {
        *self.slot.lock().await = Some(channel);
    }

    /// Remove the channel, leaving the pool empty.
    pub async fn drain(&self) -> Option<C> {
        self.slot.lock().await.take()
    }
}

/// Routes jobs to the work queue or to a per-delay dead-letter queue.
///
/// A delayed job goes to `delayed-<ms>.<exchange>.<queue>`, a queue without
/// consumers whose messages expire after the delay and are dead-lettered back
/// to `<exchange>` under `<routing_key>`. Declared delay queues are cached so
/// repeated delays skip declare and bind; an entry is refreshed once half of
/// the queue's `x-expires` lifetime has passed.
pub struct Publisher {
    exchange: String,
    queue: String,
    routing_key: String,
    declared: Mutex<HashMap<String, Instant>>,
}

impl Publisher {
    pub fn new(
        exchange: impl Into<String>,
        queue: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            queue: queue.into(),
            routing_key: routing_key.into(),
            declared: Mutex::new(HashMap::new()),
        }
    }

    /// Name of the queue holding jobs delayed by `delay_ms`.
    pub fn delay_queue_name(&self, delay_ms: i64) -> String {
        format!("delayed-{delay_ms}.{}.{}", self.exchange, self.queue)
    }

    /// Publish `job` through `channel`.
    pub async fn publish<C>(&self, channel: &C, job: &Job) -> JobsResult<()>
    where
        C: PublishChannel + ?Sized,
    {
        let headers = pack(job)?;
        let payload = job.payload.as_bytes();

        if job.options.delay <= 0 {
            return channel
                .publish(&self.exchange, &self.routing_key, payload, headers)
                .await;
        }

        let delay_ms = job.options.delay.saturating_mul(1000);
        let name = self.delay_queue_name(delay_ms);

        if !self.is_declared(&name, delay_ms) {
            let mut args = FieldTable::default();
            args.insert(
                "x-dead-letter-exchange".into(),
                AMQPValue::LongString(self.exchange.clone().into()),
            );
            args.insert(
                "x-dead-letter-routing-key".into(),
                AMQPValue::LongString(self.routing_key.clone().into()),
            );
            args.insert("x-message-ttl".into(), AMQPValue::LongLongInt(delay_ms));
            args.insert(
                "x-expires".into(),
                AMQPValue::LongLongInt(delay_ms.saturating_mul(2)),
            );

            channel.declare_queue(&name, args).await?;
            channel.bind_queue(&name, &self.exchange, &name).await?;
            debug!(queue = %name, delay_ms, "delay queue declared");
            self.declared.lock().insert(name.clone(), Instant::now());
        }

        channel.publish(&self.exchange, &name, payload, headers).await
    }

    /// Drop cached declarations, e.g. after reconnecting.
    pub fn forget(&self) {
        self.declared.lock().clear();
    }

    fn is_declared(&self, name: &str, delay_ms: i64) -> bool {
        let fresh_for = Duration::from_millis(delay_ms.max(0) as u64);
        self.declared
            .lock()
            .get(name)
            .is_some_and(|at| at.elapsed() < fresh_for)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) enum Call {
        Declare(String),
        Bind {
            queue: String,
            exchange: String,
            routing_key: String,
        },
        Publish {
            exchange: String,
            routing_key: String,
        },
    }

    #[derive(Default)]
    pub(crate) struct MockChannel {
        pub calls: Mutex<Vec<Call>>,
        pub args: Mutex<Vec<FieldTable>>,
    }

    impl MockChannel {
        pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
            self.calls.lock().iter().filter(|c| pred(c)).count()
        }
    }

    #[async_trait]
    impl PublishChannel for MockChannel {
        async fn declare_queue(&self, name: &str, args: FieldTable) -> JobsResult<()> {
            self.calls.lock().push(Call::Declare(name.to_string()));
            self.args.lock().push(args);
            Ok(())
        }

        async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> JobsResult<()> {
            self.calls.lock().push(Call::Bind {
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
            });
            Ok(())
        }

        async fn publish(
            &self,
            exchange: &str,
            routing_key: &str,
            _payload: &[u8],
            _headers: FieldTable,
        ) -> JobsResult<()> {
            self.calls.lock().push(Call::Publish {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
            });
            Ok(())
        }
    }

    fn job(delay: i64) -> Job {
        Job::new("mail.send", "{}")
            .with_pipeline("emails")
            .with_delay(delay)
    }

    #[tokio::test]
    async fn test_immediate_publish_uses_routing_key() {
        let ch = MockChannel::default();
        let publisher = Publisher::new("amqp.default", "default", "rk");

        publisher.publish(&ch, &job(0)).await.unwrap();

        assert_eq!(
            *ch.calls.lock(),
            vec![Call::Publish {
                exchange: "amqp.default".into(),
                routing_key: "rk".into()
            }]
        );
    }

    #[tokio::test]
    async fn test_delay_queue_declared_once() {
        let ch = MockChannel::default();
        let publisher = Publisher::new("amqp.default", "default", "rk");

        publisher.publish(&ch, &job(10)).await.unwrap();
        publisher.publish(&ch, &job(10)).await.unwrap();

        let name = "delayed-10000.amqp.default.default";
        assert_eq!(ch.count(|c| matches!(c, Call::Declare(_))), 1);
        assert_eq!(ch.count(|c| matches!(c, Call::Bind { .. })), 1);
        assert_eq!(
            ch.count(|c| matches!(c, Call::Publish { routing_key, .. } if routing_key == name)),
            2
        );
        assert_eq!(
            ch.calls.lock()[1],
            Call::Bind {
                queue: name.into(),
                exchange: "amqp.default".into(),
                routing_key: name.into(),
            }
        );
    }

    #[tokio::test]
    async fn test_distinct_delays_get_distinct_queues() {
        let ch = MockChannel::default();
        let publisher = Publisher::new("ex", "q", "");

        publisher.publish(&ch, &job(1)).await.unwrap();
        publisher.publish(&ch, &job(2)).await.unwrap();

        assert_eq!(
            ch.count(|c| matches!(c, Call::Declare(_))),
            2,
            "each delay gets its own queue"
        );
    }

    #[tokio::test]
    async fn test_delay_queue_arguments() {
        let ch = MockChannel::default();
        let publisher = Publisher::new("ex", "q", "rk");
        publisher.publish(&ch, &job(3)).await.unwrap();

        let args = ch.args.lock()[0].clone();
        let get = |key: &str| {
            args.inner()
                .iter()
                .find(|(k, _)| k.as_str() == key)
                .map(|(_, v)| v.clone())
        };
        assert_eq!(get("x-message-ttl"), Some(AMQPValue::LongLongInt(3000)));
        assert_eq!(get("x-expires"), Some(AMQPValue::LongLongInt(6000)));
        assert!(get("x-dead-letter-exchange").is_some());
        assert!(get("x-dead-letter-routing-key").is_some());
    }

    #[tokio::test]
    async fn test_forget_redeclares() {
        let ch = MockChannel::default();
        let publisher = Publisher::new("ex", "q", "rk");

        publisher.publish(&ch, &job(5)).await.unwrap();
        publisher.forget();
        publisher.publish(&ch, &job(5)).await.unwrap();

        assert_eq!(ch.count(|c| matches!(c, Call::Declare(_))), 2);
    }

    #[tokio::test]
    async fn test_pool_checkout_checkin() {
        let pool: ChannelPool<u32> = ChannelPool::new(Some(7));
        {
            let ch = pool.checkout().await.unwrap();
            assert_eq!(*ch, 7);
        }
        assert_eq!(pool.drain().await, Some(7));
        assert!(pool.checkout().await.unwrap_err().is_connection_error());

        pool.checkin(9).await;
        assert_eq!(*pool.checkout().await.unwrap(), 9);
    }
}
