//! Beanstalk text protocol client and the two-connection pool.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::backoff::ExponentialBackoff;
use crate::error::{JobsError, JobsResult};

/// Strip the `tcp://` scheme from a beanstalk address.
pub fn parse_addr(addr: &str) -> JobsResult<String> {
    match addr.split_once("://") {
        Some(("tcp", rest)) if !rest.is_empty() => Ok(rest.to_string()),
        None if !addr.is_empty() => Ok(addr.to_string()),
        Some((scheme, _)) => Err(JobsError::Config(format!(
            "unsupported beanstalk network `{scheme}`, only tcp is supported"
        ))),
        _ => Err(JobsError::Config("empty beanstalk address".into())),
    }
}

/// Parse the YAML dictionary returned by `stats-tube`.
pub fn parse_stats(raw: &str) -> HashMap<String, String> {
    raw.lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

/// A single beanstalkd connection.
pub struct Conn {
    stream: BufStream<TcpStream>,
}

impl Conn {
    /// Connect within `timeout`.
    pub async fn dial(addr: &str, timeout: Duration) -> JobsResult<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| JobsError::Connection(format!("dial {addr}: timed out")))??;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream: BufStream::new(stream),
        })
    }

    /// Say `quit` and shut the socket down.
    pub async fn close(&mut self) -> JobsResult<()> {
        // the server hangs up without replying to quit
        self.stream.write_all(b"quit\r\n").await?;
        self.stream.flush().await?;
        self.stream.shutdown().await?;
        Ok(())
    }

    /// Tube used by `put`.
    pub async fn use_tube(&mut self, tube: &str) -> JobsResult<()> {
        let reply = self.command(&format!("use {tube}"), None).await?;
        expect_prefix(&reply, "USING")
    }

    /// Watch `tube` and stop watching `default`.
    pub async fn watch_only(&mut self, tube: &str) -> JobsResult<()> {
        let reply = self.command(&format!("watch {tube}"), None).await?;
        expect_prefix(&reply, "WATCHING")?;
        if tube != "default" {
            let reply = self.command("ignore default", None).await?;
            expect_prefix(&reply, "WATCHING")?;
        }
        Ok(())
    }

    pub async fn put(&mut self, body: &[u8], pri: u32, delay: Duration, ttr: Duration) -> JobsResult<u64> {
        let line = format!(
            "put {pri} {} {} {}",
            delay.as_secs(),
            ttr.as_secs().max(1),
            body.len()
        );
        let reply = self.command(&line, Some(body)).await?;
        match reply.split_once(' ') {
            Some(("INSERTED", id)) => parse_id(id),
            Some(("BURIED", id)) => Err(JobsError::Broker(format!("job {id} buried, server out of memory"))),
            _ => Err(JobsError::Broker(reply)),
        }
    }

    /// Reserve a job; `None` when the timeout passed without one.
    pub async fn reserve(&mut self, timeout: Duration) -> JobsResult<Option<(u64, Vec<u8>)>> {
        let reply = self
            .command(&format!("reserve-with-timeout {}", timeout.as_secs()), None)
            .await?;
        let mut parts = reply.split_whitespace();
        match parts.next() {
            Some("RESERVED") => {
                let id = parse_id(parts.next().unwrap_or_default())?;
                let len = parse_len(parts.next().unwrap_or_default())?;
                let body = self.read_body(len).await?;
                Ok(Some((id, body)))
            }
            Some("TIMED_OUT") | Some("DEADLINE_SOON") => Ok(None),
            _ => Err(JobsError::Broker(reply)),
        }
    }

    pub async fn delete(&mut self, id: u64) -> JobsResult<()> {
        let reply = self.command(&format!("delete {id}"), None).await?;
        match reply.as_str() {
            "DELETED" => Ok(()),
            "NOT_FOUND" => Err(JobsError::Broker(format!("job {id} not found"))),
            _ => Err(JobsError::Broker(reply)),
        }
    }

    pub async fn stats_tube(&mut self, tube: &str) -> JobsResult<HashMap<String, String>> {
        let reply = self.command(&format!("stats-tube {tube}"), None).await?;
        match reply.split_once(' ') {
            Some(("OK", len)) => {
                let body = self.read_body(parse_len(len)?).await?;
                Ok(parse_stats(&String::from_utf8_lossy(&body)))
            }
            _ => Err(JobsError::Broker(reply)),
        }
    }

    async fn command(&mut self, line: &str, body: Option<&[u8]>) -> JobsResult<String> {
        self.stream.write_all(line.as_bytes()).await?;
        self.stream.write_all(b"\r\n").await?;
        if let Some(body) = body {
            self.stream.write_all(body).await?;
            self.stream.write_all(b"\r\n").await?;
        }
        self.stream.flush().await?;

        let mut reply = String::new();
        if self.stream.read_line(&mut reply).await? == 0 {
            return Err(JobsError::Connection("EOF".into()));
        }
        let reply = reply.trim_end().to_string();

        match reply.as_str() {
            "OUT_OF_MEMORY" | "INTERNAL_ERROR" | "BAD_FORMAT" | "UNKNOWN_COMMAND"
            | "EXPECTED_CRLF" | "JOB_TOO_BIG" | "DRAINING" => Err(JobsError::Broker(reply)),
            _ => Ok(reply),
        }
    }

    async fn read_body(&mut self, len: usize) -> JobsResult<Vec<u8>> {
        let mut buf = vec![0; len + 2];
        self.stream.read_exact(&mut buf).await?;
        buf.truncate(len);
        Ok(buf)
    }
}

fn expect_prefix(reply: &str, prefix: &str) -> JobsResult<()> {
    if reply.starts_with(prefix) {
        Ok(())
    } else {
        Err(JobsError::Broker(reply.to_string()))
    }
}

fn parse_id(s: &str) -> JobsResult<u64> {
    s.trim()
        .parse()
        .map_err(|_| JobsError::Broker(format!("invalid job id `{s}`")))
}

fn parse_len(s: &str) -> JobsResult<usize> {
    s.trim()
        .parse()
        .map_err(|_| JobsError::Broker(format!("invalid body length `{s}`")))
}

struct Conns {
    producer: Mutex<Conn>,
    consumer: Mutex<Conn>,
    generation: u64,
}

/// Producer (`use`) and consumer (`watch`) connections, redialed together.
pub struct ConnPool {
    addr: String,
    tube: String,
    timeout: Duration,
    redial_timeout: Duration,
    conns: RwLock<Conns>,
    closed: AtomicBool,
}

impl ConnPool {
    /// Dial both connections.
    pub async fn connect(
        addr: &str,
        tube: &str,
        timeout: Duration,
        redial_timeout: Duration,
    ) -> JobsResult<Self> {
        let addr = parse_addr(addr)?;
        let (producer, consumer) = Self::dial(&addr, tube, timeout).await?;
        Ok(Self {
            addr,
            tube: tube.to_string(),
            timeout,
            redial_timeout,
            conns: RwLock::new(Conns {
                producer: Mutex::new(producer),
                consumer: Mutex::new(consumer),
                generation: 0,
            }),
            closed: AtomicBool::new(false),
        })
    }

    async fn dial(addr: &str, tube: &str, timeout: Duration) -> JobsResult<(Conn, Conn)> {
        let mut producer = Conn::dial(addr, timeout).await?;
        producer.use_tube(tube).await?;
        let mut consumer = Conn::dial(addr, timeout).await?;
        consumer.watch_only(tube).await?;
        Ok((producer, consumer))
    }

    pub fn tube(&self) -> &str {
        &self.tube
    }

    pub async fn put(&self, body: &[u8], pri: u32, delay: Duration, ttr: Duration) -> JobsResult<u64> {
        let (generation, result) = {
            let conns = self.conns.read().await;
            let result = conns.producer.lock().await.put(body, pri, delay, ttr).await;
            (conns.generation, result)
        };
        match result {
            Err(e) if e.is_connection_error() => {
                self.redial(generation, &e).await?;
                let conns = self.conns.read().await;
                let result = conns.producer.lock().await.put(body, pri, delay, ttr).await;
                result
            }
            other => other,
        }
    }

    pub async fn reserve(&self, timeout: Duration) -> JobsResult<Option<(u64, Vec<u8>)>> {
        let (generation, result) = {
            let conns = self.conns.read().await;
            let result = conns.consumer.lock().await.reserve(timeout).await;
            (conns.generation, result)
        };
        match result {
            Err(e) if e.is_connection_error() => {
                self.redial(generation, &e).await?;
                let conns = self.conns.read().await;
                let result = conns.consumer.lock().await.reserve(timeout).await;
                result
            }
            other => other,
        }
    }

    /// Delete a job over the connection that reserved it.
    pub async fn delete(&self, id: u64) -> JobsResult<()> {
        let (generation, result) = {
            let conns = self.conns.read().await;
            let result = conns.consumer.lock().await.delete(id).await;
            (conns.generation, result)
        };
        match result {
            Err(e) if e.is_connection_error() => {
                self.redial(generation, &e).await?;
                let conns = self.conns.read().await;
                let result = conns.consumer.lock().await.delete(id).await;
                result
            }
            other => other,
        }
    }

    pub async fn stats(&self) -> JobsResult<HashMap<String, String>> {
        let conns = self.conns.read().await;
        let result = conns.producer.lock().await.stats_tube(&self.tube).await;
        result
    }

    /// Close both connections. Later commands fail with [`JobsError::Stopped`].
    ///
    /// Waits for a command in flight, such as a pending reserve, to return.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let conns = self.conns.write().await;
        for (role, conn) in [("producer", &conns.producer), ("consumer", &conns.consumer)] {
            if let Err(e) = conn.lock().await.close().await {
                debug!(error = %e, role, tube = %self.tube, "closing beanstalk connection");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Replace both connections unless another caller already did.
    async fn redial(&self, seen: u64, cause: &JobsError) -> JobsResult<()> {
        let mut conns = self.conns.write().await;
        if self.is_closed() {
            return Err(JobsError::Stopped);
        }
        if conns.generation != seen {
            return Ok(());
        }
        warn!(error = %cause, tube = %self.tube, "beanstalk connection lost, redialing");

        let backoff = ExponentialBackoff::with_max_elapsed(self.redial_timeout);
        let (producer, consumer) = backoff
            .retry(|| Self::dial(&self.addr, &self.tube, self.timeout))
            .await
            .map_err(|e| e.with_op("beanstalk_redial"))?;

        *conns = Conns {
            producer: Mutex::new(producer),
            consumer: Mutex::new(consumer),
            generation: seen + 1,
        };
        info!(tube = %self.tube, "beanstalk redial was successful");
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::fake::FakeServer;
    use super::*;

    #[test]
    fn test_parse_addr() {
        assert_eq!(parse_addr("tcp://127.0.0.1:11300").unwrap(), "127.0.0.1:11300");
        assert_eq!(parse_addr("localhost:11300").unwrap(), "localhost:11300");
        assert!(parse_addr("unix:///tmp/beanstalk.sock").is_err());
        assert!(parse_addr("").is_err());
    }

    #[test]
    fn test_parse_stats() {
        let raw = "---\nname: default\ncurrent-jobs-urgent: 0\ncurrent-jobs-ready: 3\ncurrent-jobs-reserved: 1\n";
        let stats = parse_stats(raw);
        assert_eq!(stats["name"], "default");
        assert_eq!(stats["current-jobs-ready"], "3");
        assert_eq!(stats["current-jobs-reserved"], "1");
        assert!(!stats.contains_key("---"));
    }

    #[tokio::test]
    async fn test_put_reserve_delete() {
        let server = FakeServer::start().await;
        let pool = ConnPool::connect(&server.addr, "jobs", Duration::from_secs(1), Duration::from_secs(1))
            .await
            .unwrap();

        let id = pool
            .put(b"hello", 1, Duration::ZERO, Duration::from_secs(30))
            .await
            .unwrap();

        let (got, body) = pool.reserve(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(got, id);
        assert_eq!(body, b"hello");

        pool.delete(id).await.unwrap();
        assert_eq!(server.state.lock().deleted, vec![id]);
    }

    #[tokio::test]
    async fn test_reserve_times_out() {
        let server = FakeServer::start().await;
        let pool = ConnPool::connect(&server.addr, "jobs", Duration::from_secs(1), Duration::from_secs(1))
            .await
            .unwrap();

        assert!(pool.reserve(Duration::ZERO).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stats() {
        let server = FakeServer::start().await;
        let pool = ConnPool::connect(&server.addr, "jobs", Duration::from_secs(1), Duration::from_secs(1))
            .await
            .unwrap();

        pool.put(b"a", 1, Duration::ZERO, Duration::from_secs(1)).await.unwrap();
        pool.put(b"b", 1, Duration::from_secs(60), Duration::from_secs(1)).await.unwrap();

        let stats = pool.stats().await.unwrap();
        assert_eq!(stats["current-jobs-ready"], "1");
        assert_eq!(stats["current-jobs-delayed"], "1");
    }

    #[tokio::test]
    async fn test_reserve_redials_after_dropped_connection() {
        let server = FakeServer::start().await;
        let pool = ConnPool::connect(&server.addr, "jobs", Duration::from_secs(1), Duration::from_secs(5))
            .await
            .unwrap();
        let id = pool
            .put(b"survivor", 1, Duration::ZERO, Duration::from_secs(30))
            .await
            .unwrap();
        server.state.lock().drop_reserves = 1;

        let (got, body) = pool.reserve(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(got, id);
        assert_eq!(body, b"survivor");
        assert_eq!(server.state.lock().drop_reserves, 0);

        // the producer connection was replaced too
        pool.put(b"next", 1, Duration::ZERO, Duration::from_secs(30)).await.unwrap();
    }

    #[tokio::test]
    async fn test_redial_gives_up() {
        let server = FakeServer::start().await;
        let pool = ConnPool::connect(&server.addr, "jobs", Duration::from_secs(1), Duration::from_millis(100))
            .await
            .unwrap();
        server.state.lock().refuse = true;

        let err = pool.reserve(Duration::from_secs(1)).await.unwrap_err();
        assert!(err.is_connection_error());
    }

    #[tokio::test]
    async fn test_close_quits_both_connections() {
        let server = FakeServer::start().await;
        let pool = ConnPool::connect(&server.addr, "jobs", Duration::from_secs(1), Duration::from_secs(5))
            .await
            .unwrap();

        pool.close().await;
        assert!(pool.is_closed());
        for _ in 0..100 {
            if server.state.lock().quits == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(server.state.lock().quits, 2);

        let err = pool
            .put(b"late", 1, Duration::ZERO, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err.root(), JobsError::Stopped));
    }

    #[tokio::test]
    async fn test_dial_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = ConnPool::connect(
            &format!("tcp://{addr}"),
            "jobs",
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .await
        .err()
        .unwrap();
        assert!(err.is_connection_error());
    }
}
