use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::{sync::mpsc, time::timeout};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, trace, warn};

use flowem_common::ExponentialBackoff;
use flowem_wire::ChangeEvent;

use super::{
    client::{dial, Connection},
    codec::{Command, RespValue},
    RedisOptions,
};
use crate::{ChangeFeed, ChangeStream, DirectoryError};

/// Notifications buffered between the subscription task and the consumer.
const FEED_BUFFER: usize = 1024;

/// The keyspace event notifications of a Redis server.
///
/// The server must publish keyevent notifications for generic and string commands and
/// expirations (`notify-keyspace-events` containing at least `E$gx`). Each subscription owns a
/// dedicated connection. When it drops, the subscription reconnects with exponential backoff;
/// notifications published in the meantime are lost.
#[derive(Debug, Clone)]
pub struct RedisFeed {
    options: RedisOptions,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl RedisFeed {
    pub fn new(options: RedisOptions) -> Self {
        Self { options, initial_backoff: Duration::from_millis(100), max_backoff: Duration::from_secs(10) }
    }

    /// Sets the reconnect backoff bounds.
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }
}

/// Opens a connection and subscribes it to `patterns`.
async fn psubscribe(options: &RedisOptions, patterns: &[String]) -> Result<Connection, DirectoryError> {
    let mut conn = dial(options).await?;

    let cmd = patterns.iter().fold(Command::new("PSUBSCRIBE"), |cmd, p| cmd.arg(p.clone()));
    timeout(options.write_timeout, conn.send(cmd))
        .await
        .map_err(|_| DirectoryError::Timeout("write"))??;

    // One confirmation per pattern.
    for _ in patterns {
        let reply = timeout(options.read_timeout, conn.next())
            .await
            .map_err(|_| DirectoryError::Timeout("read"))?
            .ok_or_else(|| DirectoryError::Unavailable("connection closed by server".into()))??;

        match reply {
            RespValue::Array(Some(parts))
                if parts.first().and_then(RespValue::as_str) == Some("psubscribe") => {}
            RespValue::Error(msg) => return Err(DirectoryError::Server(msg)),
            other => {
                return Err(DirectoryError::Protocol(format!("unexpected PSUBSCRIBE reply {other:?}")))
            }
        }
    }

    debug!(?patterns, "subscribed to change feed");
    Ok(conn)
}

/// Decodes a pushed `pmessage`. Returns `None` for anything else.
fn notification(value: RespValue) -> Option<(String, String)> {
    let RespValue::Array(Some(parts)) = value else {
        return None;
    };

    match parts.as_slice() {
        [kind, _pattern, channel, payload] if kind.as_str() == Some("pmessage") => {
            Some((channel.as_str()?.to_string(), payload.as_str()?.to_string()))
        }
        _ => None,
    }
}

enum Exit {
    /// The consumer dropped the stream.
    Closed,
    /// The connection failed.
    Disconnected(String),
}

/// Forwards notifications from `conn` until it fails or the consumer goes away.
async fn forward(conn: &mut Connection, tx: &mpsc::Sender<ChangeEvent>) -> Exit {
    loop {
        let item = tokio::select! {
            _ = tx.closed() => return Exit::Closed,
            item = conn.next() => item,
        };

        let value = match item {
            Some(Ok(value)) => value,
            Some(Err(e)) => return Exit::Disconnected(e.to_string()),
            None => return Exit::Disconnected("connection closed by server".into()),
        };

        let Some((channel, payload)) = notification(value) else {
            continue;
        };

        match ChangeEvent::from_notification(&channel, &payload) {
            Ok(event) => {
                if tx.send(event).await.is_err() {
                    return Exit::Closed;
                }
            }
            // Other commands (expire, rename...) publish on the same namespace.
            Err(e) => trace!(%channel, key = %payload, err = %e, "ignoring notification"),
        }
    }
}

#[async_trait]
impl ChangeFeed for RedisFeed {
    async fn subscribe(&self, patterns: &[String]) -> Result<ChangeStream, DirectoryError> {
        // The first subscription is made up front so configuration errors surface here.
        let mut conn = psubscribe(&self.options, patterns).await?;

        let (tx, rx) = mpsc::channel(FEED_BUFFER);
        let options = self.options.clone();
        let patterns = patterns.to_vec();
        let (initial, max) = (self.initial_backoff, self.max_backoff);

        tokio::spawn(async move {
            loop {
                let reason = match forward(&mut conn, &tx).await {
                    Exit::Closed => break,
                    Exit::Disconnected(reason) => reason,
                };

                warn!(
                    %reason,
                    "change feed disconnected, notifications missed until reconnection are repaired by reconciliation"
                );

                let mut backoff = ExponentialBackoff::new(initial, None).with_max_backoff(max);
                conn = loop {
                    tokio::select! {
                        _ = tx.closed() => return,
                        _ = backoff.next() => {}
                    }

                    match psubscribe(&options, &patterns).await {
                        Ok(conn) => break conn,
                        Err(e) => {
                            debug!(err = %e, retries = backoff.retries(), "change feed reconnect failed")
                        }
                    }
                };

                info!("change feed reconnected");
            }

            debug!("change feed subscription closed");
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn bulk(s: &str) -> RespValue {
        RespValue::Bulk(Some(Bytes::copy_from_slice(s.as_bytes())))
    }

    #[test]
    fn decodes_pmessages() {
        let msg = RespValue::Array(Some(vec![
            bulk("pmessage"),
            bulk("__keyevent@0__:*"),
            bulk("__keyevent@0__:expired"),
            bulk("network_link:3"),
        ]));

        assert_eq!(
            notification(msg),
            Some(("__keyevent@0__:expired".to_string(), "network_link:3".to_string()))
        );
    }

    #[test]
    fn ignores_other_pushes() {
        let confirmation = RespValue::Array(Some(vec![
            bulk("psubscribe"),
            bulk("__keyevent@0__:*"),
            RespValue::Integer(1),
        ]));
        assert_eq!(notification(confirmation), None);
        assert_eq!(notification(RespValue::Simple("PONG".into())), None);
    }
}
