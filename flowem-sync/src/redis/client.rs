use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::{
    net::TcpStream,
    sync::{OwnedSemaphorePermit, Semaphore},
    time::timeout,
};
use tokio_util::codec::Framed;
use tracing::{debug, trace};

use super::codec::{Command, RespCodec, RespError, RespValue};
use crate::{Directory, DirectoryError, Versioned};

/// Keys fetched per `SCAN` round trip.
const SCAN_COUNT: &str = "256";

pub(crate) type Connection = Framed<TcpStream, RespCodec>;

impl From<RespError> for DirectoryError {
    fn from(e: RespError) -> Self {
        match e {
            RespError::Io(e) => Self::Io(e),
            RespError::Protocol(msg) => Self::Protocol(msg),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RedisOptions {
    /// `host:port` of the server.
    pub addr: String,
    pub password: Option<String>,
    /// Logical database selected on every connection.
    pub db: u32,
    /// Maximum number of connections open at once.
    pub pool_size: usize,
    pub dial_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

impl Default for RedisOptions {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:6379".to_string(),
            password: None,
            db: 0,
            pool_size: 16,
            dial_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(3),
            write_timeout: Duration::from_secs(3),
        }
    }
}

async fn within<T, E>(
    limit: Duration,
    what: &'static str,
    fut: impl Future<Output = Result<T, E>>,
) -> Result<T, DirectoryError>
where
    DirectoryError: From<E>,
{
    timeout(limit, fut).await.map_err(|_| DirectoryError::Timeout(what))?.map_err(Into::into)
}

/// Sends `cmd` on `conn` and waits for its reply. Error replies become
/// [`DirectoryError::Server`].
pub(crate) async fn request(
    conn: &mut Connection,
    options: &RedisOptions,
    cmd: Command,
) -> Result<RespValue, DirectoryError> {
    within(options.write_timeout, "write", conn.send(cmd)).await?;

    let reply = timeout(options.read_timeout, conn.next())
        .await
        .map_err(|_| DirectoryError::Timeout("read"))?
        .ok_or_else(|| DirectoryError::Unavailable("connection closed by server".into()))??;

    match reply {
        RespValue::Error(msg) => Err(DirectoryError::Server(msg)),
        reply => Ok(reply),
    }
}

/// Opens a connection, authenticating and selecting the database if configured.
pub(crate) async fn dial(options: &RedisOptions) -> Result<Connection, DirectoryError> {
    let stream = timeout(options.dial_timeout, TcpStream::connect(&options.addr))
        .await
        .map_err(|_| DirectoryError::Timeout("dial"))?
        .map_err(|e| DirectoryError::Unavailable(format!("{}: {e}", options.addr)))?;
    stream.set_nodelay(true)?;

    let mut conn = Framed::new(stream, RespCodec);

    if let Some(password) = &options.password {
        request(&mut conn, options, Command::new("AUTH").arg(password.clone())).await?;
    }

    if options.db != 0 {
        request(&mut conn, options, Command::new("SELECT").arg(options.db.to_string())).await?;
    }

    debug!(addr = %options.addr, db = options.db, "connected to directory");
    Ok(conn)
}

struct Pool {
    options: RedisOptions,
    idle: Mutex<Vec<Connection>>,
    permits: Arc<Semaphore>,
}

/// A connection checked out of the pool. Returned on drop unless it failed.
struct Pooled {
    conn: Option<Connection>,
    pool: Arc<Pool>,
    _permit: OwnedSemaphorePermit,
}

impl Pooled {
    async fn request(&mut self, cmd: Command) -> Result<RespValue, DirectoryError> {
        let Some(conn) = self.conn.as_mut() else {
            return Err(DirectoryError::Unavailable("connection discarded".into()));
        };

        match request(conn, &self.pool.options, cmd).await {
            // The connection is still in a known state after an error reply.
            Err(e @ DirectoryError::Server(_)) => Err(e),
            Err(e) => {
                // Anything else may leave a reply in flight: never reuse the connection.
                self.conn = None;
                Err(e)
            }
            ok => ok,
        }
    }
}

impl Drop for Pooled {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.idle.lock().push(conn);
        }
    }
}

/// A link directory backed by Redis.
///
/// Connections are pooled: at most `pool_size` requests are in flight, each on its own
/// connection. Redis exposes no revisions, so values are returned unversioned.
#[derive(Clone)]
pub struct RedisDirectory {
    pool: Arc<Pool>,
}

impl std::fmt::Debug for RedisDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisDirectory")
            .field("addr", &self.pool.options.addr)
            .field("idle", &self.pool.idle.lock().len())
            .finish()
    }
}

impl RedisDirectory {
    pub fn new(options: RedisOptions) -> Self {
        let permits = Arc::new(Semaphore::new(options.pool_size.max(1)));
        Self { pool: Arc::new(Pool { options, idle: Mutex::new(Vec::new()), permits }) }
    }

    /// Creates the client and checks the server is reachable.
    pub async fn connect(options: RedisOptions) -> Result<Self, DirectoryError> {
        let this = Self::new(options);
        this.ping().await?;
        Ok(this)
    }

    pub fn options(&self) -> &RedisOptions {
        &self.pool.options
    }

    pub async fn ping(&self) -> Result<(), DirectoryError> {
        match self.checkout().await?.request(Command::new("PING")).await? {
            RespValue::Simple(pong) if pong == "PONG" => Ok(()),
            other => Err(DirectoryError::Protocol(format!("unexpected PING reply {other:?}"))),
        }
    }

    async fn checkout(&self) -> Result<Pooled, DirectoryError> {
        let permit = Arc::clone(&self.pool.permits)
            .acquire_owned()
            .await
            .map_err(|_| DirectoryError::Unavailable("connection pool closed".into()))?;

        let idle = self.pool.idle.lock().pop();
        let conn = match idle {
            Some(conn) => conn,
            None => dial(&self.pool.options).await?,
        };

        Ok(Pooled { conn: Some(conn), pool: Arc::clone(&self.pool), _permit: permit })
    }

    async fn request(&self, cmd: Command) -> Result<RespValue, DirectoryError> {
        trace!(cmd = %String::from_utf8_lossy(cmd.name()), "request");
        self.checkout().await?.request(cmd).await
    }
}

/// Escapes glob metacharacters so `prefix` matches literally in `SCAN MATCH`.
fn escape_glob(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('*');
    out
}

fn unexpected(cmd: &str, reply: RespValue) -> DirectoryError {
    DirectoryError::Protocol(format!("unexpected {cmd} reply {reply:?}"))
}

#[async_trait]
impl Directory for RedisDirectory {
    async fn put(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<(), DirectoryError> {
        let mut cmd = Command::new("SET").arg(key.to_string()).arg(value);
        if let Some(ttl) = ttl {
            cmd = cmd.arg("EX").arg(ttl.as_secs().max(1).to_string());
        }

        match self.request(cmd).await? {
            RespValue::Simple(ok) if ok == "OK" => Ok(()),
            other => Err(unexpected("SET", other)),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<Versioned<String>>, DirectoryError> {
        match self.request(Command::new("GET").arg(key.to_string())).await? {
            RespValue::Bulk(None) => Ok(None),
            RespValue::Bulk(Some(raw)) => {
                let value = String::from_utf8(raw.to_vec())
                    .map_err(|_| DirectoryError::Protocol(format!("value of {key} is not UTF-8")))?;
                Ok(Some(Versioned { revision: None, value }))
            }
            other => Err(unexpected("GET", other)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, DirectoryError> {
        let pattern = escape_glob(prefix);
        let mut cursor = "0".to_string();
        let mut keys = Vec::new();

        // Keys come back in batches until the cursor wraps to 0, possibly with duplicates.
        loop {
            let cmd = Command::new("SCAN")
                .arg(cursor.clone())
                .arg("MATCH")
                .arg(pattern.clone())
                .arg("COUNT")
                .arg(SCAN_COUNT);

            let reply = self.request(cmd).await?;
            let RespValue::Array(Some(mut parts)) = reply else {
                return Err(unexpected("SCAN", reply));
            };
            if parts.len() != 2 {
                return Err(unexpected("SCAN", RespValue::Array(Some(parts))));
            }

            let batch = parts.pop();
            let next = parts.pop();

            cursor = match next.as_ref().and_then(RespValue::as_str) {
                Some(next) => next.to_string(),
                None => return Err(DirectoryError::Protocol("SCAN cursor missing".into())),
            };

            if let Some(RespValue::Array(Some(batch))) = batch {
                keys.extend(batch.iter().filter_map(RespValue::as_str).map(str::to_string));
            }

            if cursor == "0" {
                break;
            }
        }

        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<bool, DirectoryError> {
        match self.request(Command::new("DEL").arg(key.to_string())).await? {
            RespValue::Integer(n) => Ok(n > 0),
            other => Err(unexpected("DEL", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use super::*;

    #[test]
    fn scan_patterns_match_prefixes_literally() {
        assert_eq!(escape_glob("network_link:"), "network_link:*");
        assert_eq!(escape_glob("a*b?[c]"), "a\\*b\\?\\[c\\]*");
    }

    /// Serves canned replies, one per request, on a single connection.
    async fn fake_server(replies: Vec<&'static [u8]>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            for reply in replies {
                let _ = socket.read(&mut buf).await.unwrap();
                socket.write_all(reply).await.unwrap();
            }
        });

        addr
    }

    fn options(addr: String) -> RedisOptions {
        RedisOptions { addr, pool_size: 1, ..Default::default() }
    }

    #[tokio::test]
    async fn get_put_delete() {
        let addr = fake_server(vec![
            b"+PONG\r\n",
            b"+OK\r\n",
            b"$2\r\n{}\r\n",
            b"$-1\r\n",
            b":1\r\n",
        ])
        .await;

        let dir = RedisDirectory::connect(options(addr)).await.unwrap();
        dir.put("network_link:1", "{}".into(), Some(Duration::from_secs(60))).await.unwrap();

        let value = dir.get("network_link:1").await.unwrap().unwrap();
        assert_eq!(value, Versioned { revision: None, value: "{}".to_string() });
        assert_eq!(dir.get("network_link:2").await.unwrap(), None);
        assert!(dir.delete("network_link:1").await.unwrap());
    }

    #[tokio::test]
    async fn list_follows_the_cursor() {
        let addr = fake_server(vec![
            b"*2\r\n$2\r\n17\r\n*1\r\n$14\r\nnetwork_link:2\r\n",
            b"*2\r\n$1\r\n0\r\n*2\r\n$14\r\nnetwork_link:1\r\n$14\r\nnetwork_link:2\r\n",
        ])
        .await;

        let dir = RedisDirectory::new(options(addr));
        assert_eq!(dir.list("network_link:").await.unwrap(), vec!["network_link:1", "network_link:2"]);
    }

    #[tokio::test]
    async fn error_replies_are_permanent() {
        let addr = fake_server(vec![b"-WRONGTYPE Operation against a key\r\n"]).await;

        let dir = RedisDirectory::new(options(addr));
        let err = dir.get("network_link:1").await.unwrap_err();
        assert!(matches!(err, DirectoryError::Server(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn unreachable_server_is_transient() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = RedisDirectory::connect(options(addr)).await.unwrap_err();
        assert!(err.is_transient(), "{err:?}");
    }
}
