//! Redis-backed store. The compound operations run as Lua scripts, which Redis
//! executes without interleaving any other client's commands.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{AsyncCommands, Script};
use tokio::sync::Mutex;

use super::{Dest, Fields, Source, Store, Transfer};
use crate::error::Result;

/// Doorbells are capped so rings nobody waits for can't pile up.
const DOORBELL_CAP: isize = 64;

// KEYS[1] = record, KEYS[2] = list
// ARGV[1] = member, ARGV[2..] = field/value pairs
const INSERT_AND_PUSH: &str = r"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return 0
end
redis.call('HSET', KEYS[1], unpack(ARGV, 2))
redis.call('LPUSH', KEYS[2], ARGV[1])
return 1
";

// KEYS[1..n-1] = source lists in order, KEYS[n] = destination list
const MOVE_FIRST: &str = r"
local dest = KEYS[#KEYS]
for i = 1, #KEYS - 1 do
    local member = redis.call('RPOPLPUSH', KEYS[i], dest)
    if member then
        return member
    end
end
return false
";

// KEYS[1] = source, KEYS[2] = destination, KEYS[3] = record
// ARGV[1] = member, ARGV[2] = source kind, ARGV[3] = destination kind,
// ARGV[4] = score, ARGV[5..] = field/value pairs
const TRANSFER: &str = r"
local removed
if ARGV[2] == 'zset' then
    removed = redis.call('ZREM', KEYS[1], ARGV[1])
else
    removed = redis.call('LREM', KEYS[1], 1, ARGV[1])
end
if removed == 0 then
    return 0
end
if ARGV[3] == 'list' then
    redis.call('LPUSH', KEYS[2], ARGV[1])
elseif ARGV[3] == 'zset' then
    redis.call('ZADD', KEYS[2], ARGV[4], ARGV[1])
end
if #ARGV > 4 then
    redis.call('HSET', KEYS[3], unpack(ARGV, 5))
end
return 1
";

#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    conn: ConnectionManager,
    /// Held by one doorbell waiter at a time, since a blocking pop stalls
    /// every command queued behind it. Reopened after an error.
    blocking: Arc<Mutex<Option<MultiplexedConnection>>>,
    insert_and_push: Script,
    move_first: Script,
    transfer: Script,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        Ok(Self {
            client,
            conn,
            blocking: Arc::default(),
            insert_and_push: Script::new(INSERT_AND_PUSH),
            move_first: Script::new(MOVE_FIRST),
            transfer: Script::new(TRANSFER),
        })
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn read(&self, key: &str) -> Result<Option<Fields>> {
        let mut conn = self.conn.clone();
        let fields: Fields = conn.hgetall(key).await?;
        Ok(if fields.is_empty() { None } else { Some(fields) })
    }

    async fn write(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: () = conn.hset_multiple(key, fields).await?;
        Ok(())
    }

    async fn insert_and_push(
        &self,
        key: &str,
        fields: &[(String, String)],
        list: &str,
        member: &str,
    ) -> Result<bool> {
        let mut conn = self.conn.clone();
        let mut invocation = self.insert_and_push.key(key);
        invocation.key(list).arg(member);
        for (k, v) in fields {
            invocation.arg(k).arg(v);
        }
        let inserted: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(inserted == 1)
    }

    async fn move_first(
        &self,
        sources: &[String],
        dest: &str,
    ) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let mut invocation = self.move_first.prepare_invoke();
        for source in sources {
            invocation.key(source);
        }
        invocation.key(dest);
        let member: Option<String> = invocation.invoke_async(&mut conn).await?;
        Ok(member)
    }

    async fn transfer(&self, t: &Transfer) -> Result<bool> {
        let (source, source_kind) = match &t.from {
            Source::List(key) => (key, "list"),
            Source::Scheduled(key) => (key, "zset"),
        };
        // Redis wants every touched key declared, so `Nowhere` names the
        // source again as a placeholder.
        let (dest, dest_kind, score) = match &t.to {
            Dest::List(key) => (key, "list", 0),
            Dest::Scheduled(key, score) => (key, "zset", *score),
            Dest::Nowhere => (source, "none", 0),
        };

        // Likewise for a transfer that writes no record.
        let record = if t.fields.is_empty() { source } else { &t.record };

        let mut conn = self.conn.clone();
        let mut invocation = self.transfer.key(source);
        invocation
            .key(dest)
            .key(record)
            .arg(&t.member)
            .arg(source_kind)
            .arg(dest_kind)
            .arg(score);
        for (k, v) in &t.fields {
            invocation.arg(k).arg(v);
        }
        let moved: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(moved == 1)
    }

    async fn push(&self, list: &str, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.lpush(list, member).await?;
        Ok(())
    }

    async fn members(&self, list: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn.lrange(list, 0, -1).await?;
        Ok(members)
    }

    async fn len(&self, list: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let len: u64 = conn.llen(list).await?;
        Ok(len)
    }

    async fn schedule(&self, set: &str, member: &str, score: i64) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.zadd(set, member, score).await?;
        Ok(())
    }

    async fn due(
        &self,
        set: &str,
        max_score: i64,
        limit: usize,
    ) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn
            .zrangebyscore_limit(set, "-inf", max_score, 0, limit as isize)
            .await?;
        Ok(members)
    }

    async fn unschedule(&self, set: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.zrem(set, member).await?;
        Ok(removed == 1)
    }

    async fn scheduled_len(&self, set: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let len: u64 = conn.zcard(set).await?;
        Ok(len)
    }

    async fn ring(&self, bell: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .lpush(bell, 1)
            .ignore()
            .ltrim(bell, 0, DOORBELL_CAP - 1)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn wait(&self, bell: &str, timeout: Duration) -> Result<()> {
        // Another clone is already waiting; coming back empty just means
        // "look again".
        let Ok(mut slot) =
            tokio::time::timeout(timeout, self.blocking.lock()).await
        else {
            return Ok(());
        };
        let mut conn = match slot.take() {
            Some(conn) => conn,
            None => self.client.get_multiplexed_async_connection().await?,
        };
        let _: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(bell)
            .arg(timeout.as_secs_f64())
            .query_async(&mut conn)
            .await?;
        *slot = Some(conn);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use uuid::Uuid;

    use super::*;

    fn redis_url() -> String {
        std::env::var("BATCHQ_REDIS_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
    }

    /// A store plus a key prefix nothing else uses.
    async fn store() -> (RedisStore, String) {
        let store = RedisStore::connect(&redis_url())
            .await
            .expect("failed to connect to Redis");
        let ns = format!("batchq_test_{}", Uuid::new_v4().simple());
        (store, ns)
    }

    async fn cleanup(store: &RedisStore, ns: &str) {
        let mut conn = store.conn.clone();
        let keys: Vec<String> =
            conn.keys(format!("{ns}:*")).await.unwrap();
        if !keys.is_empty() {
            let _: () = conn.del(keys).await.unwrap();
        }
    }

    fn fields(status: &str) -> Vec<(String, String)> {
        vec![("status".to_string(), status.to_string())]
    }

    #[tokio::test]
    #[ignore = "requires running Redis server"]
    async fn test_insert_and_push_rejects_duplicates() {
        let (store, ns) = store().await;
        let record = format!("{ns}:job:a");
        let queue = format!("{ns}:queue:p5");

        assert!(store
            .insert_and_push(&record, &fields("queued"), &queue, "a")
            .await
            .unwrap());
        assert!(!store
            .insert_and_push(&record, &fields("running"), &queue, "a")
            .await
            .unwrap());

        let read = store.read(&record).await.unwrap().unwrap();
        assert_eq!(read["status"], "queued");
        assert_eq!(store.members(&queue).await.unwrap(), vec!["a"]);
        assert_eq!(store.read(&format!("{ns}:job:b")).await.unwrap(), None);

        cleanup(&store, &ns).await;
    }

    #[tokio::test]
    #[ignore = "requires running Redis server"]
    async fn test_move_first_drains_in_order() {
        let (store, ns) = store().await;
        let high = format!("{ns}:queue:p9");
        let low = format!("{ns}:queue:p2");
        let processing = format!("{ns}:processing:w1");
        let sources = [high.clone(), low.clone()];

        store.push(&low, "l1").await.unwrap();
        store.push(&high, "h1").await.unwrap();
        store.push(&high, "h2").await.unwrap();

        let mut taken = Vec::new();
        while let Some(member) =
            store.move_first(&sources, &processing).await.unwrap()
        {
            taken.push(member);
        }
        assert_eq!(taken, vec!["h1", "h2", "l1"]);
        assert_eq!(
            store.members(&processing).await.unwrap(),
            vec!["l1", "h2", "h1"]
        );
        assert_eq!(store.len(&high).await.unwrap(), 0);

        cleanup(&store, &ns).await;
    }

    #[tokio::test]
    #[ignore = "requires running Redis server"]
    async fn test_transfer_from_list_succeeds_once() {
        let (store, ns) = store().await;
        let queue = format!("{ns}:queue:p5");
        let record = format!("{ns}:job:a");
        store.push(&queue, "a").await.unwrap();

        let transfer = |worker: &str| Transfer {
            member: "a".to_string(),
            from: Source::List(queue.clone()),
            to: Dest::List(format!("{ns}:processing:{worker}")),
            record: record.clone(),
            fields: fields(worker),
        };
        let (t1, t2) = (transfer("w1"), transfer("w2"));
        let (first, second) =
            tokio::join!(store.transfer(&t1), store.transfer(&t2));
        let (first, second) = (first.unwrap(), second.unwrap());
        assert!(first ^ second, "exactly one transfer must win");

        let winner = if first { "w1" } else { "w2" };
        let read = store.read(&record).await.unwrap().unwrap();
        assert_eq!(read["status"], winner);
        assert_eq!(
            store
                .members(&format!("{ns}:processing:{winner}"))
                .await
                .unwrap(),
            vec!["a"]
        );
        assert_eq!(store.len(&queue).await.unwrap(), 0);

        cleanup(&store, &ns).await;
    }

    #[tokio::test]
    #[ignore = "requires running Redis server"]
    async fn test_transfer_from_sorted_set_succeeds_once() {
        let (store, ns) = store().await;
        let delayed = format!("{ns}:delayed");
        let queue = format!("{ns}:queue:p5");
        let record = format!("{ns}:job:a");
        store.schedule(&delayed, "a", 100).await.unwrap();

        let requeue = Transfer {
            member: "a".to_string(),
            from: Source::Scheduled(delayed.clone()),
            to: Dest::List(queue.clone()),
            record: record.clone(),
            fields: fields("queued"),
        };
        let (first, second) =
            tokio::join!(store.transfer(&requeue), store.transfer(&requeue));
        assert!(first.unwrap() ^ second.unwrap());
        assert_eq!(store.members(&queue).await.unwrap(), vec!["a"]);
        assert_eq!(store.scheduled_len(&delayed).await.unwrap(), 0);

        // Dropping a member with no fields leaves no record behind.
        let done = Transfer {
            member: "a".to_string(),
            from: Source::List(queue.clone()),
            to: Dest::Nowhere,
            record: format!("{ns}:job:unused"),
            fields: Vec::new(),
        };
        assert!(store.transfer(&done).await.unwrap());
        assert!(!store.transfer(&done).await.unwrap());
        assert_eq!(store.len(&queue).await.unwrap(), 0);
        assert_eq!(
            store.read(&format!("{ns}:job:unused")).await.unwrap(),
            None
        );

        cleanup(&store, &ns).await;
    }

    #[tokio::test]
    #[ignore = "requires running Redis server"]
    async fn test_due_orders_by_score() {
        let (store, ns) = store().await;
        let delayed = format!("{ns}:delayed");
        for (member, score) in [("c", 30), ("a", 10), ("d", 40), ("b", 20)] {
            store.schedule(&delayed, member, score).await.unwrap();
        }

        assert_eq!(
            store.due(&delayed, 30, 10).await.unwrap(),
            vec!["a", "b", "c"]
        );
        assert_eq!(store.due(&delayed, 30, 2).await.unwrap(), vec!["a", "b"]);
        assert!(store.due(&delayed, 5, 10).await.unwrap().is_empty());

        assert!(store.unschedule(&delayed, "a").await.unwrap());
        assert!(!store.unschedule(&delayed, "a").await.unwrap());
        assert_eq!(store.scheduled_len(&delayed).await.unwrap(), 3);

        cleanup(&store, &ns).await;
    }

    #[tokio::test]
    #[ignore = "requires running Redis server"]
    async fn test_ring_wakes_waiter() {
        let (store, ns) = store().await;
        let bell = format!("{ns}:doorbell");

        let waiter = {
            let store = store.clone();
            let bell = bell.clone();
            tokio::spawn(async move {
                let started = Instant::now();
                store.wait(&bell, Duration::from_secs(10)).await.unwrap();
                started.elapsed()
            })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        store.ring(&bell).await.unwrap();
        let waited = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(waited < Duration::from_secs(5));

        // Nobody rings: the wait runs out on its own, reusing the connection.
        let started = Instant::now();
        store.wait(&bell, Duration::from_secs(1)).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(900));

        cleanup(&store, &ns).await;
    }
}
