//! Partition ownership for consumer replicas.
//!
//! Replicas of the edit consumer share one group identity. A partition is
//! tailed by at most one replica at a time, enforced by a lease key:
//!
//! ```text
//! {topic}:{group}:lease:{p}   SET member NX PX ttl     (acquire)
//!                             renew / release only if value == member (Lua)
//! {topic}:{group}:members     ZSET member → last heartbeat (ms)
//! ```
//!
//! Every rebalance tick (ttl / 3) a replica heartbeats, counts live members
//! and aims for `ceil(partitions / live)` leases. A crashed replica's leases
//! expire after `ttl`, and another replica picks the partition up and re-reads
//! its pending entries.

use crate::error::{FanoutError, Result};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::time::Duration;

const RENEW_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Number of partitions one replica should own.
pub fn fair_share(partitions: u32, live_members: usize) -> usize {
    let live = live_members.max(1);
    (partitions as usize).div_ceil(live)
}

pub fn lease_key(topic: &str, group: &str, partition: u32) -> String {
    format!("{}:{}:lease:{}", topic, group, partition)
}

pub fn members_key(topic: &str, group: &str) -> String {
    format!("{}:{}:members", topic, group)
}

/// Lease and membership operations of one replica.
#[derive(Clone)]
pub struct PartitionLeases {
    conn: ConnectionManager,
    topic: String,
    group: String,
    member_id: String,
    ttl: Duration,
    renew: Script,
    release: Script,
}

impl PartitionLeases {
    pub fn new(
        conn: ConnectionManager,
        topic: impl Into<String>,
        group: impl Into<String>,
        member_id: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            conn,
            topic: topic.into(),
            group: group.into(),
            member_id: member_id.into(),
            ttl,
            renew: Script::new(RENEW_SCRIPT),
            release: Script::new(RELEASE_SCRIPT),
        }
    }

    pub fn member_id(&self) -> &str {
        &self.member_id
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn ttl_ms(&self) -> u64 {
        self.ttl.as_millis().max(1) as u64
    }

    /// Take the lease if nobody holds it.
    pub async fn try_acquire(&self, partition: u32) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(lease_key(&self.topic, &self.group, partition))
            .arg(&self.member_id)
            .arg("NX")
            .arg("PX")
            .arg(self.ttl_ms())
            .query_async(&mut conn)
            .await
            .map_err(|e| FanoutError::redis("SET NX", e))?;
        Ok(reply.is_some())
    }

    /// Extend a lease we hold. `false` means it was lost.
    pub async fn renew(&self, partition: u32) -> Result<bool> {
        let mut conn = self.conn.clone();
        let renewed: i64 = self
            .renew
            .key(lease_key(&self.topic, &self.group, partition))
            .arg(&self.member_id)
            .arg(self.ttl_ms())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| FanoutError::redis("lease renew", e))?;
        Ok(renewed == 1)
    }

    /// Drop a lease we hold.
    pub async fn release(&self, partition: u32) -> Result<bool> {
        let mut conn = self.conn.clone();
        let released: i64 = self
            .release
            .key(lease_key(&self.topic, &self.group, partition))
            .arg(&self.member_id)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| FanoutError::redis("lease release", e))?;
        Ok(released == 1)
    }

    /// Record liveness and prune members whose heartbeat is older than ttl.
    pub async fn heartbeat(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let key = members_key(&self.topic, &self.group);
        let now = crate::envelope::epoch_millis();
        let _: i64 = conn
            .zadd(&key, &self.member_id, now)
            .await
            .map_err(|e| FanoutError::redis("ZADD", e))?;
        let cutoff = now.saturating_sub(self.ttl_ms());
        let _: i64 = conn
            .zrembyscore(&key, 0u64, cutoff)
            .await
            .map_err(|e| FanoutError::redis("ZREMRANGEBYSCORE", e))?;
        Ok(())
    }

    /// Members with a heartbeat within ttl (at least 1: ourselves).
    pub async fn live_members(&self) -> Result<usize> {
        let mut conn = self.conn.clone();
        let cutoff = crate::envelope::epoch_millis().saturating_sub(self.ttl_ms());
        let count: usize = conn
            .zcount(members_key(&self.topic, &self.group), cutoff, "+inf")
            .await
            .map_err(|e| FanoutError::redis("ZCOUNT", e))?;
        Ok(count.max(1))
    }

    /// Remove ourselves from the membership set.
    pub async fn leave(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .zrem(members_key(&self.topic, &self.group), &self.member_id)
            .await
            .map_err(|e| FanoutError::redis("ZREM", e))?;
        Ok(())
    }
}
