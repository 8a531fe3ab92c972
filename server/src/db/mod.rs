pub mod schema;

use std::sync::Arc;

use sqlx::AnyPool;
use sqlx::any::AnyPoolOptions;

/// Thin wrapper over the portable `sqlx::AnyPool`, following the teacher's
/// `backend::db::Db`. sqlite is used in dev/tests; postgres in production
/// deployments, per SPEC_FULL.md §0.
#[derive(Clone)]
pub struct Db {
    pub pool: Arc<AnyPool>,
}

impl Db {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = AnyPoolOptions::new()
            .max_connections(16)
            .connect(database_url)
            .await?;

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        schema::migrate(&self.pool).await
    }
}

/* =========================
Numeric / timestamp safety helpers
========================= */
// `AnyPool` only round-trips a small set of primitive value kinds across
// every backend, so timestamps and booleans are stored as i64 the same
// way the teacher's session repository stores bid/chunk counters.

use anyhow::anyhow;
use chrono::{DateTime, TimeZone, Utc};

pub fn ts_to_i64(dt: DateTime<Utc>) -> anyhow::Result<i64> {
    Ok(dt.timestamp_millis())
}

pub fn i64_to_ts(v: i64) -> anyhow::Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(v)
        .single()
        .ok_or_else(|| anyhow!("invalid millisecond timestamp: {v}"))
}

pub fn opt_ts_to_i64(dt: Option<DateTime<Utc>>) -> Option<i64> {
    dt.map(|d| d.timestamp_millis())
}

pub fn i64_to_opt_ts(v: Option<i64>) -> anyhow::Result<Option<DateTime<Utc>>> {
    v.map(i64_to_ts).transpose()
}

pub fn bool_to_i64(b: bool) -> i64 {
    if b { 1 } else { 0 }
}

pub fn i64_to_bool(v: i64) -> bool {
    v != 0
}

pub fn u8_to_i64(v: u8) -> i64 {
    v as i64
}

pub fn i64_to_u8(v: i64) -> anyhow::Result<u8> {
    if v < 0 || v > u8::MAX as i64 {
        return Err(anyhow!("out of range for u8: {v}"));
    }
    Ok(v as u8)
}

pub fn usize_to_i64(v: usize) -> anyhow::Result<i64> {
    if v > i64::MAX as usize {
        return Err(anyhow!("usize too large for i64: {v}"));
    }
    Ok(v as i64)
}

pub fn i64_to_usize(v: i64) -> anyhow::Result<usize> {
    if v < 0 {
        return Err(anyhow!("negative i64 where usize expected: {v}"));
    }
    Ok(v as usize)
}
