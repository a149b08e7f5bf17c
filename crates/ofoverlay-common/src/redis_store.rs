//! Redis-backed flow store.
//!
//! Each table is one hash, `FLOW_TABLE|<node>|<table>`, whose fields are flow
//! ids and whose values are JSON-encoded [`FlowEntry`] values. Transactions
//! are `MULTI`/`EXEC` pipelines, so a table is never observed half-written.

use crate::flow::{FlowEntry, TablePath};
use crate::store::{FlowStore, StoreError, StoreResult, TableTransaction};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Hash key prefix for flow tables.
pub const FLOW_TABLE_PREFIX: &str = "FLOW_TABLE";

/// Configuration for the Redis connection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub db: u8,
}

impl RedisConfig {
    pub fn new(host: impl Into<String>, port: u16, db: u8) -> Self {
        Self {
            host: host.into(),
            port,
            db,
        }
    }

    fn uri(&self) -> String {
        format!("redis://{}:{}/{}", self.host, self.port, self.db)
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self::new("127.0.0.1", 6379, 0)
    }
}

fn table_key(path: &TablePath) -> String {
    format!("{}|{}", FLOW_TABLE_PREFIX, path)
}

/// Hash content split into decodable flows and fields that are not flows.
#[derive(Debug, Default, PartialEq)]
struct DecodedTable {
    flows: Vec<FlowEntry>,
    corrupt: Vec<String>,
}

/// Decodes a table hash. Values that do not parse, or that carry an id
/// other than their field name, are set aside as corrupt.
fn decode_table(path: &TablePath, raw: HashMap<String, String>) -> DecodedTable {
    let mut table = DecodedTable::default();
    for (field, json) in raw {
        match serde_json::from_str::<FlowEntry>(&json) {
            Ok(flow) if flow.id.as_str() == field => table.flows.push(flow),
            Ok(flow) => {
                warn!(table = %path, field = %field, id = %flow.id, "Stored flow id does not match its field");
                table.corrupt.push(field);
            }
            Err(e) => {
                warn!(table = %path, field = %field, error = %e, "Undecodable stored flow");
                table.corrupt.push(field);
            }
        }
    }
    table.flows.sort_by(|a, b| a.id.cmp(&b.id));
    table.corrupt.sort();
    table
}

fn encode_flow(flow: &FlowEntry) -> StoreResult<String> {
    serde_json::to_string(flow).map_err(|e| StoreError::Codec(format!("flow {}: {}", flow.id, e)))
}

/// Flow store on a Redis database.
#[derive(Clone)]
pub struct RedisFlowStore {
    config: RedisConfig,
    connection: ConnectionManager,
}

impl RedisFlowStore {
    /// Connects to Redis; the connection manager reconnects on its own.
    pub async fn connect(config: RedisConfig) -> StoreResult<Self> {
        let uri = config.uri();
        let client = redis::Client::open(uri.clone())
            .map_err(|e| StoreError::Connection(format!("{}: {}", uri, e)))?;
        let connection = client
            .get_connection_manager()
            .await
            .map_err(|e| StoreError::Connection(format!("{}: {}", uri, e)))?;

        info!(host = %config.host, port = config.port, db = config.db, "Connected flow store to Redis");
        Ok(Self { config, connection })
    }

    pub fn config(&self) -> &RedisConfig {
        &self.config
    }
}

#[async_trait]
impl FlowStore for RedisFlowStore {
    async fn read_table(&self, path: &TablePath) -> StoreResult<Option<Vec<FlowEntry>>> {
        let mut conn = self.connection.clone();
        let raw: HashMap<String, String> =
            conn.hgetall(table_key(path)).await.map_err(|e| StoreError::Read {
                path: path.clone(),
                message: e.to_string(),
            })?;

        // Redis drops empty hashes, so an empty reply means the table is absent.
        if raw.is_empty() {
            return Ok(None);
        }
        let table = decode_table(path, raw);
        if !table.corrupt.is_empty() {
            // The diff never sees these fields, so drop them here; the
            // caller then rewrites whatever it still wants.
            let result: redis::RedisResult<()> = conn.hdel(table_key(path), &table.corrupt).await;
            match result {
                Ok(()) => warn!(table = %path, removed = table.corrupt.len(), "Removed undecodable flows"),
                Err(e) => warn!(table = %path, error = %e, "Failed to remove undecodable flows"),
            }
            if table.flows.is_empty() {
                return Ok(None);
            }
        }
        Ok(Some(table.flows))
    }

    async fn submit(&self, txn: TableTransaction) -> StoreResult<()> {
        if txn.is_empty() {
            return Ok(());
        }

        let key = table_key(&txn.path);
        let mut pipe = redis::pipe();
        pipe.atomic();
        for id in &txn.deletes {
            pipe.hdel(&key, id.as_str()).ignore();
        }
        for flow in &txn.puts {
            pipe.hset(&key, flow.id.as_str(), encode_flow(flow)?).ignore();
        }

        let mut conn = self.connection.clone();
        let _: () = pipe.query_async(&mut conn).await.map_err(|e| StoreError::Commit {
            path: txn.path.clone(),
            message: e.to_string(),
        })?;

        debug!(table = %txn.path, deletes = txn.deletes.len(), puts = txn.puts.len(), "Committed flow table");
        Ok(())
    }

    async fn delete_table(&self, path: &TablePath) -> StoreResult<()> {
        let mut conn = self.connection.clone();
        let _: () = conn.del(table_key(path)).await.map_err(|e| StoreError::Commit {
            path: path.clone(),
            message: e.to_string(),
        })?;
        Ok(())
    }
}
