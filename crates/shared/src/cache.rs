//! Redis 计数器客户端模块
//!
//! 提供 Redis 连接管理和计数器原语封装：读写、SET NX、原子增减、存在性检查。
//! 所有写操作都是单命令原子操作，不做客户端侧的读改写。

use crate::config::RedisConfig;
use crate::error::{Result, SharedError};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tracing::{info, instrument};

/// Redis 客户端
///
/// 内部持有自动重连的 `ConnectionManager`，clone 后共享同一条多路复用连接，
/// 请求热路径上不再为每次调用建立新连接。
#[derive(Clone)]
pub struct Cache {
    conn: ConnectionManager,
}

impl Cache {
    /// 连接 Redis
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str())?;
        let conn = ConnectionManager::new(client).await?;
        info!("Redis connection manager created");
        Ok(Self { conn })
    }

    /// 健康检查
    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(SharedError::from)
    }

    /// 读取原始字符串值
    #[instrument(skip(self))]
    pub async fn get_string(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    /// 写入原始字符串值（不过期）
    #[instrument(skip(self))]
    pub async fn set_string(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(key, value).await?;
        Ok(())
    }

    /// 原子性地仅在 key 不存在时设置值（不过期）
    ///
    /// 返回 true 表示设置成功（key 不存在），false 表示 key 已存在。
    #[instrument(skip(self))]
    pub async fn set_nx(&self, key: &str, value: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let created: bool = conn.set_nx(key, value).await?;
        Ok(created)
    }

    /// 检查键是否存在
    pub async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(key).await?;
        Ok(exists)
    }

    /// 原子增加，返回增加后的值
    pub async fn incr(&self, key: &str, delta: i64) -> Result<i64> {
        let mut conn = self.conn.clone();
        let result: i64 = conn.incr(key, delta).await?;
        Ok(result)
    }

    /// 原子减少，返回减少后的值
    pub async fn decr(&self, key: &str, delta: i64) -> Result<i64> {
        let mut conn = self.conn.clone();
        let result: i64 = conn.decr(key, delta).await?;
        Ok(result)
    }
}
