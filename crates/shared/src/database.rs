//! PostgreSQL 连接池
//!
//! 发放处理器的并发事务数受 worker 数约束，连接池上限只需略大于 worker 数
//! 加上 HTTP 取消请求的并发量。

use crate::config::DatabaseConfig;
use crate::error::Result;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, instrument};

/// 数据库连接池包装
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// 建立连接池
    #[instrument(skip(config), fields(max_connections = config.max_connections))]
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .idle_timeout(Duration::from_secs(config.idle_timeout_seconds))
            .connect(&config.url)
            .await?;

        info!("数据库连接池已建立");
        Ok(Self { pool })
    }

    /// 服务启动入口：建立连接池、探活，按配置执行迁移
    pub async fn init(config: &DatabaseConfig) -> Result<Self> {
        let db = Self::connect(config).await?;
        db.health_check().await?;
        if config.run_migrations {
            db.run_migrations().await?;
        }
        Ok(db)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// 探活查询
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// 执行仓库根目录 migrations/ 下的迁移脚本
    ///
    /// 脚本在编译期嵌入二进制，已执行的版本由 `_sqlx_migrations` 表跳过。
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("数据库迁移已执行");
        Ok(())
    }

    /// 等待在途连接归还后关闭
    pub async fn close(&self) {
        self.pool.close().await;
        info!("数据库连接池已关闭");
    }
}
