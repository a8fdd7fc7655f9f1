use std::sync::Mutex;

use redis::aio::MultiplexedConnection;
use redis::Client;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::debug;

use conveyor_core::{ConveyorError, ConveyorResult};

use super::store_err;

/// 阻塞命令专用连接池
///
/// BLMOVE 会占住整条连接直到超时，不能与共享的多路复用连接混用。
/// 每个阻塞取任务的调用独占一条连接，用完归还；超时或出错的连接直接丢弃。
pub struct BlockingPool {
    client: Client,
    idle: Mutex<Vec<MultiplexedConnection>>,
    permits: Semaphore,
}

pub struct PooledConnection<'a> {
    pool: &'a BlockingPool,
    conn: MultiplexedConnection,
    reusable: bool,
    _permit: SemaphorePermit<'a>,
}

impl BlockingPool {
    pub fn new(client: Client, size: usize) -> Self {
        Self {
            client,
            idle: Mutex::new(Vec::new()),
            permits: Semaphore::new(size.max(1)),
        }
    }

    pub async fn checkout(&self) -> ConveyorResult<PooledConnection<'_>> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| ConveyorError::Internal(format!("blocking pool closed: {e}")))?;

        let cached = self
            .idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop();
        let conn = match cached {
            Some(conn) => conn,
            None => {
                debug!("创建新的阻塞命令连接");
                self.client
                    .get_multiplexed_async_connection()
                    .await
                    .map_err(store_err)?
            }
        };

        Ok(PooledConnection {
            pool: self,
            conn,
            reusable: true,
            _permit: permit,
        })
    }
}

impl PooledConnection<'_> {
    pub fn conn(&mut self) -> &mut MultiplexedConnection {
        &mut self.conn
    }

    /// 丢弃可能残留未读响应的连接
    pub fn discard(mut self) {
        self.reusable = false;
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        if self.reusable {
            self.pool
                .idle
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(self.conn.clone());
        }
    }
}
