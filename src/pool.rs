//! 连接数上限控制
//!
//! reqwest 只提供每个 host 的空闲连接上限，这里用信号量限制在途请求数：
//! 每个路由（scheme://host:port）一份配额，所有路由共享一份总配额。

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

type RouteMap = Arc<Mutex<HashMap<String, Arc<Semaphore>>>>;

/// 信号量允许的最大配额，超过会导致 `Semaphore::new` panic
pub const MAX_PERMITS: usize = Semaphore::MAX_PERMITS;

/// 路由已无人使用时移除其配额
///
/// map 自身持有一份引用；许可和等待者各持有一份，只剩 map 时即为空闲
fn remove_if_idle(routes: &Mutex<HashMap<String, Arc<Semaphore>>>, route: &str) {
    let mut routes = routes.lock();
    if routes
        .get(route)
        .is_some_and(|semaphore| Arc::strong_count(semaphore) == 1)
    {
        routes.remove(route);
    }
}

/// 连接槽位 Guard
///
/// 同时持有路由配额和总配额，Drop 时一并归还
#[derive(Debug)]
pub struct RoutePermit {
    route: String,
    routes: RouteMap,
    route_permit: Option<OwnedSemaphorePermit>,
    _total_permit: Option<OwnedSemaphorePermit>,
}

impl RoutePermit {
    pub fn route(&self) -> &str {
        &self.route
    }
}

impl Drop for RoutePermit {
    fn drop(&mut self) {
        // 先归还路由配额，才能判断该路由是否空闲
        drop(self.route_permit.take());
        remove_if_idle(&self.routes, &self.route);
    }
}

/// 连接数限制器
#[derive(Debug)]
pub struct ConnectionLimiter {
    max_per_route: usize,
    max_total: usize,
    total: Arc<Semaphore>,
    /// 路由配额按需创建，空闲后移除
    routes: RouteMap,
}

impl ConnectionLimiter {
    /// 两个上限都必须在 1..=MAX_PERMITS 之内，由 `PoolLimits` 校验
    pub(crate) fn new(max_per_route: usize, max_total: usize) -> Self {
        Self {
            max_per_route,
            max_total,
            total: Arc::new(Semaphore::new(max_total)),
            routes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn route_semaphore(&self, route: &str) -> Arc<Semaphore> {
        self.routes
            .lock()
            .entry(route.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.max_per_route)))
            .clone()
    }

    fn permit(&self, route: &str, route_permit: OwnedSemaphorePermit) -> RoutePermit {
        RoutePermit {
            route: route.to_string(),
            routes: self.routes.clone(),
            route_permit: Some(route_permit),
            _total_permit: None,
        }
    }

    /// 获取连接槽位，配额不足时异步等待
    ///
    /// 先取路由配额再取总配额，等待单个路由时不占用总配额
    pub async fn acquire(&self, route: &str) -> anyhow::Result<RoutePermit> {
        let route_semaphore = self.route_semaphore(route);
        if route_semaphore.available_permits() == 0 {
            tracing::debug!(
                "路由 {} 连接数已达上限 {}，等待空闲连接",
                route,
                self.max_per_route
            );
        }
        let route_permit = route_semaphore
            .acquire_owned()
            .await
            .with_context(|| format!("路由 {} 的连接配额已关闭", route))?;
        // 等待总配额期间被取消时，由 Guard 负责清理路由
        let mut permit = self.permit(route, route_permit);

        if self.total.available_permits() == 0 {
            tracing::debug!("总连接数已达上限 {}，等待空闲连接", self.max_total);
        }
        permit._total_permit = Some(
            self.total
                .clone()
                .acquire_owned()
                .await
                .context("总连接配额已关闭")?,
        );

        Ok(permit)
    }

    /// 非阻塞获取连接槽位，任一配额不足时返回 None
    pub fn try_acquire(&self, route: &str) -> Option<RoutePermit> {
        let route_permit = self.route_semaphore(route).try_acquire_owned();
        let total_permit = self.total.clone().try_acquire_owned();
        match (route_permit, total_permit) {
            (Ok(route_permit), Ok(total_permit)) => {
                let mut permit = self.permit(route, route_permit);
                permit._total_permit = Some(total_permit);
                Some(permit)
            }
            (route_permit, _) => {
                drop(route_permit);
                remove_if_idle(&self.routes, route);
                None
            }
        }
    }

    /// 剩余总配额
    pub fn available_total(&self) -> usize {
        self.total.available_permits()
    }

    /// 指定路由的剩余配额（当前无人使用的路由返回完整配额）
    pub fn available_for(&self, route: &str) -> usize {
        self.routes
            .lock()
            .get(route)
            .map(|s| s.available_permits())
            .unwrap_or(self.max_per_route)
    }

    /// 当前仍在跟踪的路由数
    pub fn tracked_routes(&self) -> usize {
        self.routes.lock().len()
    }
}
