//! HTTP Client 构建模块
//!
//! Input: 连接池上限、可选代理配置、TLS 后端
//! Output: PooledHttpClient（可克隆，线程间共享）
//! Pos: reqwest::ClientBuilder 的薄适配层，连接池与代理认证的唯一装配点

use std::sync::Arc;

use anyhow::{Context, bail};
use reqwest::header::HeaderMap;
use reqwest::{
    Client, IntoUrl, Method, Proxy, Request, RequestBuilder, Response, StatusCode, Url, redirect,
};
use serde::de::DeserializeOwned;

use crate::model::config::{Config, HttpSection, TlsBackend};
use crate::pool::{ConnectionLimiter, MAX_PERMITS, RoutePermit};

/// 同一路由内最多跟随的重定向次数
const MAX_REDIRECTS: usize = 10;
use crate::proxy::{AuthScope, ProxyProperties, ProxyRoute, parse_proxy_url};

/// 代理配置
#[derive(Debug, Clone, Default)]
pub struct ProxyConfig {
    /// 代理 URL，支持 http/https/socks5
    pub url: String,
    /// 代理认证用户名
    pub username: Option<String>,
    /// 代理认证密码
    pub password: Option<String>,
}

impl ProxyConfig {
    /// 从 URL 创建代理配置
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: None,
            password: None,
        }
    }

    /// 设置认证信息
    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }
}

/// 连接池上限
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLimits {
    /// 单个路由最大并发连接数
    pub max_per_route: usize,
    /// 所有路由合计最大并发连接数
    pub max_total: usize,
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self::from_config(&HttpSection::default())
    }
}

impl PoolLimits {
    pub fn new(max_per_route: usize, max_total: usize) -> Self {
        Self {
            max_per_route,
            max_total,
        }
    }

    pub fn from_config(http: &HttpSection) -> Self {
        Self::new(
            http.pooled_max_connections_per_route,
            http.pooled_max_total_connections,
        )
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.max_per_route == 0 || self.max_per_route > MAX_PERMITS {
            bail!(
                "pooledMaxConnectionsPerRoute 必须在 1..={} 之间: {}",
                MAX_PERMITS,
                self.max_per_route
            );
        }
        if self.max_total == 0 || self.max_total > MAX_PERMITS {
            bail!(
                "pooledMaxTotalConnections 必须在 1..={} 之间: {}",
                MAX_PERMITS,
                self.max_total
            );
        }
        Ok(())
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

/// 构建 HTTP Client
///
/// # Arguments
/// * `limits` - 连接池上限
/// * `proxy` - 可选的代理配置；为 None 时不走任何代理（包括环境变量中的代理）
/// * `tls_backend` - TLS 后端
///
/// 只有用户名和密码都非空时才启用代理认证，凭据只对代理的 host:port 生效。
/// 构建失败直接返回错误，不做重试。
pub fn build_client(
    limits: PoolLimits,
    proxy: Option<&ProxyConfig>,
    tls_backend: TlsBackend,
) -> anyhow::Result<PooledHttpClient> {
    limits.validate()?;

    let mut builder = Client::builder()
        .pool_max_idle_per_host(limits.max_per_route)
        .redirect(redirect_policy());

    if tls_backend == TlsBackend::Rustls {
        builder = builder.use_rustls_tls();
    }

    let mut proxy_route = None;
    let mut auth_scope = None;

    match proxy {
        Some(proxy_config) => {
            let parsed = parse_proxy_url(&proxy_config.url)?;
            let mut proxy = Proxy::all(parsed.url.as_str())
                .with_context(|| format!("无效的代理地址: {}", parsed.route))?;

            // 显式配置优先，其次是 URL 中内嵌的认证信息
            let username = non_empty(proxy_config.username.clone().or(parsed.username));
            let password = non_empty(proxy_config.password.clone().or(parsed.password));
            if let (Some(username), Some(password)) = (username, password) {
                proxy = proxy.basic_auth(&username, &password);
                auth_scope = Some(AuthScope::from(&parsed.route));
            }

            builder = builder.proxy(proxy);
            tracing::debug!(
                "HTTP Client 使用代理: {} (认证: {})",
                parsed.route,
                if auth_scope.is_some() { "启用" } else { "未启用" }
            );
            proxy_route = Some(parsed.route);
        }
        None => {
            builder = builder.no_proxy();
        }
    }

    let client = builder.build().context("构建 HTTP Client 失败")?;

    tracing::info!(
        "HTTP Client 已创建: 单路由上限 {}, 总上限 {}, 代理 {}",
        limits.max_per_route,
        limits.max_total,
        proxy_route
            .as_ref()
            .map(|r| r.to_string())
            .unwrap_or_else(|| "无".to_string())
    );

    Ok(PooledHttpClient {
        client,
        limiter: Arc::new(ConnectionLimiter::new(limits.max_per_route, limits.max_total)),
        limits,
        proxy_route,
        auth_scope,
    })
}

/// 从应用配置构建 HTTP Client
pub fn build_client_from_config(config: &Config) -> anyhow::Result<PooledHttpClient> {
    let proxy = ProxyProperties::from_config(&config.http)?.to_proxy_config();
    build_client(
        PoolLimits::from_config(&config.http),
        proxy.as_ref(),
        config.tls_backend,
    )
}

/// 请求的路由标识: scheme://host:port
fn route_key(url: &Url) -> anyhow::Result<String> {
    let host = url
        .host_str()
        .ok_or_else(|| anyhow::anyhow!("请求地址缺少主机名: {}", url))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| anyhow::anyhow!("无法确定请求端口: {}", url))?;
    Ok(format!("{}://{}:{}", url.scheme(), host, port))
}

fn same_route(a: &Url, b: &Url) -> bool {
    matches!((route_key(a), route_key(b)), (Ok(a), Ok(b)) if a == b)
}

/// 重定向策略
///
/// 连接槽位按原始请求的路由占用，只跟随同一路由内的重定向；
/// 跨路由的重定向响应原样返回给调用方，由调用方重新发起请求
fn redirect_policy() -> redirect::Policy {
    redirect::Policy::custom(|attempt| {
        if attempt.previous().len() > MAX_REDIRECTS {
            return attempt.error("重定向次数过多");
        }
        let stays_on_route = attempt
            .previous()
            .first()
            .is_some_and(|origin| same_route(origin, attempt.url()));
        if stays_on_route {
            attempt.follow()
        } else {
            attempt.stop()
        }
    })
}

/// 带连接上限的 HTTP Client
///
/// Clone 成本很低（内部共享），应在进程内构建一次后到处复用。
#[derive(Debug, Clone)]
pub struct PooledHttpClient {
    client: Client,
    limiter: Arc<ConnectionLimiter>,
    limits: PoolLimits,
    proxy_route: Option<ProxyRoute>,
    auth_scope: Option<AuthScope>,
}

impl PooledHttpClient {
    pub fn request<U: IntoUrl>(&self, method: Method, url: U) -> RequestBuilder {
        self.client.request(method, url)
    }

    pub fn get<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.client.get(url)
    }

    pub fn post<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.client.post(url)
    }

    /// 构建并发送请求
    pub async fn send(&self, builder: RequestBuilder) -> anyhow::Result<PooledResponse> {
        let request = builder.build().context("构建请求失败")?;
        self.execute(request).await
    }

    /// 发送请求，先占用连接槽位，响应体读完或丢弃后归还
    ///
    /// 槽位按请求地址的路由计算；跨路由的重定向不会被跟随（见 `redirect_policy`），
    /// 返回的 3xx 响应交由调用方处理
    pub async fn execute(&self, request: Request) -> anyhow::Result<PooledResponse> {
        let route = route_key(request.url())?;
        let permit = self.limiter.acquire(&route).await?;
        let response = self
            .client
            .execute(request)
            .await
            .with_context(|| format!("请求 {} 失败", route))?;
        Ok(PooledResponse {
            response,
            _permit: permit,
        })
    }

    /// 底层 reqwest::Client（不受连接上限约束）
    pub fn inner(&self) -> &Client {
        &self.client
    }

    pub fn limits(&self) -> PoolLimits {
        self.limits
    }

    pub fn limiter(&self) -> &ConnectionLimiter {
        &self.limiter
    }

    /// 代理路由，未配置代理时为 None
    pub fn proxy_route(&self) -> Option<&ProxyRoute> {
        self.proxy_route.as_ref()
    }

    /// 代理认证作用域，未启用代理认证时为 None
    pub fn proxy_auth_scope(&self) -> Option<&AuthScope> {
        self.auth_scope.as_ref()
    }
}

/// 持有连接槽位的响应
#[derive(Debug)]
pub struct PooledResponse {
    response: Response,
    _permit: RoutePermit,
}

impl PooledResponse {
    pub fn status(&self) -> StatusCode {
        self.response.status()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.response.headers()
    }

    pub fn url(&self) -> &Url {
        self.response.url()
    }

    pub async fn text(self) -> anyhow::Result<String> {
        Ok(self.response.text().await?)
    }

    pub async fn bytes(self) -> anyhow::Result<bytes::Bytes> {
        Ok(self.response.bytes().await?)
    }

    pub async fn json<T: DeserializeOwned>(self) -> anyhow::Result<T> {
        Ok(self.response.json().await?)
    }

    /// 取出原始响应并归还连接槽位
    pub fn into_inner(self) -> Response {
        self.response
    }
}
