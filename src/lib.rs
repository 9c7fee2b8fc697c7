//! 连接池 HTTP Client
//!
//! 按配置的连接上限与正向代理构建共享的 reqwest Client

pub mod http_client;
pub mod model;
pub mod pool;
pub mod proxy;

pub use http_client::{
    PoolLimits, PooledHttpClient, PooledResponse, ProxyConfig, build_client,
    build_client_from_config,
};
pub use model::config::{Config, HttpSection, TlsBackend};
pub use proxy::{AuthScope, ProxyProperties, ProxyRoute};
