/// 环境变量代理隔离测试
///
/// 单独的测试二进制：修改进程环境变量不会影响其他测试。
///
/// 测试内容:
///   未配置代理时，即使设置了 HTTP_PROXY / ALL_PROXY，请求也直连目标

use std::time::Duration;

use pooled_http_client::{PoolLimits, TlsBackend, build_client};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// 接收一个请求并回复 200，返回小写的请求头
async fn spawn_one_shot_server(body: &'static str) -> (String, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut head = Vec::new();
        let mut buf = [0u8; 1024];
        while !head.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            head.extend_from_slice(&buf[..n]);
        }
        let reply = format!(
            "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        socket.write_all(reply.as_bytes()).await.unwrap();
        socket.shutdown().await.ok();
        String::from_utf8_lossy(&head).to_lowercase()
    });
    (format!("http://{}", addr), handle)
}

#[tokio::test]
async fn test_env_proxy_ignored_without_proxy_config() {
    let (env_proxy_url, env_proxy) = spawn_one_shot_server("via-env-proxy").await;
    let (target_url, target) = spawn_one_shot_server("direct").await;

    // 本二进制只有这一个测试，修改环境变量时没有其他线程读取
    unsafe {
        for key in ["HTTP_PROXY", "http_proxy", "ALL_PROXY", "all_proxy"] {
            std::env::set_var(key, &env_proxy_url);
        }
        for key in ["NO_PROXY", "no_proxy"] {
            std::env::remove_var(key);
        }
    }

    let client = build_client(PoolLimits::default(), None, TlsBackend::Rustls).unwrap();
    assert!(client.proxy_route().is_none());

    let response = client
        .send(client.get(format!("{}/direct", target_url)))
        .await
        .unwrap();
    assert_eq!(response.text().await.unwrap(), "direct");

    let head = target.await.unwrap();
    assert!(head.starts_with("get /direct http/1.1"));

    // 环境变量中的代理不应收到任何连接
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!env_proxy.is_finished());
    env_proxy.abort();
}
