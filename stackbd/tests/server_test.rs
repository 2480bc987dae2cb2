//! End-to-end NBD tests: a real client over an in-memory duplex stream,
//! against chains of built-in layers.

use std::sync::Arc;

use nbd::{NbdClient, NbdError, NBD_CMD_FLAG_FAST_ZERO, NBD_CMD_FLAG_FUA, NBD_EINVAL, NBD_EPERM};
use tokio::io::{duplex, DuplexStream};

use stackbd::layers::{MemoryLayer, OffsetLayer, ReadonlyLayer};
use stackbd::{Chain, Config, ConnQueue, Daemon, ExportConfig, Layer, NbdServer};

const SIZE: u64 = 1 << 20; // 1 MiB

fn export() -> ExportConfig {
    ExportConfig {
        name: "stackbd".to_string(),
        readonly: false,
    }
}

async fn connect(chain: Arc<Chain>, export_name: &str) -> Result<NbdClient<DuplexStream>, NbdError> {
    let (client_stream, server_stream) = duplex(1 << 20);
    let server = NbdServer::new(chain, export());
    tokio::spawn(async move {
        let _ = server.serve(server_stream).await;
    });
    NbdClient::connect(client_stream, export_name).await
}

fn memory_chain(filters: Vec<Arc<dyn Layer>>) -> Arc<Chain> {
    Chain::build(Arc::new(MemoryLayer::new(SIZE)), filters).unwrap()
}

#[tokio::test]
async fn negotiates_capabilities_from_the_chain() {
    let client = connect(memory_chain(vec![]), "stackbd").await.unwrap();

    assert_eq!(client.size_bytes, SIZE);
    assert!(!client.is_read_only());
    assert!(client.supports_flush());
    assert!(client.supports_fua());
    assert!(client.supports_trim());
    assert!(client.supports_write_zeroes());
    assert!(client.supports_fast_zero());
    assert!(client.supports_cache());
    assert!(client.supports_multi_conn());
}

#[tokio::test]
async fn read_write_roundtrip() {
    let mut client = connect(memory_chain(vec![]), "stackbd").await.unwrap();

    let pattern: Vec<u8> = (0..8192).map(|i| i as u8).collect();
    client.write(4096, &pattern).await.unwrap();

    let data = client.read(4096, 8192).await.unwrap();
    assert_eq!(&data[..], &pattern[..]);

    // Unwritten space reads as zeroes.
    let hole = client.read(100_000, 512).await.unwrap();
    assert!(hole.iter().all(|&b| b == 0));

    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn fua_flush_zero_trim_and_cache() {
    let mut client = connect(memory_chain(vec![]), "stackbd").await.unwrap();

    client
        .write_flags(0, &[0xAA; 4096], NBD_CMD_FLAG_FUA)
        .await
        .unwrap();
    client.flush().await.unwrap();

    client.write_zeroes(0, 1024).await.unwrap();
    let data = client.read(0, 2048).await.unwrap();
    assert!(data[..1024].iter().all(|&b| b == 0));
    assert!(data[1024..].iter().all(|&b| b == 0xAA));

    client
        .write_zeroes_flags(1024, 1024, NBD_CMD_FLAG_FAST_ZERO)
        .await
        .unwrap();

    client.trim(0, 4096).await.unwrap();
    let data = client.read(0, 4096).await.unwrap();
    assert!(data.iter().all(|&b| b == 0));

    client.cache(0, 65536).await.unwrap();
}

#[tokio::test]
async fn out_of_range_requests_get_einval() {
    let mut client = connect(memory_chain(vec![]), "stackbd").await.unwrap();

    let err = client.read(SIZE - 256, 512).await.unwrap_err();
    assert!(matches!(err, NbdError::Remote(code) if code == NBD_EINVAL));
}

#[tokio::test]
async fn readonly_filter_is_advertised_and_enforced() {
    let chain = memory_chain(vec![Arc::new(ReadonlyLayer)]);
    let mut client = connect(chain, "stackbd").await.unwrap();

    assert!(client.is_read_only());
    assert!(!client.supports_trim());
    assert!(!client.supports_write_zeroes());
    assert!(!client.supports_fua());

    let err = client.write(0, &[1u8; 512]).await.unwrap_err();
    assert!(matches!(err, NbdError::Remote(code) if code == NBD_EPERM));

    // Reads still work.
    let data = client.read(0, 512).await.unwrap();
    assert!(data.iter().all(|&b| b == 0));
}

#[tokio::test]
async fn offset_filter_shrinks_the_export() {
    let chain = memory_chain(vec![Arc::new(OffsetLayer::new(4096, None))]);
    let mut client = connect(chain, "stackbd").await.unwrap();

    assert_eq!(client.size_bytes, SIZE - 4096);
    client.write(0, b"windowed").await.unwrap();
    let data = client.read(0, 8).await.unwrap();
    assert_eq!(&data[..], b"windowed");
}

#[tokio::test]
async fn unknown_export_is_refused() {
    let err = connect(memory_chain(vec![]), "not-an-export")
        .await
        .unwrap_err();
    assert!(matches!(err, NbdError::Handshake(_)));
}

#[tokio::test]
async fn empty_export_name_selects_the_default() {
    let mut client = connect(memory_chain(vec![]), "").await.unwrap();
    assert_eq!(client.size_bytes, SIZE);
    client.write(0, b"default").await.unwrap();
}

#[tokio::test]
async fn daemon_serves_configured_chains() {
    let config = Config {
        plugin: stackbd::PluginConfig {
            name: "memory".to_string(),
            size_bytes: 65536,
        },
        ..Config::default()
    };
    let daemon = Daemon::from_config(config).unwrap();

    let (tx, listener) = ConnQueue::new(2);
    let server = daemon.clone();
    tokio::spawn(async move {
        let _ = server.listen(listener).await;
    });

    let (client_stream, server_stream) = duplex(1 << 20);
    tx.send(server_stream).await.unwrap();

    let mut client = NbdClient::connect(client_stream, "stackbd").await.unwrap();
    assert_eq!(client.size_bytes, 65536);
    client.write(0, b"via daemon").await.unwrap();
    let data = client.read(0, 10).await.unwrap();
    assert_eq!(&data[..], b"via daemon");

    drop(tx);
    daemon.shutdown().await;
}
