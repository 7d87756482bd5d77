use std::time::Duration;

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    time::timeout,
};

use crate::common::{connect_tunnel, echo_server, start_server};

/// This test ensures that without any registered users, every tunnel client is accepted
/// and no session is bound.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn ssh_open_mode() {
    // 1. Initialize portcullis without users
    let (server, address) = start_server(&[]).await;
    assert!(!server.authentication_required());
    let echo = echo_server().await;

    // 2. Any credentials are accepted
    let mut session = connect_tunnel(address, server.fingerprint())
        .await
        .expect("Failed to connect to tunnel");
    assert!(
        session
            .authenticate_password("x", "y")
            .await
            .expect("SSH authentication failed")
            .success(),
        "open mode should accept any credentials"
    );
    assert!(server.sessions().is_empty());

    // 3. Any destination may be reached
    let channel = session
        .channel_open_direct_tcpip("localhost", echo.port().into(), "127.0.0.1", 12345)
        .await
        .expect("channel_open_direct_tcpip failed");
    let mut stream = channel.into_stream();
    stream.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .expect("Timed out waiting for echo")
        .unwrap();
    assert_eq!(&buf, b"hello");
    server.close();
}
