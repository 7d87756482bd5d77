use std::time::Duration;

use russh::Disconnect;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    time::{sleep, timeout},
};

use crate::common::{connect_tunnel, echo_server, start_server};

/// This test ensures that tunnel clients must present valid credentials,
/// and that their session is bound for as long as they stay connected.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn ssh_password_authentication() {
    // 1. Initialize portcullis with a single user
    let (server, address) = start_server(&["--auth=alice:s3cret"]).await;
    assert!(server.authentication_required());
    let echo = echo_server().await;

    // 2. Connect over a tunnel upgrade
    let mut session = connect_tunnel(address, server.fingerprint())
        .await
        .expect("Failed to connect to tunnel");
    assert!(
        !session
            .authenticate_none("alice")
            .await
            .expect("SSH authentication failed")
            .success(),
        "anonymous login shouldn't be allowed"
    );
    assert!(
        !session
            .authenticate_password("alice", "wrong")
            .await
            .expect("SSH authentication failed")
            .success(),
        "wrong password shouldn't be allowed"
    );
    assert!(server.sessions().is_empty());
    assert!(
        session
            .authenticate_password("alice", "s3cret")
            .await
            .expect("SSH authentication failed")
            .success(),
        "authentication didn't succeed"
    );
    assert_eq!(server.sessions().len(), 1);

    // 3. Forward a connection through the tunnel
    let channel = session
        .channel_open_direct_tcpip("127.0.0.1", echo.port().into(), "127.0.0.1", 12345)
        .await
        .expect("channel_open_direct_tcpip failed");
    let mut stream = channel.into_stream();
    stream.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .expect("Timed out waiting for echo")
        .unwrap();
    assert_eq!(&buf, b"ping");

    // 4. The session binding goes away with the connection
    session
        .disconnect(Disconnect::ByApplication, "", "English")
        .await
        .unwrap();
    drop(stream);
    drop(session);
    if timeout(Duration::from_secs(5), async {
        while !server.sessions().is_empty() {
            sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .is_err()
    {
        panic!("Session binding wasn't removed on disconnect.")
    };
    server.close();
}
