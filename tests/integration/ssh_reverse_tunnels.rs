use std::time::Duration;

use tokio::{
    io::AsyncReadExt,
    net::TcpStream,
    time::{sleep, timeout},
};

use crate::common::{connect_tunnel, free_port, start_server};

/// This test ensures that reverse tunnels are refused unless enabled.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn ssh_reverse_tunnels_disabled() {
    let (server, address) = start_server(&["--auth=alice:s3cret"]).await;
    let mut session = connect_tunnel(address, server.fingerprint())
        .await
        .expect("Failed to connect to tunnel");
    assert!(
        session
            .authenticate_password("alice", "s3cret")
            .await
            .expect("SSH authentication failed")
            .success()
    );
    assert!(
        session.tcpip_forward("127.0.0.1", free_port().into()).await.is_err(),
        "reverse tunnel shouldn't be allowed"
    );
    server.close();
}

/// This test ensures that reverse tunnels accept connections and hand them back to the client.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn ssh_reverse_tunnels_enabled() {
    // 1. Initialize portcullis with reverse tunnels
    let (server, address) = start_server(&["--auth=alice:s3cret", "--reverse"]).await;
    let mut session = connect_tunnel(address, server.fingerprint())
        .await
        .expect("Failed to connect to tunnel");
    assert!(
        session
            .authenticate_password("alice", "s3cret")
            .await
            .expect("SSH authentication failed")
            .success()
    );

    // 2. Request a reverse tunnel
    let port = free_port();
    session
        .tcpip_forward("127.0.0.1", port.into())
        .await
        .expect("tcpip_forward failed");

    // 3. Connections to the bound port reach the client
    let mut stream = TcpStream::connect(("127.0.0.1", port))
        .await
        .expect("TCP connection failed");
    let mut buf = String::with_capacity(13);
    timeout(Duration::from_secs(5), stream.read_to_string(&mut buf))
        .await
        .expect("Timed out waiting for reverse tunnel")
        .unwrap();
    assert_eq!(buf, "Hello, world!");

    // 4. Cancelling the tunnel stops the listener
    session
        .cancel_tcpip_forward("127.0.0.1", port.into())
        .await
        .expect("cancel_tcpip_forward failed");
    if timeout(Duration::from_secs(5), async {
        while TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .is_err()
    {
        panic!("Reverse tunnel listener wasn't closed.")
    };
    server.close();
}
