use crate::common::{connect_tunnel, start_server};

/// This test ensures that clients can pin the server by its fingerprint,
/// which stays the same for the same key seed.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn ssh_server_fingerprint() {
    // 1. Initialize two servers from the same seed
    let (first, address) = start_server(&[]).await;
    let (second, _) = start_server(&[]).await;
    assert_eq!(first.fingerprint(), second.fingerprint());

    // 2. A client expecting another key refuses to connect
    assert!(
        connect_tunnel(address, "SHA256:not-the-server-key")
            .await
            .is_err(),
        "client shouldn't accept an unknown server key"
    );

    // 3. A client expecting the right key connects
    let mut session = connect_tunnel(address, first.fingerprint())
        .await
        .expect("Failed to connect to tunnel");
    assert!(
        session
            .authenticate_none("anyone")
            .await
            .expect("SSH authentication failed")
            .success()
    );
    first.close();
    second.close();
}
