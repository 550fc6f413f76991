use std::time::Duration;

use taskfold::shutdown::{install_shutdown_handler, on_termination};
use tokio::sync::oneshot;

async fn send_signal(signal: &str) {
    let status = tokio::process::Command::new("kill")
        .arg(format!("-{}", signal))
        .arg(std::process::id().to_string())
        .status()
        .await
        .unwrap();
    assert!(status.success());
}

// Both checks share one test: signals are process-wide
#[tokio::test]
async fn test_termination_signals_are_translated() {
    let (tx, rx) = oneshot::channel();
    let handle = on_termination(move |name| {
        let _ = tx.send(name);
    })
    .unwrap();

    send_signal("TERM").await;
    let name = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(name, "SIGTERM");
    handle.await.unwrap();

    let token = install_shutdown_handler().unwrap();
    assert!(!token.is_cancelled());
    send_signal("INT").await;
    tokio::time::timeout(Duration::from_secs(5), token.cancelled())
        .await
        .unwrap();
}
