//! Runs against a real OpenSSH server. Enable with `--features ssh-e2e` and
//! point it at a throwaway account:
//!
//! ```text
//! SFB_E2E_HOST=127.0.0.1 SFB_E2E_PORT=2222 SFB_E2E_USER=u SFB_E2E_PASSWORD=p
//! ```
#![cfg(feature = "ssh-e2e")]

use sfb_core::config::CoreConfig;
use sfb_sftp::sftp::*;

fn e2e_config() -> Option<ConnectionConfig> {
    let host = std::env::var("SFB_E2E_HOST").ok()?;
    let user = std::env::var("SFB_E2E_USER").ok()?;
    let password = std::env::var("SFB_E2E_PASSWORD").ok()?;
    let mut cfg = ConnectionConfig::with_password(&host, &user, &password);
    if let Some(port) = std::env::var("SFB_E2E_PORT").ok().and_then(|p| p.parse().ok()) {
        cfg.port = port;
    }
    Some(cfg)
}

#[tokio::test]
async fn test_upload_list_download_roundtrip() {
    let Some(cfg) = e2e_config() else {
        eprintln!("SFB_E2E_* not set, skipping");
        return;
    };
    let svc = SftpService::with_ssh(CoreConfig {
        chunk_size: 32 * 1024,
        ..CoreConfig::default()
    });
    let info = svc.connect(cfg).await.unwrap();
    let home = info.remote_home.clone().unwrap_or_else(|| ".".into());

    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src.bin");
    let data: Vec<u8> = (0..200_000u32).map(|i| (i % 253) as u8).collect();
    std::fs::write(&src, &data).unwrap();

    let remote_path = format!("{}/sfb-e2e-{}.bin", home.trim_end_matches('/'), std::process::id());
    let up = svc.upload(&src, &remote_path);
    assert!(matches!(
        svc.subscribe_token(up).wait_terminal(up).await,
        Some(TransferOutcome::Completed { .. })
    ));

    let listing = svc.list_directory(&home).await.unwrap();
    assert!(listing.iter().any(|e| e.path == remote_path && e.size_bytes == data.len() as u64));

    let dst = dir.path().join("dst.bin");
    let down = svc.download(&remote_path, &dst);
    assert!(matches!(
        svc.subscribe_token(down).wait_terminal(down).await,
        Some(TransferOutcome::Completed { .. })
    ));
    assert_eq!(std::fs::read(&dst).unwrap(), data);

    svc.disconnect().await;
}
