//! Daemon lifecycle: collaborators, boot-time key bring-up, shutdown

use anyhow::{Context, Result};
use elk_core::{ElkConfig, StatusCode};
use elk_crypto::{MnemonicEscrow, SoftKeyStore};
use elk_keys::{mark_key_roots, Collaborators, KeyManager, PermissionMarker, ProcessKeyring};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

use crate::service::KeyService;

/// Build the key manager from `config` and its collaborators.
pub fn build_manager(config: &ElkConfig) -> Result<KeyManager> {
    let keystore = SoftKeyStore::open(
        &config.crypto.root_key_file,
        config.crypto.hardware_available,
    )
    .with_context(|| {
        format!(
            "opening key store seed {}",
            config.crypto.root_key_file.display()
        )
    })?;
    let collaborators = Collaborators {
        keystore: Arc::new(keystore),
        fscrypt: Arc::new(ProcessKeyring::new()),
        escrow: Arc::new(MnemonicEscrow),
    };
    Ok(KeyManager::new(config, collaborators, Handle::current()))
}

/// Mark key roots, migrate legacy keys, and bring up the global keys.
pub async fn boot(service: &KeyService) -> Result<()> {
    let roots = service.manager().key_roots();
    let marked =
        tokio::task::spawn_blocking(move || mark_key_roots(&PermissionMarker, &roots)).await?;
    info!(marked, "key roots marked");

    let (status, upgraded) = service.upgrade_keys().await;
    if status.is_ok() {
        info!(upgraded = upgraded.unwrap_or(0), "key upgrade pass complete");
    } else {
        warn!(status = status.as_i32(), "some legacy keys could not be upgraded");
    }

    let status = service.init_global_device_key().await;
    if status != StatusCode::Ok {
        anyhow::bail!("device key bring-up failed (status {})", status.as_i32());
    }
    let status = service.init_global_user_keys().await;
    if status != StatusCode::Ok {
        anyhow::bail!("global user key bring-up failed (status {})", status.as_i32());
    }
    Ok(())
}

pub async fn run(config: ElkConfig) -> Result<()> {
    info!("daemon starting");

    let manager = build_manager(&config)?;
    let service = KeyService::new(Arc::new(manager));
    boot(&service).await?;

    let mut sigterm = signal(SignalKind::terminate()).context("registering SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("registering SIGINT handler")?;
    info!(
        storage_root = %config.keys.storage_root.display(),
        "elkd ready"
    );

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }

    service.shutdown().await;
    info!("daemon stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(root: &std::path::Path) -> ElkConfig {
        let mut config = ElkConfig::default();
        config.keys.storage_root = root.join("keys");
        config.keys.device_key_dir = root.join("device");
        config.keys.data_root = root.join("data");
        config.crypto.root_key_file = root.join("root.key");
        config.crypto.argon2_mem_cost_kib = 1024;
        config.crypto.argon2_time_cost = 1;
        config.crypto.argon2_parallelism = 1;
        config.recovery.escrow_dir = root.join("recovery");
        config
    }

    #[tokio::test]
    async fn test_boot_twice_reuses_keys() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());

        let first = KeyService::new(Arc::new(tokio_test::assert_ok!(build_manager(&config))));
        boot(&first).await.unwrap();
        first.shutdown().await;
        let device_dir = config.keys.device_key_dir.clone();
        let versions = std::fs::read_dir(&device_dir).unwrap().count();

        let second = KeyService::new(Arc::new(tokio_test::assert_ok!(build_manager(&config))));
        boot(&second).await.unwrap();
        assert_eq!(std::fs::read_dir(&device_dir).unwrap().count(), versions);
        assert!(config.crypto.root_key_file.exists());
    }

    #[tokio::test]
    async fn test_bad_seed_fails_startup() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        std::fs::write(&config.crypto.root_key_file, b"short").unwrap();
        assert!(build_manager(&config).is_err());
    }
}
