#![forbid(unsafe_code)]

mod common;

use std::sync::Arc;

use bastion_controllers::block::{DirMounter, EncryptionSaltController, VolumeMountController, SALT_FILE, SALT_SIZE};
use bastion_resources::block::{mount_id, VolumeMountRequestSpec, VolumeMountStatusSpec, STATE_VOLUME_ID};
use bastion_resources::secrets::{EncryptionSaltSpec, ENCRYPTION_SALT_ID};
use common::{start, state, wait_for, wait_gone};

const REQUESTER: &str = "block.EncryptionSaltController";

async fn run_salt(root: &std::path::Path) -> Vec<u8> {
    let st = state();
    let running = start(
        &st,
        vec![
            Box::new(VolumeMountController::new(Arc::new(DirMounter::new(root)))),
            Box::new(EncryptionSaltController),
        ],
    );

    let salt = wait_for::<EncryptionSaltSpec, _>(&st, ENCRYPTION_SALT_ID, |s| !s.disk_salt.is_empty()).await;
    let id = mount_id(REQUESTER, STATE_VOLUME_ID);
    wait_gone::<VolumeMountRequestSpec>(&st, &id).await;
    wait_gone::<VolumeMountStatusSpec>(&st, &id).await;

    running.stop().await;
    salt.spec.disk_salt
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn salt_generated_on_empty_volume() {
    let tmp = tempfile::tempdir().unwrap();
    let salt = run_salt(tmp.path()).await;
    assert_eq!(salt.len(), SALT_SIZE);

    let path = tmp.path().join("state").join(SALT_FILE);
    assert!(path.exists());
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        assert_eq!(std::fs::metadata(&path).unwrap().permissions().mode() & 0o777, 0o600);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn existing_salt_is_loaded() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("state");
    std::fs::create_dir_all(&dir).unwrap();
    let existing: Vec<u8> = (0..SALT_SIZE as u8).map(|b| b.wrapping_mul(7).wrapping_add(3)).collect();
    let list: Vec<String> = existing.iter().map(u8::to_string).collect();
    let yaml = format!("diskSalt: [{}]\n", list.join(", "));
    std::fs::write(dir.join(SALT_FILE), &yaml).unwrap();

    let salt = run_salt(tmp.path()).await;
    assert_eq!(salt, existing);
    assert_eq!(std::fs::read_to_string(dir.join(SALT_FILE)).unwrap(), yaml);
}
