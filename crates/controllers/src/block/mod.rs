//! Block controllers: the volume mount handshake, the mount automaton built
//! on it, and its consumers.

mod devices;
mod mount;
mod mounter;
mod salt;
mod scoped;

pub use devices::DevicesStatusController;
pub use mount::{DirMounter, Mounter, VolumeMountController};
pub use mounter::{MountState, VolumeMounter};
pub use salt::{EncryptionSaltController, SALT_FILE, SALT_SIZE};
pub use scoped::ScopedDir;
