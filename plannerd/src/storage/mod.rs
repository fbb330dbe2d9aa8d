pub mod cursor_storage;
pub mod device;
pub mod token_storage;

pub use cursor_storage::{Backend, CursorError, CursorSnapshot, CursorStorage};
pub use device::load_or_create_device_id;
pub use token_storage::{StorageError, StoredCredential, TokenStorage};
