pub mod bus;
pub mod creds;
pub mod crypto;
pub mod error;
pub mod guid;
pub mod introspect;
pub mod msg;
pub mod sec;
pub mod types;

pub use bus::{AuthCallback, BusAttachment, PasswordCallback};
pub use creds::{CredType, CredentialRecord, CredentialStore, MemoryCredentialStore, SledCredentialStore};
pub use error::{BusError, Result};
pub use guid::{KeyRole, NameMap};
pub use introspect::{Interface, Object, ObjectLists};
pub use msg::{Message, MsgType, FLAG_ENCRYPTED};
pub use sec::*;
pub use types::*;
