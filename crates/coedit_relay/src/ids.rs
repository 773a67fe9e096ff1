//! Session id generation

use std::fmt::Debug;

use uuid::Uuid;

/// Source of opaque, globally unique session ids.
pub trait IdGenerator: Send + Sync + Debug {
    fn generate(&self) -> String;
}

/// Random v4 UUIDs in their 32 hex digit form.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn generate(&self) -> String {
        Uuid::new_v4().simple().to_string()
    }
}
