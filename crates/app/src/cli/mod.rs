pub mod args;
pub mod op;
pub mod ops;

pub use ops::{Collections, Init, Migrate, Status, Version};
