pub mod records;
pub mod system;
