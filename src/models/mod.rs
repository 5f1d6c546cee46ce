pub mod assignment;
pub mod health;
pub mod proxy;

pub use assignment::*;
pub use health::*;
pub use proxy::*;

#[cfg(test)]
pub(crate) use proxy::test_proxy;
