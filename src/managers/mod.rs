#[cfg(feature = "manager-moka")]
pub mod moka;

#[cfg(feature = "manager-redis")]
pub mod redis;
