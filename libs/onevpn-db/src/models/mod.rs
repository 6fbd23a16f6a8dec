pub mod device;
pub mod payment;
pub mod provisioning;
pub mod user;
