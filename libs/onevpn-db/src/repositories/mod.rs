pub mod device_repo;
pub mod payment_repo;
pub mod provisioning_repo;
pub mod settings_repo;
pub mod user_repo;
