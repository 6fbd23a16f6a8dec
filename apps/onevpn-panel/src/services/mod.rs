pub mod account_service;
pub mod admin_auth_service;
pub mod billing_service;
pub mod daily_billing_service;
pub mod notification_service;
pub mod pricing_service;
pub mod provisioning;
pub mod settings_service;
pub mod subscription_service;
