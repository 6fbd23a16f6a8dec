use anyhow::{Context, Result};

use crate::state::AppState;

pub async fn run_sweep(state: &AppState) -> Result<()> {
    let report = state.biller.run_daily_sweep_once().await?;
    if report.skipped {
        println!("Today has already been billed, nothing to do.");
        return Ok(());
    }
    println!(
        "Billed: {}\nSuspended: {}\nBanned: {}\nFailed: {}\nProvisioning failures: {}",
        report.billed, report.suspended, report.banned, report.failed, report.provisioning_failures
    );
    Ok(())
}

pub async fn show_price(state: &AppState) -> Result<()> {
    println!("Price per device per day: {}", state.pricing.get_price().await);
    Ok(())
}

pub async fn set_price(state: &AppState, raw: &str) -> Result<()> {
    let price = state.pricing.set_price(raw).await?;
    println!("Price per device per day set to {}", price);
    Ok(())
}

pub async fn reconcile_user(state: &AppState, telegram_id: &str) -> Result<()> {
    let user = state
        .accounts
        .users
        .get_by_telegram_id(telegram_id)
        .await?
        .with_context(|| format!("No user with telegram id {}", telegram_id))?;

    let reconciled = state
        .subscriptions
        .recalc_subscription(user.id)
        .await?
        .with_context(|| format!("User {} disappeared", user.id))?;

    let end = reconciled
        .user
        .subscription_end
        .map(|e| e.to_rfc3339())
        .unwrap_or_else(|| "-".to_string());
    println!("User {} (tg {})", reconciled.user.id, telegram_id);
    println!("  balance:          {}", reconciled.user.balance);
    println!("  allowed devices:  {}", reconciled.outcome.allowed_devices);
    println!("  estimated days:   {}", reconciled.outcome.estimated_days);
    println!("  subscription end: {}", end);
    println!("  suspended:        {}", reconciled.outcome.link_suspended);
    println!("  provisioning:     {:?}", reconciled.outcome.provisioning);
    Ok(())
}
